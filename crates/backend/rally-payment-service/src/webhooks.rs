//! Verified Stripe webhook intake.
//!
//! Every delivery is checked against the signing secret before anything
//! is parsed out of it. Succeeded payment intents that carry a split
//! plan in their metadata get their transfers executed here, which
//! covers intents confirmed client-side with a client secret; the
//! deterministic idempotency keys make re-execution after an inline
//! split a no-op. All handled events are mirrored to the bookkeeping
//! sheet when one is configured.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use serde_json::{Value, json};
use stripe::{
    CheckoutSession, EventObject, EventType, Expandable, Invoice, PaymentIntent, Webhook,
};
use tracing::{debug, info, warn};

use crate::error::{PaymentError, Result};
use crate::service::{AppState, execute_split, latest_charge_id};
use crate::sheets::{self, SheetRow};
use crate::split::{SplitPlan, TransferSpec};

pub async fn handle_stripe_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<Value>> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|value| value.to_str().ok())
        .ok_or(PaymentError::WebhookSignatureInvalid)?;

    let event = Webhook::construct_event(&body, signature, &state.config.stripe.webhook_secret)
        .map_err(|err| {
            warn!(error = %err, "webhook signature rejected");
            PaymentError::WebhookSignatureInvalid
        })?;

    match (&event.type_, &event.data.object) {
        (EventType::PaymentIntentSucceeded, EventObject::PaymentIntent(intent)) => {
            execute_deferred_split(&state, intent).await;
            forward_row(&state, payment_intent_row(intent)).await?;
        }
        (EventType::CheckoutSessionCompleted, EventObject::CheckoutSession(session)) => {
            forward_row(&state, checkout_session_row(session)).await?;
        }
        (EventType::InvoicePaymentSucceeded, EventObject::Invoice(invoice)) => {
            forward_row(&state, invoice_row(invoice)).await?;
        }
        _ => debug!(event_type = %event.type_, "ignoring webhook event"),
    }

    Ok(Json(json!({ "received": true })))
}

/// Runs the transfers recorded in a succeeded intent's metadata. Split
/// execution failures are logged, not bubbled: failing the delivery
/// would make the event source redeliver, and the idempotent transfer
/// keys already protect a manual re-run.
async fn execute_deferred_split(state: &AppState, intent: &PaymentIntent) {
    let Some(raw_splits) = intent.metadata.get("splits_json") else {
        return;
    };
    let Some(transfer_group) = intent.transfer_group.as_deref() else {
        warn!(intent = %intent.id, "split metadata present but no transfer group");
        return;
    };

    let transfers: Vec<TransferSpec> = match serde_json::from_str(raw_splits) {
        Ok(transfers) => transfers,
        Err(err) => {
            warn!(intent = %intent.id, error = %err, "unparseable split metadata");
            return;
        }
    };

    let plan = SplitPlan::from_transfers(transfers);
    let charge_id = latest_charge_id(intent);
    let (created, failed) = execute_split(
        state,
        &intent.id,
        charge_id.as_deref(),
        transfer_group,
        &plan,
    )
    .await;
    info!(
        intent = %intent.id,
        transfers = created.len(),
        failures = failed.len(),
        "deferred split executed"
    );
}

/// Forwards a row to the sheet web app when one is configured. The error
/// path is deliberate: a failed append fails the webhook delivery so the
/// event is redelivered instead of the row being lost.
async fn forward_row(state: &AppState, row: SheetRow) -> Result<()> {
    let Some(webapp_url) = state.config.sheets.webapp_url.as_deref() else {
        warn!(source = %row.source, "sheet logging unconfigured, dropping row");
        return Ok(());
    };
    sheets::append_row(&state.http, webapp_url, &row).await
}

fn expandable_id<T: stripe::Object>(value: &Expandable<T>) -> String
where
    T::Id: ToString,
{
    match value {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(object) => object.id().to_string(),
    }
}

/// A payment intent belongs to a subscription cycle exactly when it was
/// generated by an invoice.
fn invoice_backed(invoice: Option<&Expandable<Invoice>>) -> bool {
    invoice.is_some()
}

fn payment_intent_row(intent: &PaymentIntent) -> SheetRow {
    SheetRow {
        source: "payment_intent.succeeded".to_string(),
        is_subscription: invoice_backed(intent.invoice.as_ref()),
        payment_intent_id: Some(intent.id.to_string()),
        charge_id: latest_charge_id(intent),
        customer_id: intent.customer.as_ref().map(expandable_id),
        subscription_id: None,
        amount: Some(intent.amount),
        currency: Some(intent.currency.to_string()),
        status: Some(intent.status.to_string()),
        name: None,
        email: intent
            .receipt_email
            .clone()
            .or_else(|| intent.metadata.get("email").cloned()),
        created: intent.created,
        metadata: serde_json::to_value(&intent.metadata).unwrap_or(Value::Null),
    }
}

fn checkout_session_row(session: &CheckoutSession) -> SheetRow {
    let details = session.customer_details.as_ref();
    SheetRow {
        source: "checkout.session.completed".to_string(),
        is_subscription: session.subscription.is_some(),
        payment_intent_id: session.payment_intent.as_ref().map(expandable_id),
        charge_id: None,
        customer_id: session.customer.as_ref().map(expandable_id),
        subscription_id: session.subscription.as_ref().map(expandable_id),
        amount: session.amount_total,
        currency: session.currency.map(|c| c.to_string()),
        status: Some(session.payment_status.to_string()),
        name: details.and_then(|d| d.name.clone()),
        email: details.and_then(|d| d.email.clone()),
        created: session.created,
        metadata: serde_json::to_value(&session.metadata).unwrap_or(Value::Null),
    }
}

fn invoice_row(invoice: &Invoice) -> SheetRow {
    SheetRow {
        source: "invoice.payment_succeeded".to_string(),
        is_subscription: true,
        payment_intent_id: invoice.payment_intent.as_ref().map(expandable_id),
        charge_id: invoice.charge.as_ref().map(expandable_id),
        customer_id: invoice.customer.as_ref().map(expandable_id),
        subscription_id: invoice.subscription.as_ref().map(expandable_id),
        amount: invoice.amount_paid,
        currency: invoice.currency.map(|c| c.to_string()),
        status: invoice.status.map(|s| s.to_string()),
        name: invoice.customer_name.clone(),
        email: invoice.customer_email.clone(),
        created: invoice.created.unwrap_or_default(),
        metadata: serde_json::to_value(&invoice.metadata).unwrap_or(Value::Null),
    }
}

// Signature construction needs the signing secret and a valid HMAC, so
// the rejection paths are what is testable here; accepted-event behavior
// is covered by the pure split plan tests this module builds on.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_metadata_round_trips_through_plan_recovery() {
        let transfers = vec![
            TransferSpec {
                destination_account: "acct_a".into(),
                amount: 100,
            },
            TransferSpec {
                destination_account: "acct_b".into(),
                amount: 0,
            },
        ];
        let raw = serde_json::to_string(&transfers).unwrap();
        let recovered: Vec<TransferSpec> = serde_json::from_str(&raw).unwrap();
        let plan = SplitPlan::from_transfers(recovered);
        assert_eq!(plan.total_transfer_amount, 100);
        assert_eq!(plan.transfers.len(), 2);
    }

    #[test]
    fn intent_rows_mark_subscription_only_when_invoice_backed() {
        assert!(!invoice_backed(None));
        let invoice = Expandable::<Invoice>::Id("in_123".parse().unwrap());
        assert!(invoice_backed(Some(&invoice)));
    }
}

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use rally_user_store::PushSubscription;
use serde_json::{Value, json};

use crate::error::{PaymentError, Result};
use crate::push::{DEFAULT_PAYLOAD, PushSender};
use crate::renewal;
use crate::service::{AppState, ChargeOutcome};
use crate::types::{
    AttachPaymentMethodRequest, AttachPaymentMethodResponse, ChargeCartRequest,
    EnsureCustomerRequest, EnsureCustomerResponse, HealthResponse, LookupQuery, LookupResponse,
    SavePushSubscriptionResponse, SetDefaultPaymentMethodRequest, SetDefaultPaymentMethodResponse,
    SplitIntentRequest, SubscribeRequest, SubscribeResponse,
};

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// The charge endpoints keep the wire shape the front-end already
/// handles: soft declines come back 200 with `success: false`, provider
/// faults come back 500 with the provider's message when there is one.
fn charge_failure(err: PaymentError) -> Response {
    match err {
        PaymentError::Split(_)
        | PaymentError::MissingField(_)
        | PaymentError::InvalidField(_) => err.into_response(),
        PaymentError::Stripe(stripe::StripeError::Stripe(ref request_error)) => {
            let message = request_error
                .message
                .clone()
                .unwrap_or_else(|| "Payment processing error".to_string());
            tracing::warn!(error = %err, "charge rejected by provider");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": message })),
            )
                .into_response()
        }
        other => {
            tracing::error!(error = %other, "charge failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": "Internal server error" })),
            )
                .into_response()
        }
    }
}

pub async fn charge_cart(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChargeCartRequest>,
) -> Response {
    let Some(email) = req.email.as_deref().filter(|e| !e.is_empty()) else {
        return PaymentError::MissingField("email").into_response();
    };
    let Some(amount) = req.amount else {
        return PaymentError::MissingField("amount").into_response();
    };
    if amount <= 0 {
        return PaymentError::InvalidField("amount").into_response();
    }

    match state
        .charge_and_split(email, amount, req.transfer_amounts.as_deref())
        .await
    {
        Ok(ChargeOutcome::Completed(response)) => Json(response).into_response(),
        Ok(ChargeOutcome::Rejected(error)) => {
            Json(json!({ "success": false, "error": error })).into_response()
        }
        Err(err) => charge_failure(err),
    }
}

pub async fn create_split_intent(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SplitIntentRequest>,
) -> Response {
    let Some(amount) = req.amount else {
        return PaymentError::MissingField("amount").into_response();
    };
    if amount <= 0 {
        return PaymentError::InvalidField("amount").into_response();
    }
    let Some(payment_method_id) = req.payment_method_id.as_deref().filter(|p| !p.is_empty())
    else {
        return PaymentError::MissingField("paymentMethodId").into_response();
    };

    match state
        .create_split_intent(
            amount,
            payment_method_id,
            req.customer_id.as_deref(),
            req.transfer_amounts.as_deref(),
        )
        .await
    {
        Ok(response) => Json(response).into_response(),
        Err(err) => charge_failure(err),
    }
}

pub async fn ensure_customer(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EnsureCustomerRequest>,
) -> Result<Json<EnsureCustomerResponse>> {
    let email = req
        .email
        .as_deref()
        .filter(|e| !e.is_empty())
        .ok_or(PaymentError::MissingField("email"))?;
    let response = state.ensure_customer(email, req.name.as_deref()).await?;
    Ok(Json(response))
}

pub async fn lookup_customer(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LookupQuery>,
) -> Result<Json<LookupResponse>> {
    let email = query
        .email
        .as_deref()
        .filter(|e| !e.is_empty())
        .ok_or(PaymentError::MissingField("email"))?;
    Ok(Json(state.lookup(email).await?))
}

pub async fn attach_payment_method(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AttachPaymentMethodRequest>,
) -> Result<Json<AttachPaymentMethodResponse>> {
    let customer_id = req
        .customer_id
        .as_deref()
        .ok_or(PaymentError::MissingField("customerId"))?;
    let payment_method_id = req
        .payment_method_id
        .as_deref()
        .ok_or(PaymentError::MissingField("paymentMethodId"))?;
    let response = state
        .attach_payment_method(customer_id, payment_method_id)
        .await?;
    Ok(Json(response))
}

pub async fn set_default_payment_method(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SetDefaultPaymentMethodRequest>,
) -> Result<Json<SetDefaultPaymentMethodResponse>> {
    let email = req
        .email
        .as_deref()
        .filter(|e| !e.is_empty())
        .ok_or(PaymentError::MissingField("email"))?;
    let payment_method_id = req
        .payment_method_id
        .as_deref()
        .ok_or(PaymentError::MissingField("paymentMethodId"))?;
    let response = state.set_default_by_email(email, payment_method_id).await?;
    Ok(Json(response))
}

pub async fn subscribe(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubscribeRequest>,
) -> Result<Json<SubscribeResponse>> {
    let email = req
        .email
        .as_deref()
        .filter(|e| !e.is_empty())
        .ok_or(PaymentError::MissingField("email"))?;
    let payment_method_id = req
        .payment_method_id
        .as_deref()
        .ok_or(PaymentError::MissingField("paymentMethodId"))?;
    let prepay_months = req.prepay_months.unwrap_or(1);
    if prepay_months < 1 {
        return Err(PaymentError::InvalidField("prepayMonths"));
    }
    let response = state
        .subscribe(email, prepay_months, payment_method_id)
        .await?;
    Ok(Json(response))
}

pub async fn run_renewals(State(state): State<Arc<AppState>>) -> Result<Json<Value>> {
    let summary = renewal::run_renewal_batch(
        &state.store,
        state.as_ref(),
        state.config.billing.reference_offset,
        state.config.billing.renewal_concurrency,
    )
    .await?;
    Ok(Json(json!({
        "message": summary.message(),
        "processedCount": summary.processed_count,
        "errorsCount": summary.errors_count,
    })))
}

pub async fn save_push_subscription(
    State(state): State<Arc<AppState>>,
    Json(subscription): Json<PushSubscription>,
) -> Result<Json<SavePushSubscriptionResponse>> {
    state.store.upsert_push_subscription(&subscription).await?;
    Ok(Json(SavePushSubscriptionResponse { saved: true }))
}

/// An empty body sends the default ping payload; anything else must at
/// least be valid JSON before it is fanned out.
pub async fn send_push(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Json<Value>> {
    let payload: Vec<u8> = if body.is_empty() {
        DEFAULT_PAYLOAD.as_bytes().to_vec()
    } else {
        serde_json::from_slice::<Value>(&body)
            .map_err(|_| PaymentError::InvalidField("payload"))?;
        body.to_vec()
    };

    let sender = PushSender::from_config(&state.config.push)?;
    let results = sender.send_to_all(&state.store, &payload).await?;
    let sent = results.iter().filter(|r| r.delivered).count();
    Ok(Json(json!({ "sent": sent, "results": results })))
}

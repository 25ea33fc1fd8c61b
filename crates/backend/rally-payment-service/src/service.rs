use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, FixedOffset, TimeZone, Utc};
use rally_user_store::{EnrollmentRecord, Subscriber, SubscriberUpdate, UserStore};
use stripe::{
    AttachPaymentMethod, CreateCustomer, CreatePaymentIntent, CreateSubscription,
    CreateSubscriptionItems, CreateTransfer, Currency, Customer, CustomerId, Expandable,
    ListCustomers, PaymentIntent, PaymentIntentOffSession, PaymentIntentStatus, PaymentMethod,
    PaymentMethodId, RequestStrategy, Subscription, Transfer, UpdateCustomer,
};
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{PaymentError, Result};
use crate::split::{self, SplitPlan, TransferSpec};
use crate::types::{
    AttachPaymentMethodResponse, ChargeCartResponse, CreatedTransfer, EnsureCustomerResponse,
    LookupResponse, SetDefaultPaymentMethodResponse, SplitIntentResponse, SubscribeResponse,
    TransferFailure,
};

/// Shared application state: one Stripe client, one user store, one
/// outbound HTTP client, cloned cheaply per request.
pub struct AppState {
    pub client: stripe::Client,
    pub store: UserStore,
    pub http: reqwest::Client,
    pub config: Config,
}

/// A charge attempt either completed (possibly with partial transfer
/// failures, which are reported rather than retried inline) or was
/// rejected before any money moved.
pub enum ChargeOutcome {
    Completed(ChargeCartResponse),
    Rejected(String),
}

/// A payer resolved for a cart charge: the customer plus the card that
/// will be charged off-session.
pub struct CartPayer {
    pub customer_id: CustomerId,
    pub payment_method_id: PaymentMethodId,
}

pub enum PayerResolution {
    Resolved(CartPayer),
    NoCustomer,
    NoPaymentMethod,
}

pub enum ChargeConfirmation {
    Succeeded {
        payment_intent_id: String,
        charge_id: Option<String>,
    },
    NotSucceeded {
        status: String,
    },
}

/// Provider seam for the cart charge path. The orchestration in
/// [`charge_cart`] and [`execute_split`] only sees this trait, the same
/// way the renewal batch sits behind its billing trait.
#[async_trait]
pub trait CartGateway: Send + Sync {
    async fn resolve_payer(&self, email: &str) -> Result<PayerResolution>;

    async fn confirm_charge(
        &self,
        payer: &CartPayer,
        amount: i64,
        order_id: &str,
        plan: &SplitPlan,
    ) -> Result<ChargeConfirmation>;

    async fn transfer(
        &self,
        payment_intent_id: &str,
        charge_id: Option<&str>,
        transfer_group: &str,
        index: usize,
        total: usize,
        spec: &TransferSpec,
    ) -> std::result::Result<CreatedTransfer, String>;
}

/// Charges the full cart amount off-session against the payer's default
/// card, then fans the requested splits out as transfers. Validation
/// happens before any provider call, so a malformed split can never
/// leave a charge behind.
pub async fn charge_cart(
    gateway: &dyn CartGateway,
    destinations: &[String],
    email: &str,
    amount: i64,
    transfer_amounts: Option<&[i64]>,
) -> Result<ChargeOutcome> {
    let plan = split::build_split_plan(transfer_amounts, destinations)?;
    plan.ensure_within_total(amount)?;

    let payer = match gateway.resolve_payer(email).await? {
        PayerResolution::Resolved(payer) => payer,
        PayerResolution::NoCustomer => {
            return Ok(ChargeOutcome::Rejected(
                "No Stripe customer found for that email.".to_string(),
            ));
        }
        PayerResolution::NoPaymentMethod => {
            return Ok(ChargeOutcome::Rejected(
                "No default payment method found for this customer.".to_string(),
            ));
        }
    };

    let order_id = format!("order_{}", Uuid::new_v4().simple());
    let (payment_intent_id, charge_id) =
        match gateway.confirm_charge(&payer, amount, &order_id, &plan).await? {
            ChargeConfirmation::Succeeded {
                payment_intent_id,
                charge_id,
            } => (payment_intent_id, charge_id),
            ChargeConfirmation::NotSucceeded { status } => {
                return Ok(ChargeOutcome::Rejected(format!(
                    "Payment not succeeded. Status={status}"
                )));
            }
        };

    let (transfers_created, transfer_errors) = execute_split(
        gateway,
        &payment_intent_id,
        charge_id.as_deref(),
        &order_id,
        &plan,
    )
    .await;

    info!(
        order_id,
        payment_intent = %payment_intent_id,
        transfers = transfers_created.len(),
        failures = transfer_errors.len(),
        "cart charge completed"
    );

    Ok(ChargeOutcome::Completed(ChargeCartResponse {
        success: true,
        payment_intent_id,
        transfer_group: order_id,
        charge_id,
        transfers_created,
        transfer_errors,
        // Nominal figure: the requested split sum, not the executed one.
        platform_retained_amount: amount - plan.total_transfer_amount,
    }))
}

/// Runs every transfer in a plan. Zero-amount entries are skipped; one
/// failed transfer does not stop the rest.
pub async fn execute_split(
    gateway: &dyn CartGateway,
    payment_intent_id: &str,
    charge_id: Option<&str>,
    transfer_group: &str,
    plan: &SplitPlan,
) -> (Vec<CreatedTransfer>, Vec<TransferFailure>) {
    let mut created = Vec::new();
    let mut failed = Vec::new();
    let total = plan.transfers.len();

    for (index, spec) in plan.transfers.iter().enumerate() {
        if spec.amount == 0 {
            continue;
        }
        match gateway
            .transfer(payment_intent_id, charge_id, transfer_group, index, total, spec)
            .await
        {
            Ok(transfer) => created.push(transfer),
            Err(error) => {
                warn!(
                    destination = %spec.destination_account,
                    amount = spec.amount,
                    error,
                    "transfer failed"
                );
                failed.push(TransferFailure {
                    destination: spec.destination_account.clone(),
                    amount: spec.amount,
                    error,
                });
            }
        }
    }

    (created, failed)
}

#[async_trait]
impl CartGateway for AppState {
    async fn resolve_payer(&self, email: &str) -> Result<PayerResolution> {
        let Some(customer) = self.find_customer_by_email(email).await? else {
            return Ok(PayerResolution::NoCustomer);
        };
        match default_payment_method_id(&customer) {
            Some(payment_method_id) => Ok(PayerResolution::Resolved(CartPayer {
                customer_id: customer.id,
                payment_method_id,
            })),
            None => Ok(PayerResolution::NoPaymentMethod),
        }
    }

    async fn confirm_charge(
        &self,
        payer: &CartPayer,
        amount: i64,
        order_id: &str,
        plan: &SplitPlan,
    ) -> Result<ChargeConfirmation> {
        let metadata = split_metadata(order_id, plan)?;
        let description = format!("Cart charge for {order_id}");

        let mut params = CreatePaymentIntent::new(amount, Currency::USD);
        params.customer = Some(payer.customer_id.clone());
        params.payment_method = Some(payer.payment_method_id.clone());
        params.payment_method_types = Some(vec!["card".to_string()]);
        params.confirm = Some(true);
        params.off_session = Some(PaymentIntentOffSession::Exists(true));
        params.transfer_group = Some(order_id);
        params.description = Some(&description);
        params.metadata = Some(metadata);

        let intent = PaymentIntent::create(&self.client, params).await?;
        if intent.status != PaymentIntentStatus::Succeeded {
            return Ok(ChargeConfirmation::NotSucceeded {
                status: intent.status.to_string(),
            });
        }
        Ok(ChargeConfirmation::Succeeded {
            payment_intent_id: intent.id.to_string(),
            charge_id: latest_charge_id(&intent),
        })
    }

    /// One transfer under its deterministic idempotency key, so replays
    /// cannot double-pay.
    async fn transfer(
        &self,
        payment_intent_id: &str,
        charge_id: Option<&str>,
        transfer_group: &str,
        index: usize,
        total: usize,
        spec: &TransferSpec,
    ) -> std::result::Result<CreatedTransfer, String> {
        let key = split::transfer_idempotency_key(payment_intent_id, index);
        let client = self.client.clone().with_strategy(RequestStrategy::Idempotent(key));

        let description = format!("Split {}/{} for {}", index + 1, total, transfer_group);
        let mut params = CreateTransfer::new(Currency::USD, spec.destination_account.clone());
        params.amount = Some(spec.amount);
        params.transfer_group = Some(transfer_group);
        params.description = Some(&description);
        if let Some(charge) = charge_id {
            match charge.parse() {
                Ok(id) => params.source_transaction = Some(id),
                Err(_) => warn!(charge, "unparseable charge id, transfer without source"),
            }
        }

        let transfer = Transfer::create(&client, params)
            .await
            .map_err(|err| err.to_string())?;
        Ok(CreatedTransfer {
            id: transfer.id.to_string(),
            amount: transfer.amount,
            destination: spec.destination_account.clone(),
        })
    }
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let client = stripe::Client::new(&config.stripe.secret_key);
        let store = UserStore::new(
            &config.store.database_url,
            config.store.database_secret.clone(),
        );
        Self {
            client,
            store,
            http: reqwest::Client::new(),
            config,
        }
    }

    async fn find_customer_by_email(&self, email: &str) -> Result<Option<Customer>> {
        let mut params = ListCustomers::new();
        params.email = Some(email);
        params.limit = Some(1);
        let customers = Customer::list(&self.client, &params).await?;
        Ok(customers.data.into_iter().next())
    }

    pub async fn charge_and_split(
        &self,
        email: &str,
        amount: i64,
        transfer_amounts: Option<&[i64]>,
    ) -> Result<ChargeOutcome> {
        charge_cart(
            self,
            &self.config.billing.connected_account_ids,
            email,
            amount,
            transfer_amounts,
        )
        .await
    }

    /// Creates an unconfirmed payment intent carrying the split plan, for
    /// flows where the front-end confirms with the client secret. The
    /// customer must accompany an attached payment method or Stripe will
    /// refuse the confirmation.
    pub async fn create_split_intent(
        &self,
        amount: i64,
        payment_method_id: &str,
        customer_id: Option<&str>,
        transfer_amounts: Option<&[i64]>,
    ) -> Result<SplitIntentResponse> {
        let plan = split::build_split_plan(
            transfer_amounts,
            &self.config.billing.connected_account_ids,
        )?;
        plan.ensure_within_total(amount)?;

        let payment_method: PaymentMethodId = payment_method_id
            .parse()
            .map_err(|_| PaymentError::InvalidField("paymentMethodId"))?;
        let customer: Option<CustomerId> = customer_id
            .map(|id| id.parse().map_err(|_| PaymentError::InvalidField("customerId")))
            .transpose()?;

        let order_id = format!("order_{}", Uuid::new_v4().simple());
        let metadata = split_metadata(&order_id, &plan)?;

        let mut params = CreatePaymentIntent::new(amount, Currency::USD);
        params.customer = customer;
        params.payment_method = Some(payment_method);
        params.payment_method_types = Some(vec!["card".to_string()]);
        params.confirm = Some(false);
        params.transfer_group = Some(&order_id);
        params.metadata = Some(metadata);

        let intent = PaymentIntent::create(&self.client, params).await?;

        Ok(SplitIntentResponse {
            success: true,
            client_secret: intent.client_secret.unwrap_or_default(),
            transfer_group: order_id,
            splits: plan.transfers,
        })
    }

    /// Idempotently provisions a Stripe customer for an email. The store
    /// record is created first under a compare-and-set, so two concurrent
    /// calls for a new email converge on one record and one customer.
    pub async fn ensure_customer(
        &self,
        email: &str,
        name: Option<&str>,
    ) -> Result<EnsureCustomerResponse> {
        let subscriber = self
            .store
            .create_subscriber_if_absent(&Subscriber::new(email, name.map(str::to_owned)))
            .await?;

        if let Some(existing) = subscriber.stripe_customer_id.as_deref() {
            return Ok(EnsureCustomerResponse {
                message: "User already has a Stripe customer ID".to_string(),
                stripe_customer_id: existing.to_string(),
            });
        }

        let mut params = CreateCustomer::new();
        params.email = Some(email);
        params.name = name;
        let customer = Customer::create(&self.client, params).await?;

        let update = SubscriberUpdate {
            stripe_customer_id: Some(customer.id.to_string()),
            ..Default::default()
        };
        self.store.update_subscriber(email, &update).await?;

        info!(email, customer = %customer.id, "stripe customer provisioned");
        Ok(EnsureCustomerResponse {
            message: "Stripe customer created successfully".to_string(),
            stripe_customer_id: customer.id.to_string(),
        })
    }

    /// Attaches a payment method to a customer and makes it the default
    /// for invoices, returning the card's last four for display.
    pub async fn attach_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> Result<AttachPaymentMethodResponse> {
        let customer: CustomerId = customer_id
            .parse()
            .map_err(|_| PaymentError::InvalidField("customerId"))?;
        let payment_method: PaymentMethodId = payment_method_id
            .parse()
            .map_err(|_| PaymentError::InvalidField("paymentMethodId"))?;

        PaymentMethod::attach(
            &self.client,
            &payment_method,
            AttachPaymentMethod {
                customer: customer.clone(),
            },
        )
        .await?;
        self.set_default_payment_method(&customer, payment_method_id)
            .await?;

        let method = PaymentMethod::retrieve(&self.client, &payment_method, &[]).await?;
        Ok(AttachPaymentMethodResponse {
            success: true,
            last4: method.card.as_ref().map(|card| card.last4.clone()),
        })
    }

    async fn set_default_payment_method(
        &self,
        customer: &CustomerId,
        payment_method_id: &str,
    ) -> Result<()> {
        let mut params = UpdateCustomer::new();
        params.invoice_settings = Some(stripe::CustomerInvoiceSettings {
            default_payment_method: Some(payment_method_id.to_string()),
            ..Default::default()
        });
        Customer::update(&self.client, customer, params).await?;
        Ok(())
    }

    /// Sets the default payment method for the customer behind a store
    /// email, flagging the record so renewal knows a card is on file.
    pub async fn set_default_by_email(
        &self,
        email: &str,
        payment_method_id: &str,
    ) -> Result<SetDefaultPaymentMethodResponse> {
        let subscriber = self
            .store
            .subscriber(email)
            .await?
            .ok_or(PaymentError::CustomerNotProvisioned)?;
        let customer_id = subscriber
            .stripe_customer_id
            .ok_or(PaymentError::CustomerNotProvisioned)?;
        let customer: CustomerId = customer_id
            .parse()
            .map_err(|_| PaymentError::InvalidField("stripeCustomerId"))?;

        self.set_default_payment_method(&customer, payment_method_id)
            .await?;

        let update = SubscriberUpdate {
            has_default_payment_method: Some(true),
            ..Default::default()
        };
        self.store.update_subscriber(email, &update).await?;

        Ok(SetDefaultPaymentMethodResponse {
            message: "Default payment method updated".to_string(),
            customer_id: customer.to_string(),
        })
    }

    /// Looks a customer up by email and reports whether one exists, along
    /// with the last four of the default card when there is one.
    pub async fn lookup(&self, email: &str) -> Result<LookupResponse> {
        let Some(customer) = self.find_customer_by_email(email).await? else {
            return Ok(LookupResponse {
                success: true,
                exists: false,
                customer_id: None,
                email: None,
                card_last4: None,
            });
        };

        let card_last4 = match default_payment_method_id(&customer) {
            Some(payment_method) => {
                let method =
                    PaymentMethod::retrieve(&self.client, &payment_method, &[]).await?;
                method.card.as_ref().map(|card| card.last4.clone())
            }
            None => None,
        };

        Ok(LookupResponse {
            success: true,
            exists: true,
            customer_id: Some(customer.id.to_string()),
            email: customer.email.clone(),
            card_last4,
        })
    }

    /// Creates a prepaid subscription: the card is charged monthly only
    /// after the prepaid period, anchored by [`billing_cycle_anchor`].
    /// Proration is disabled so the anchor shift cannot generate a
    /// partial invoice.
    pub async fn subscribe(
        &self,
        email: &str,
        prepay_months: i64,
        payment_method_id: &str,
    ) -> Result<SubscribeResponse> {
        let customer = match self.find_customer_by_email(email).await? {
            Some(existing) => existing,
            None => {
                let mut params = CreateCustomer::new();
                params.email = Some(email);
                Customer::create(&self.client, params).await?
            }
        };

        let payment_method: PaymentMethodId = payment_method_id
            .parse()
            .map_err(|_| PaymentError::InvalidField("paymentMethodId"))?;
        PaymentMethod::attach(
            &self.client,
            &payment_method,
            AttachPaymentMethod {
                customer: customer.id.clone(),
            },
        )
        .await?;
        self.set_default_payment_method(&customer.id, payment_method_id)
            .await?;

        let now = Utc::now().with_timezone(&self.config.billing.reference_offset);
        let anchor = billing_cycle_anchor(now, prepay_months);

        let mut params = CreateSubscription::new(customer.id.clone());
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(self.config.stripe.price_id.clone()),
            ..Default::default()
        }]);
        params.billing_cycle_anchor = Some(anchor.timestamp());
        params.proration_behavior = Some(SubscriptionProrationBehavior::None);
        let subscription = Subscription::create(&self.client, params).await?;

        self.store
            .record_enrollment(&EnrollmentRecord {
                email: email.to_string(),
                customer_id: customer.id.to_string(),
                subscription_id: subscription.id.to_string(),
                paid_through: anchor.with_timezone(&Utc),
                created: Utc::now(),
            })
            .await?;

        info!(email, subscription = %subscription.id, %anchor, "subscription created");
        Ok(SubscribeResponse {
            subscription_id: subscription.id.to_string(),
        })
    }
}

/// Intent metadata carrying the split plan, so reconciliation and the
/// webhook can recover it later.
fn split_metadata(order_id: &str, plan: &SplitPlan) -> Result<HashMap<String, String>> {
    let mut metadata = HashMap::new();
    metadata.insert("orderId".to_string(), order_id.to_string());
    metadata.insert(
        "splits_json".to_string(),
        serde_json::to_string(&plan.transfers)?,
    );
    metadata.insert(
        "total_transfer_amount".to_string(),
        plan.total_transfer_amount.to_string(),
    );
    Ok(metadata)
}

fn default_payment_method_id(customer: &Customer) -> Option<PaymentMethodId> {
    customer
        .invoice_settings
        .as_ref()
        .and_then(|settings| settings.default_payment_method.as_ref())
        .map(|method| match method {
            Expandable::Id(id) => id.clone(),
            Expandable::Object(method) => method.id.clone(),
        })
}

pub(crate) fn latest_charge_id(intent: &PaymentIntent) -> Option<String> {
    intent.latest_charge.as_ref().map(|charge| match charge {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(charge) => charge.id.to_string(),
    })
}

/// First billed date for a prepaid signup. Signups before April 7 are
/// treated as season-start signups: the prepaid window runs from April 7
/// in the reference timezone. Later signups prepay from the signup
/// moment. Each prepaid month covers a flat 30 days.
pub fn billing_cycle_anchor(
    now: DateTime<FixedOffset>,
    prepay_months: i64,
) -> DateTime<FixedOffset> {
    let season_start = now
        .timezone()
        .with_ymd_and_hms(now.year(), 4, 7, 0, 0, 0)
        .single()
        .unwrap_or(now);
    let start = if now < season_start { season_start } else { now };
    start + Duration::days(30 * prepay_months.max(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(offset: FixedOffset, y: i32, m: u32, d: u32) -> DateTime<FixedOffset> {
        offset.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn signup_before_season_anchors_from_april_seventh() {
        let offset = FixedOffset::west_opt(5 * 3600).unwrap();
        let anchor = billing_cycle_anchor(at(offset, 2025, 2, 1), 1);
        assert_eq!(
            anchor,
            offset.with_ymd_and_hms(2025, 5, 7, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn signup_after_season_anchors_from_signup_moment() {
        let offset = FixedOffset::west_opt(5 * 3600).unwrap();
        let now = at(offset, 2025, 6, 10);
        assert_eq!(billing_cycle_anchor(now, 2), now + Duration::days(60));
    }

    #[test]
    fn season_day_itself_counts_as_in_season() {
        let offset = FixedOffset::east_opt(0).unwrap();
        let now = offset.with_ymd_and_hms(2025, 4, 7, 0, 0, 0).unwrap();
        assert_eq!(billing_cycle_anchor(now, 1), now + Duration::days(30));
    }

    struct MockGateway {
        has_customer: bool,
        has_payment_method: bool,
        fail_destination: Option<&'static str>,
    }

    #[async_trait]
    impl CartGateway for MockGateway {
        async fn resolve_payer(&self, _email: &str) -> Result<PayerResolution> {
            if !self.has_customer {
                return Ok(PayerResolution::NoCustomer);
            }
            if !self.has_payment_method {
                return Ok(PayerResolution::NoPaymentMethod);
            }
            Ok(PayerResolution::Resolved(CartPayer {
                customer_id: "cus_mock".parse().unwrap(),
                payment_method_id: "pm_mock".parse().unwrap(),
            }))
        }

        async fn confirm_charge(
            &self,
            _payer: &CartPayer,
            _amount: i64,
            _order_id: &str,
            _plan: &SplitPlan,
        ) -> Result<ChargeConfirmation> {
            Ok(ChargeConfirmation::Succeeded {
                payment_intent_id: "pi_mock".to_string(),
                charge_id: Some("ch_mock".to_string()),
            })
        }

        async fn transfer(
            &self,
            _payment_intent_id: &str,
            _charge_id: Option<&str>,
            _transfer_group: &str,
            _index: usize,
            _total: usize,
            spec: &TransferSpec,
        ) -> std::result::Result<CreatedTransfer, String> {
            if self.fail_destination == Some(spec.destination_account.as_str()) {
                return Err("transfer declined".to_string());
            }
            Ok(CreatedTransfer {
                id: format!("tr_{}", spec.destination_account),
                amount: spec.amount,
                destination: spec.destination_account.clone(),
            })
        }
    }

    fn destinations() -> Vec<String> {
        vec!["acct_a".to_string(), "acct_b".to_string()]
    }

    #[tokio::test]
    async fn unknown_email_is_a_soft_failure() {
        let gateway = MockGateway {
            has_customer: false,
            has_payment_method: false,
            fail_destination: None,
        };
        let outcome = charge_cart(&gateway, &destinations(), "a@b.com", 500, Some(&[100, 150]))
            .await
            .unwrap();
        match outcome {
            ChargeOutcome::Rejected(error) => {
                assert!(error.contains("No Stripe customer"), "unexpected: {error}");
            }
            ChargeOutcome::Completed(_) => panic!("charge should have been rejected"),
        }
    }

    #[tokio::test]
    async fn missing_default_card_is_a_soft_failure() {
        let gateway = MockGateway {
            has_customer: true,
            has_payment_method: false,
            fail_destination: None,
        };
        let outcome = charge_cart(&gateway, &destinations(), "a@b.com", 500, None)
            .await
            .unwrap();
        match outcome {
            ChargeOutcome::Rejected(error) => {
                assert!(error.contains("payment method"), "unexpected: {error}");
            }
            ChargeOutcome::Completed(_) => panic!("charge should have been rejected"),
        }
    }

    #[tokio::test]
    async fn retained_amount_is_nominal_even_when_a_transfer_fails() {
        let gateway = MockGateway {
            has_customer: true,
            has_payment_method: true,
            fail_destination: Some("acct_b"),
        };
        let outcome = charge_cart(&gateway, &destinations(), "a@b.com", 500, Some(&[100, 150]))
            .await
            .unwrap();
        let ChargeOutcome::Completed(response) = outcome else {
            panic!("charge should have completed");
        };
        assert!(response.success);
        assert_eq!(response.platform_retained_amount, 250);
        assert_eq!(response.transfers_created.len(), 1);
        assert_eq!(response.transfers_created[0].destination, "acct_a");
        assert_eq!(response.transfer_errors.len(), 1);
        assert_eq!(response.transfer_errors[0].destination, "acct_b");
        assert_eq!(response.transfer_errors[0].amount, 150);
    }
}

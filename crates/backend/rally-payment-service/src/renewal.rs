//! Batch renewal of recurring payers.
//!
//! One run takes a snapshot of the subscriber directory, charges every
//! active record whose paid-through date has arrived in the configured
//! reference timezone, and persists the outcome per subscriber. Billing
//! and the directory sit behind traits so the batch logic is testable
//! without Stripe or the store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use futures::{StreamExt, stream};
use rally_user_store::{Subscriber, SubscriberStatus, SubscriberUpdate, UserStore};
use serde::Serialize;
use stripe::{
    CreatePaymentIntent, Currency, PaymentIntent, PaymentIntentOffSession, PaymentIntentStatus,
};
use tracing::{error, info, warn};

use crate::error::Result;
use crate::service::AppState;

pub const RENEWAL_PERIOD_DAYS: i64 = 30;

#[async_trait]
pub trait RenewalBilling: Send + Sync {
    /// Attempts the off-session renewal charge for one subscriber. The
    /// error is a display string; the batch does not branch on its shape.
    async fn charge_renewal(&self, subscriber: &Subscriber)
    -> std::result::Result<(), String>;
}

#[async_trait]
pub trait SubscriberDirectory: Send + Sync {
    async fn snapshot(&self) -> rally_user_store::Result<HashMap<String, Subscriber>>;
    async fn apply(
        &self,
        email: &str,
        update: &SubscriberUpdate,
    ) -> rally_user_store::Result<()>;
}

#[async_trait]
impl SubscriberDirectory for UserStore {
    async fn snapshot(&self) -> rally_user_store::Result<HashMap<String, Subscriber>> {
        self.all_subscribers().await
    }

    async fn apply(
        &self,
        email: &str,
        update: &SubscriberUpdate,
    ) -> rally_user_store::Result<()> {
        self.update_subscriber(email, update).await
    }
}

#[async_trait]
impl RenewalBilling for AppState {
    async fn charge_renewal(
        &self,
        subscriber: &Subscriber,
    ) -> std::result::Result<(), String> {
        let customer_id = subscriber
            .stripe_customer_id
            .as_deref()
            .ok_or_else(|| "missing stripeCustomerId".to_string())?;
        let customer = customer_id
            .parse()
            .map_err(|_| format!("unparseable customer id {customer_id}"))?;

        let mut metadata = HashMap::new();
        metadata.insert("email".to_string(), subscriber.email.clone());
        metadata.insert("autoRenew".to_string(), "true".to_string());

        let mut params =
            CreatePaymentIntent::new(self.config.billing.monthly_price_cents, Currency::USD);
        params.customer = Some(customer);
        params.payment_method_types = Some(vec!["card".to_string()]);
        params.confirm = Some(true);
        params.off_session = Some(PaymentIntentOffSession::Exists(true));
        params.description = Some("Automatic renewal for 30 days");
        params.metadata = Some(metadata);

        let intent = PaymentIntent::create(&self.client, params)
            .await
            .map_err(|err| err.to_string())?;
        if intent.status != PaymentIntentStatus::Succeeded {
            return Err(format!("payment not succeeded, status={}", intent.status));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RenewalSummary {
    pub processed_count: usize,
    pub errors_count: usize,
}

impl RenewalSummary {
    pub fn message(&self) -> String {
        format!(
            "Renewal check complete. Successes: {}, Failures: {}",
            self.processed_count, self.errors_count
        )
    }
}

/// Date-only due test in the reference timezone. A record is due on its
/// paid-through day itself, not only after it has passed.
pub fn is_due(paid_until: DateTime<Utc>, today: NaiveDate, reference: FixedOffset) -> bool {
    paid_until.with_timezone(&reference).date_naive() <= today
}

/// The next paid-through date always extends the previous one, so a
/// renewal charged late does not shift the anniversary.
pub fn next_paid_until(previous: DateTime<Utc>) -> DateTime<Utc> {
    previous + Duration::days(RENEWAL_PERIOD_DAYS)
}

enum RenewalOutcome {
    Renewed,
    Failed,
    Skipped,
}

/// Runs one renewal pass over the whole directory. A snapshot failure is
/// fatal; per-subscriber failures are isolated, recorded (the subscriber
/// is deactivated) and counted. Charges run concurrently up to the
/// configured width.
pub async fn run_renewal_batch(
    directory: &dyn SubscriberDirectory,
    billing: &dyn RenewalBilling,
    reference: FixedOffset,
    concurrency: usize,
) -> Result<RenewalSummary> {
    let today = Utc::now().with_timezone(&reference).date_naive();
    let snapshot = directory.snapshot().await?;

    let due: Vec<Subscriber> = snapshot
        .into_values()
        .filter(|sub| {
            sub.status == SubscriberStatus::Active
                && sub
                    .paid_until
                    .is_some_and(|paid| is_due(paid, today, reference))
        })
        .collect();

    info!(due = due.len(), %today, "starting renewal batch");

    let outcomes: Vec<RenewalOutcome> = stream::iter(due)
        .map(|subscriber| renew_one(directory, billing, subscriber))
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let summary = RenewalSummary {
        processed_count: outcomes
            .iter()
            .filter(|o| matches!(o, RenewalOutcome::Renewed))
            .count(),
        errors_count: outcomes
            .iter()
            .filter(|o| matches!(o, RenewalOutcome::Failed))
            .count(),
    };
    info!(
        processed = summary.processed_count,
        errors = summary.errors_count,
        "renewal batch finished"
    );
    Ok(summary)
}

async fn renew_one(
    directory: &dyn SubscriberDirectory,
    billing: &dyn RenewalBilling,
    subscriber: Subscriber,
) -> RenewalOutcome {
    let email = subscriber.email.clone();

    if subscriber.stripe_customer_id.is_none() {
        warn!(email, "due subscriber has no stripe customer, skipping");
        return RenewalOutcome::Skipped;
    }
    // The due filter guarantees this is present.
    let Some(previous) = subscriber.paid_until else {
        return RenewalOutcome::Skipped;
    };

    match billing.charge_renewal(&subscriber).await {
        Ok(()) => {
            let update = SubscriberUpdate {
                paid_until: Some(next_paid_until(previous)),
                ..Default::default()
            };
            match directory.apply(&email, &update).await {
                Ok(()) => {
                    info!(email, "renewal charged");
                    RenewalOutcome::Renewed
                }
                Err(err) => {
                    // Charged but not recorded. Leave the record active so
                    // the discrepancy surfaces for reconciliation.
                    error!(email, error = %err, "renewed but failed to persist paid-through");
                    RenewalOutcome::Failed
                }
            }
        }
        Err(reason) => {
            warn!(email, reason, "renewal charge failed, deactivating");
            let update = SubscriberUpdate {
                status: Some(SubscriberStatus::Inactive),
                ..Default::default()
            };
            if let Err(err) = directory.apply(&email, &update).await {
                error!(email, error = %err, "failed to deactivate after charge failure");
            }
            RenewalOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex;

    fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn due_on_the_paid_through_day_and_before() {
        let reference = FixedOffset::east_opt(0).unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        assert!(is_due(utc(2026, 3, 10), today, reference));
        assert!(is_due(utc(2026, 3, 9), today, reference));
        assert!(!is_due(utc(2026, 3, 11), today, reference));
    }

    #[test]
    fn due_respects_the_reference_offset() {
        // 2026-03-11T02:00Z is still March 10 at UTC-5.
        let reference = FixedOffset::west_opt(5 * 3600).unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        let paid = Utc.with_ymd_and_hms(2026, 3, 11, 2, 0, 0).unwrap();
        assert!(is_due(paid, today, reference));
    }

    #[test]
    fn next_paid_through_extends_the_previous_date() {
        let previous = utc(2026, 3, 10);
        assert_eq!(next_paid_until(previous), previous + Duration::days(30));
    }

    struct MemoryDirectory {
        records: Mutex<HashMap<String, Subscriber>>,
    }

    impl MemoryDirectory {
        fn new(subscribers: Vec<Subscriber>) -> Self {
            let records = subscribers
                .into_iter()
                .map(|s| (s.email.clone(), s))
                .collect();
            Self {
                records: Mutex::new(records),
            }
        }

        fn get(&self, email: &str) -> Subscriber {
            self.records.lock().unwrap()[email].clone()
        }
    }

    #[async_trait]
    impl SubscriberDirectory for MemoryDirectory {
        async fn snapshot(&self) -> rally_user_store::Result<HashMap<String, Subscriber>> {
            Ok(self.records.lock().unwrap().clone())
        }

        async fn apply(
            &self,
            email: &str,
            update: &SubscriberUpdate,
        ) -> rally_user_store::Result<()> {
            let mut records = self.records.lock().unwrap();
            let record = records.get_mut(email).unwrap();
            if let Some(status) = update.status {
                record.status = status;
            }
            if let Some(paid_until) = update.paid_until {
                record.paid_until = Some(paid_until);
            }
            Ok(())
        }
    }

    struct FailFor(&'static str);

    #[async_trait]
    impl RenewalBilling for FailFor {
        async fn charge_renewal(
            &self,
            subscriber: &Subscriber,
        ) -> std::result::Result<(), String> {
            if subscriber.email == self.0 {
                Err("card declined".to_string())
            } else {
                Ok(())
            }
        }
    }

    fn subscriber(
        email: &str,
        status: SubscriberStatus,
        paid_until: Option<DateTime<Utc>>,
        customer: Option<&str>,
    ) -> Subscriber {
        Subscriber {
            email: email.to_string(),
            name: None,
            status,
            paid_until,
            stripe_customer_id: customer.map(str::to_string),
            has_default_payment_method: true,
        }
    }

    #[tokio::test]
    async fn batch_isolates_failures_and_updates_each_record() {
        let reference = FixedOffset::east_opt(0).unwrap();
        let yesterday = Utc::now() - Duration::days(1);
        let far_future = Utc::now() + Duration::days(300);

        let directory = MemoryDirectory::new(vec![
            subscriber("declined@x.com", SubscriberStatus::Active, Some(yesterday), Some("cus_a")),
            subscriber("ok@x.com", SubscriberStatus::Active, Some(yesterday), Some("cus_b")),
            subscriber("later@x.com", SubscriberStatus::Active, Some(far_future), Some("cus_c")),
            subscriber("inactive@x.com", SubscriberStatus::Inactive, Some(yesterday), Some("cus_d")),
            subscriber("nocustomer@x.com", SubscriberStatus::Active, Some(yesterday), None),
        ]);
        let billing = FailFor("declined@x.com");

        let summary = run_renewal_batch(&directory, &billing, reference, 4)
            .await
            .unwrap();
        assert_eq!(
            summary,
            RenewalSummary {
                processed_count: 1,
                errors_count: 1
            }
        );

        let renewed = directory.get("ok@x.com");
        assert_eq!(renewed.status, SubscriberStatus::Active);
        assert_eq!(renewed.paid_until, Some(yesterday + Duration::days(30)));

        let declined = directory.get("declined@x.com");
        assert_eq!(declined.status, SubscriberStatus::Inactive);
        assert_eq!(declined.paid_until, Some(yesterday));

        assert_eq!(directory.get("later@x.com").paid_until, Some(far_future));
        assert_eq!(
            directory.get("inactive@x.com").status,
            SubscriberStatus::Inactive
        );
        assert_eq!(
            directory.get("nocustomer@x.com").status,
            SubscriberStatus::Active
        );
    }

    #[test]
    fn summary_message_matches_the_reporting_format() {
        let summary = RenewalSummary {
            processed_count: 3,
            errors_count: 1,
        };
        assert_eq!(
            summary.message(),
            "Renewal check complete. Successes: 3, Failures: 1"
        );
    }
}

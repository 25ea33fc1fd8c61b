use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a recurring payer. Stored as the literal strings
/// `"Active"` / `"Inactive"`, which is what the renewal engine matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriberStatus {
    Active,
    Inactive,
}

/// Durable representation of a recurring payer, keyed in the store by the
/// escaped form of the email address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscriber {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: SubscriberStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe_customer_id: Option<String>,
    #[serde(default)]
    pub has_default_payment_method: bool,
}

impl Subscriber {
    /// A fresh record for a first-time caller: inactive, nothing paid,
    /// no payment customer yet.
    pub fn new(email: impl Into<String>, name: Option<String>) -> Self {
        Self {
            email: email.into(),
            name,
            status: SubscriberStatus::Inactive,
            paid_until: None,
            stripe_customer_id: None,
            has_default_payment_method: false,
        }
    }
}

/// Partial update of a subscriber record. Only the populated fields are
/// written; everything else is left untouched by the store's PATCH.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SubscriberStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stripe_customer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_default_payment_method: Option<bool>,
}

/// One prepaid-subscription enrollment, appended under `subscriptions/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentRecord {
    pub email: String,
    pub customer_id: String,
    pub subscription_id: String,
    pub paid_through: DateTime<Utc>,
    pub created: DateTime<Utc>,
}

/// A browser push subscription as handed to us by the front-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSubscription {
    pub endpoint: String,
    pub keys: PushKeys,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushKeys {
    pub p256dh: String,
    pub auth: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriber_serializes_with_wire_field_names() {
        let sub = Subscriber {
            email: "a@b.com".into(),
            name: Some("Alice".into()),
            status: SubscriberStatus::Active,
            paid_until: Some("2026-03-01T00:00:00Z".parse().unwrap()),
            stripe_customer_id: Some("cus_123".into()),
            has_default_payment_method: true,
        };
        let value = serde_json::to_value(&sub).unwrap();
        assert_eq!(value["status"], "Active");
        assert_eq!(value["stripeCustomerId"], "cus_123");
        assert_eq!(value["paidUntil"], "2026-03-01T00:00:00Z");
        assert_eq!(value["hasDefaultPaymentMethod"], true);
    }

    #[test]
    fn subscriber_deserializes_with_missing_optional_fields() {
        let sub: Subscriber =
            serde_json::from_str(r#"{"email":"a@b.com","status":"Inactive"}"#).unwrap();
        assert_eq!(sub.status, SubscriberStatus::Inactive);
        assert!(sub.paid_until.is_none());
        assert!(sub.stripe_customer_id.is_none());
        assert!(!sub.has_default_payment_method);
    }

    #[test]
    fn update_serializes_only_populated_fields() {
        let update = SubscriberUpdate {
            status: Some(SubscriberStatus::Inactive),
            ..Default::default()
        };
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(
            value.as_object().unwrap().keys().collect::<Vec<_>>(),
            vec!["status"]
        );
    }
}

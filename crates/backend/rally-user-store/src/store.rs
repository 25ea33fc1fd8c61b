use std::collections::HashMap;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use reqwest::{RequestBuilder, StatusCode, header};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::types::{EnrollmentRecord, PushSubscription, Subscriber, SubscriberUpdate};

/// The store assigns semantic meaning to `.` in keys, so emails are escaped
/// with `,` (which cannot appear in an email address) in both directions.
pub fn encode_email_key(email: &str) -> String {
    email.replace('.', ",")
}

pub fn decode_email_key(key: &str) -> String {
    key.replace(',', ".")
}

/// Push endpoints are full URLs and contain several characters the store
/// forbids in keys, so they are keyed by their base64url form instead.
fn endpoint_key(endpoint: &str) -> String {
    URL_SAFE_NO_PAD.encode(endpoint)
}

/// Client for the external user store, a Firebase Realtime Database
/// accessed over its REST protocol. Holds subscriber records under
/// `users/`, prepaid enrollments under `subscriptions/` and browser push
/// subscriptions under `pushSubscriptions/`.
#[derive(Clone)]
pub struct UserStore {
    http: reqwest::Client,
    base_url: String,
    auth: Option<String>,
}

impl UserStore {
    pub fn new(base_url: impl Into<String>, auth: Option<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: reqwest::Client::new(),
            base_url,
            auth,
        }
    }

    fn node_url(&self, path: &str) -> String {
        format!("{}/{}.json", self.base_url, path)
    }

    fn with_auth(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Some(secret) => req.query(&[("auth", secret)]),
            None => req,
        }
    }

    // ------------------------------------------------------------------
    // Subscriber records
    // ------------------------------------------------------------------

    pub async fn subscriber(&self, email: &str) -> Result<Option<Subscriber>> {
        let url = self.node_url(&format!("users/{}", encode_email_key(email)));
        let record = self
            .with_auth(self.http.get(&url))
            .send()
            .await?
            .error_for_status()?
            .json::<Option<Subscriber>>()
            .await?;
        Ok(record)
    }

    /// One snapshot read of every subscriber record, keyed by the escaped
    /// email. Records that fail to decode are skipped and logged rather
    /// than failing the whole snapshot.
    pub async fn all_subscribers(&self) -> Result<HashMap<String, Subscriber>> {
        let url = self.node_url("users");
        let raw = self
            .with_auth(self.http.get(&url))
            .send()
            .await?
            .error_for_status()?
            .json::<Option<HashMap<String, Value>>>()
            .await?
            .unwrap_or_default();

        let mut subscribers = HashMap::with_capacity(raw.len());
        for (key, value) in raw {
            match serde_json::from_value::<Subscriber>(value) {
                Ok(sub) => {
                    subscribers.insert(key, sub);
                }
                Err(err) => warn!(key = %key, error = %err, "Skipping malformed subscriber record"),
            }
        }
        Ok(subscribers)
    }

    pub async fn put_subscriber(&self, subscriber: &Subscriber) -> Result<()> {
        let url = self.node_url(&format!("users/{}", encode_email_key(&subscriber.email)));
        self.with_auth(self.http.put(&url))
            .json(subscriber)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn update_subscriber(&self, email: &str, update: &SubscriberUpdate) -> Result<()> {
        let url = self.node_url(&format!("users/{}", encode_email_key(email)));
        self.with_auth(self.http.patch(&url))
            .json(update)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Creates the record only if the key is still absent, using the
    /// store's ETag compare-and-swap so two concurrent first-time calls
    /// cannot both create. Returns whichever record ends up stored.
    pub async fn create_subscriber_if_absent(&self, subscriber: &Subscriber) -> Result<Subscriber> {
        let key = encode_email_key(&subscriber.email);
        let url = self.node_url(&format!("users/{key}"));

        let resp = self
            .with_auth(self.http.get(&url))
            .header("X-Firebase-ETag", "true")
            .send()
            .await?
            .error_for_status()?;
        let etag = resp
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        if let Some(existing) = resp.json::<Option<Subscriber>>().await? {
            return Ok(existing);
        }

        let mut put = self.with_auth(self.http.put(&url)).json(subscriber);
        if let Some(etag) = etag {
            put = put.header(header::IF_MATCH, etag);
        }
        let resp = put.send().await?;
        if resp.status() == StatusCode::PRECONDITION_FAILED {
            // Lost the race; the winner's record is authoritative.
            debug!(key = %key, "Concurrent create detected, re-reading record");
            return self
                .subscriber(&subscriber.email)
                .await?
                .ok_or(StoreError::Conflict(key));
        }
        resp.error_for_status()?;
        Ok(subscriber.clone())
    }

    // ------------------------------------------------------------------
    // Prepaid enrollments
    // ------------------------------------------------------------------

    /// Appends one enrollment row under `subscriptions/` (store-generated
    /// key, matching the original push-style append).
    pub async fn record_enrollment(&self, record: &EnrollmentRecord) -> Result<()> {
        let url = self.node_url("subscriptions");
        self.with_auth(self.http.post(&url))
            .json(record)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Push subscriptions
    // ------------------------------------------------------------------

    pub async fn upsert_push_subscription(&self, subscription: &PushSubscription) -> Result<()> {
        let url = self.node_url(&format!(
            "pushSubscriptions/{}",
            endpoint_key(&subscription.endpoint)
        ));
        self.with_auth(self.http.put(&url))
            .json(subscription)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn push_subscriptions(&self) -> Result<Vec<PushSubscription>> {
        let url = self.node_url("pushSubscriptions");
        let raw = self
            .with_auth(self.http.get(&url))
            .send()
            .await?
            .error_for_status()?
            .json::<Option<HashMap<String, PushSubscription>>>()
            .await?
            .unwrap_or_default();
        Ok(raw.into_values().collect())
    }

    pub async fn remove_push_subscription(&self, endpoint: &str) -> Result<()> {
        let url = self.node_url(&format!("pushSubscriptions/{}", endpoint_key(endpoint)));
        self.with_auth(self.http.delete(&url))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_keys_escape_dots_both_ways() {
        assert_eq!(encode_email_key("a.b@c.co"), "a,b@c,co");
        assert_eq!(decode_email_key("a,b@c,co"), "a.b@c.co");
        assert_eq!(decode_email_key(&encode_email_key("plain@host")), "plain@host");
    }

    #[test]
    fn endpoint_keys_contain_no_forbidden_characters() {
        let key = endpoint_key("https://fcm.googleapis.com/fcm/send/abc#frag");
        for forbidden in ['.', '$', '#', '[', ']', '/'] {
            assert!(!key.contains(forbidden), "key contains {forbidden:?}");
        }
    }

    #[test]
    fn base_url_trailing_slash_is_normalized() {
        let store = UserStore::new("https://example.firebaseio.com/", None);
        assert_eq!(
            store.node_url("users/a,b"),
            "https://example.firebaseio.com/users/a,b.json"
        );
    }
}

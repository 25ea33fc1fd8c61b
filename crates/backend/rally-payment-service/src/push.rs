//! Browser push delivery over the Web Push protocol with VAPID
//! authentication. Subscriptions live in the user store, so a restart
//! does not lose them, and endpoints the push service reports as gone
//! are pruned on the spot.

use futures::future::join_all;
use rally_user_store::{PushSubscription, UserStore};
use tracing::{info, warn};
use web_push::{
    ContentEncoding, HyperWebPushClient, SubscriptionInfo, VapidSignatureBuilder, WebPushClient,
    WebPushError, WebPushMessageBuilder,
};

use crate::config::PushConfig;
use crate::error::{PaymentError, Result};
use crate::types::PushSendResult;

pub const DEFAULT_PAYLOAD: &str = r#"{"title":"Ping!","body":"Hello from Rally"}"#;

pub struct PushSender {
    subject: String,
    private_key: String,
    client: HyperWebPushClient,
}

impl PushSender {
    /// Builds a sender from config; both VAPID values must be present.
    pub fn from_config(config: &PushConfig) -> Result<Self> {
        let (Some(subject), Some(private_key)) = (
            config.vapid_subject.clone(),
            config.vapid_private_key.clone(),
        ) else {
            return Err(PaymentError::Config(
                "VAPID_SUBJECT and VAPID_PRIVATE_KEY must be set for push delivery".to_string(),
            ));
        };
        Ok(Self {
            subject,
            private_key,
            client: HyperWebPushClient::new(),
        })
    }

    async fn send_one(
        &self,
        subscription: &PushSubscription,
        payload: &[u8],
    ) -> std::result::Result<(), WebPushError> {
        let info = SubscriptionInfo::new(
            &subscription.endpoint,
            &subscription.keys.p256dh,
            &subscription.keys.auth,
        );

        let mut signature = VapidSignatureBuilder::from_base64(
            &self.private_key,
            web_push::URL_SAFE_NO_PAD,
            &info,
        )?;
        signature.add_claim("sub", self.subject.clone());

        let mut message = WebPushMessageBuilder::new(&info);
        message.set_payload(ContentEncoding::Aes128Gcm, payload);
        message.set_vapid_signature(signature.build()?);

        self.client.send(message.build()?).await
    }

    /// Sends the payload to every stored subscription. Failures are
    /// isolated per endpoint; endpoints the push service no longer knows
    /// are removed from the store.
    pub async fn send_to_all(&self, store: &UserStore, payload: &[u8]) -> Result<Vec<PushSendResult>> {
        let subscriptions = store.push_subscriptions().await?;
        info!(count = subscriptions.len(), "sending push notifications");

        let sends = subscriptions.iter().map(|subscription| async move {
            match self.send_one(subscription, payload).await {
                Ok(()) => PushSendResult {
                    endpoint: subscription.endpoint.clone(),
                    delivered: true,
                    error: None,
                },
                Err(err) => {
                    if matches!(
                        err,
                        WebPushError::EndpointNotFound | WebPushError::EndpointNotValid
                    ) {
                        if let Err(remove_err) =
                            store.remove_push_subscription(&subscription.endpoint).await
                        {
                            warn!(
                                endpoint = %subscription.endpoint,
                                error = %remove_err,
                                "failed to prune dead push subscription"
                            );
                        }
                    } else {
                        warn!(endpoint = %subscription.endpoint, error = %err, "push send failed");
                    }
                    PushSendResult {
                        endpoint: subscription.endpoint.clone(),
                        delivered: false,
                        error: Some(err.to_string()),
                    }
                }
            }
        });

        Ok(join_all(sends).await)
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::split::TransferSpec;

// Request/response types for the HTTP surface. Field names are the wire
// contract the existing front-end already speaks, so renames here are
// deliberate and load-bearing.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeCartRequest {
    pub email: Option<String>,
    pub amount: Option<i64>,
    #[serde(default)]
    pub transfer_amounts: Option<Vec<i64>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeCartResponse {
    pub success: bool,
    pub payment_intent_id: String,
    pub transfer_group: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_id: Option<String>,
    pub transfers_created: Vec<CreatedTransfer>,
    pub transfer_errors: Vec<TransferFailure>,
    pub platform_retained_amount: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedTransfer {
    pub id: String,
    pub amount: i64,
    pub destination: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferFailure {
    pub destination: String,
    pub amount: i64,
    pub error: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitIntentRequest {
    pub amount: Option<i64>,
    pub payment_method_id: Option<String>,
    /// Required when the payment method is attached to a customer; an
    /// attached card cannot confirm without its customer on the intent.
    pub customer_id: Option<String>,
    #[serde(default)]
    pub transfer_amounts: Option<Vec<i64>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitIntentResponse {
    pub success: bool,
    pub client_secret: String,
    pub transfer_group: String,
    pub splits: Vec<TransferSpec>,
}

#[derive(Debug, Deserialize)]
pub struct EnsureCustomerRequest {
    pub email: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnsureCustomerResponse {
    pub message: String,
    pub stripe_customer_id: String,
}

#[derive(Debug, Deserialize)]
pub struct LookupQuery {
    pub email: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupResponse {
    pub success: bool,
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub card_last4: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachPaymentMethodRequest {
    pub customer_id: Option<String>,
    pub payment_method_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AttachPaymentMethodResponse {
    pub success: bool,
    pub last4: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetDefaultPaymentMethodRequest {
    pub email: Option<String>,
    pub payment_method_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetDefaultPaymentMethodResponse {
    pub message: String,
    pub customer_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub email: Option<String>,
    pub prepay_months: Option<i64>,
    pub payment_method_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeResponse {
    pub subscription_id: String,
}

#[derive(Debug, Serialize)]
pub struct SavePushSubscriptionResponse {
    pub saved: bool,
}

#[derive(Debug, Serialize)]
pub struct PushSendResult {
    pub endpoint: String,
    pub delivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

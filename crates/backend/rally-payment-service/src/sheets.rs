use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::Result;

/// One ledger row forwarded to the Google Apps Script web app backing the
/// bookkeeping sheet. Field names are the web app's expected columns.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetRow {
    pub source: String,
    pub is_subscription: bool,
    pub payment_intent_id: Option<String>,
    pub charge_id: Option<String>,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub amount: Option<i64>,
    pub currency: Option<String>,
    pub status: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub created: i64,
    pub metadata: Value,
}

/// Appends one row to the sheet. A non-success response is an error, so
/// the webhook handler can fail the delivery and let the event source
/// retry rather than silently dropping the row.
pub async fn append_row(http: &reqwest::Client, webapp_url: &str, row: &SheetRow) -> Result<()> {
    http.post(webapp_url)
        .json(row)
        .send()
        .await?
        .error_for_status()?;
    debug!(source = %row.source, "sheet row appended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_serialize_with_sheet_column_names() {
        let row = SheetRow {
            source: "payment_intent.succeeded".into(),
            is_subscription: false,
            payment_intent_id: Some("pi_1".into()),
            charge_id: None,
            customer_id: Some("cus_1".into()),
            subscription_id: None,
            amount: Some(2500),
            currency: Some("usd".into()),
            status: Some("succeeded".into()),
            name: None,
            email: Some("a@b.com".into()),
            created: 1_700_000_000,
            metadata: serde_json::json!({"orderId": "order_1"}),
        };
        let value = serde_json::to_value(&row).unwrap();
        assert_eq!(value["isSubscription"], false);
        assert_eq!(value["paymentIntentId"], "pi_1");
        assert_eq!(value["customerId"], "cus_1");
        assert_eq!(value["metadata"]["orderId"], "order_1");
    }
}

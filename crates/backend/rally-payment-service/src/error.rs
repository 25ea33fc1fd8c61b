use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PaymentError>;

#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("Stripe error: {0}")]
    Stripe(#[from] stripe::StripeError),

    #[error("User store error: {0}")]
    Store(#[from] rally_user_store::StoreError),

    #[error("{0}")]
    Split(#[from] crate::split::SplitError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid value for field: {0}")]
    InvalidField(&'static str),

    #[error("User missing stripeCustomerId")]
    CustomerNotProvisioned,

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Outbound request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for PaymentError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            PaymentError::Stripe(stripe::StripeError::Stripe(request_error)) => {
                let status = StatusCode::from_u16(request_error.http_status)
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let message = request_error
                    .message
                    .clone()
                    .unwrap_or_else(|| "Payment processing error".to_string());
                (status, message)
            }
            PaymentError::Stripe(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
            PaymentError::Split(_)
            | PaymentError::MissingField(_)
            | PaymentError::InvalidField(_)
            | PaymentError::CustomerNotProvisioned
            | PaymentError::WebhookSignatureInvalid => (StatusCode::BAD_REQUEST, self.to_string()),
            PaymentError::Store(_)
            | PaymentError::Serialization(_)
            | PaymentError::Config(_)
            | PaymentError::Http(_)
            | PaymentError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        if status.is_server_error() {
            tracing::error!(%status, error = %self, "Payment service error");
        } else {
            tracing::warn!(%status, error = %self, "Request rejected");
        }

        (status, Json(ErrorBody { error: message })).into_response()
    }
}

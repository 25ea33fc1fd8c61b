pub mod config;
pub mod error;
pub mod handlers;
pub mod push;
pub mod renewal;
pub mod service;
pub mod sheets;
pub mod split;
pub mod types;
pub mod webhooks;

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::{Method, header};
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::Config;
pub use error::{PaymentError, Result};
pub use service::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/customers", post(handlers::ensure_customer))
        .route("/customers/lookup", get(handlers::lookup_customer))
        .route(
            "/payment-methods/attach",
            post(handlers::attach_payment_method),
        )
        .route(
            "/payment-methods/default",
            post(handlers::set_default_payment_method),
        )
        .route("/charges/cart", post(handlers::charge_cart))
        .route("/charges/intent", post(handlers::create_split_intent))
        .route("/subscriptions", post(handlers::subscribe))
        .route("/renewals/run", post(handlers::run_renewals))
        .route("/push/subscriptions", post(handlers::save_push_subscription))
        .route("/push/send", post(handlers::send_push))
        .route("/webhooks/stripe", post(webhooks::handle_stripe_webhook))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .with_state(state)
}

pub mod app_state;
pub mod config;
pub mod ecpay;
pub mod ecpay_payment;
pub mod factory;
pub mod gateway;
pub mod logistics;
pub mod logistics_handlers;
pub mod payment_handlers;
pub mod pg_store;
pub mod repo;
pub mod webhook;
pub mod webhook_handlers;

use axum::{
    extract::State,
    http::{
        header::{ACCEPT, CONTENT_TYPE},
        HeaderValue, Method,
    },
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use common_http_errors::{http_error_metrics_layer, ApiError};
use tower_http::cors::{AllowOrigin, CorsLayer};

pub use crate::app_state::AppState;
pub use crate::config::{CredentialSource, EnvCredentialSource, MerchantCredentials, PaymentSettings, ServiceConfig, StaticCredentialSource};
pub use crate::repo::{CheckoutStore, InMemoryCheckoutStore};
pub use crate::webhook::GatewayAck;

pub const SERVICE_NAME: &str = "checkout-service";

async fn metrics(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let text = state.metrics.render_text().map_err(|e| ApiError::internal(e, None))?;
    Ok(([(CONTENT_TYPE, "text/plain; version=0.0.4")], text))
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(
            state
                .config
                .allowed_origins
                .iter()
                .filter_map(|origin| origin.parse::<HeaderValue>().ok())
                .collect::<Vec<_>>(),
        ))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([ACCEPT, CONTENT_TYPE]);

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/metrics", get(metrics))
        .route("/payments", post(payment_handlers::create_payment))
        .route("/webhooks/ecpay/payment", post(webhook_handlers::ecpay_payment_webhook))
        .route("/webhooks/ecpay/logistics", post(webhook_handlers::ecpay_logistics_webhook))
        .route("/logistics/store-map", get(logistics_handlers::store_map))
        .route("/logistics/store-reply", post(logistics_handlers::store_reply))
        .route("/logistics/store-selected", get(logistics_handlers::store_selected_page))
        .route("/shipments", post(logistics_handlers::create_shipment))
        .route("/shipments/:trade_no/status", get(logistics_handlers::shipment_status))
        .layer(middleware::from_fn(http_error_metrics_layer(SERVICE_NAME)))
        .layer(cors)
        .with_state(state)
}

use axum::{
    extract::State,
    response::{IntoResponse, Response},
    Json,
};
use common_http_errors::{ApiError, ApiResult};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::factory;
use crate::gateway::PaymentOrderParams;

fn default_currency() -> String {
    "TWD".to_string()
}

/// Payment start request. `notifyUrl` defaults to this service's webhook
/// route and `returnUrl` to `PAYMENT_RETURN_URL`; without either no return
/// link is sent.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentRequest {
    pub order_id: String,
    pub amount: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub customer_email: String,
    pub return_url: Option<String>,
    pub notify_url: Option<String>,
    #[serde(default)]
    pub is_deposit: bool,
}

pub async fn create_payment(State(state): State<AppState>, Json(req): Json<CreatePaymentRequest>) -> ApiResult<Response> {
    let trace_id = Uuid::new_v4();
    let order = state
        .store
        .find_order(&req.order_id)
        .await
        .map_err(|e| ApiError::internal(e, Some(trace_id)))?;
    if order.is_none() {
        return Err(ApiError::NotFound { code: "order_not_found", trace_id: Some(trace_id) });
    }

    let Some(gateway) = factory::active_payment_adapter(state.credentials.as_ref(), &state.config).await else {
        info!(order_id = %req.order_id, "No payment adapter configured; manual payment");
        return Ok(Json(json!({ "success": false, "manual": true })).into_response());
    };

    let params = PaymentOrderParams {
        return_url: req
            .return_url
            .or_else(|| state.config.payment_return_url_for(&req.order_id))
            .unwrap_or_default(),
        notify_url: req
            .notify_url
            .unwrap_or_else(|| state.config.public_url("/webhooks/ecpay/payment")),
        order_id: req.order_id,
        amount: req.amount,
        currency: req.currency,
        description: req.description,
        customer_email: req.customer_email,
        is_deposit: req.is_deposit,
    };
    let result = gateway.create_payment(&params).await;
    state.metrics.record_gateway_call("create_payment", result.is_success());
    Ok(Json(result).into_response())
}

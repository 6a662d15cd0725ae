use axum::{
    extract::{Path, Query, State},
    response::{Html, Redirect},
    Form, Json,
};
use common_http_errors::{ApiError, ApiResult};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::ecpay;
use crate::factory;
use crate::logistics::{CreateShipmentParams, CvsSubType, EcpayLogistics, LogisticsError, ShipmentCreated, ShipmentStatusReport};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreMapQuery {
    pub sub_type: String,
    pub trade_no: String,
}

/// Store selection posted back by the gateway's map page.
#[derive(Debug, Default, Deserialize)]
pub struct StoreReplyForm {
    #[serde(rename = "CVSStoreID", default)]
    pub store_id: String,
    #[serde(rename = "CVSStoreName", default)]
    pub store_name: String,
    #[serde(rename = "CVSAddress", default)]
    pub address: String,
    #[serde(rename = "CVSOutSide", default)]
    pub outside: String,
    #[serde(rename = "LogisticsSubType", default)]
    pub sub_type: String,
    #[serde(rename = "MerchantTradeNo", default)]
    pub trade_no: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateShipmentResponse {
    #[serde(flatten)]
    pub created: ShipmentCreated,
    pub shipment_linked: bool,
}

async fn logistics_adapter(state: &AppState) -> ApiResult<EcpayLogistics> {
    factory::active_logistics_adapter(state.credentials.as_ref(), &state.http_client, &state.config)
        .await
        .ok_or(ApiError::BadRequest {
            code: "logistics_not_configured",
            trace_id: None,
            message: Some("logistics credentials are not configured".into()),
        })
}

fn gateway_error(err: LogisticsError) -> ApiError {
    match err {
        LogisticsError::InvalidRequest(message) => ApiError::BadRequest {
            code: "invalid_shipment_request",
            trace_id: None,
            message: Some(message),
        },
        other => ApiError::bad_gateway(other.code(), other.to_string()),
    }
}

pub async fn store_map(State(state): State<AppState>, Query(q): Query<StoreMapQuery>) -> ApiResult<Html<String>> {
    let sub_type = CvsSubType::parse(&q.sub_type).ok_or(ApiError::bad_request("invalid_sub_type", None))?;
    if ecpay::sanitize_trade_no(&q.trade_no).is_empty() {
        return Err(ApiError::bad_request("invalid_trade_no", None));
    }
    let adapter = logistics_adapter(&state).await?;
    let reply_url = state.config.public_url("/logistics/store-reply");
    Ok(Html(adapter.store_selection_redirect(&reply_url, sub_type, &q.trade_no)))
}

/// Hand the selection back to the browser as query parameters on the
/// client page.
pub async fn store_reply(State(state): State<AppState>, Form(form): Form<StoreReplyForm>) -> Redirect {
    let client = &state.config.store_selection_client_url;
    let separator = if client.contains('?') { '&' } else { '?' };
    let query = [
        ("storeId", &form.store_id),
        ("storeName", &form.store_name),
        ("address", &form.address),
        ("subType", &form.sub_type),
        ("outside", &form.outside),
        ("tradeNo", &form.trade_no),
    ]
    .iter()
    .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
    .collect::<Vec<_>>()
    .join("&");
    info!(store_id = %form.store_id, sub_type = %form.sub_type, "Store selected");
    Redirect::to(&format!("{client}{separator}{query}"))
}

/// Default client page: relays the selection to the window that opened
/// the store picker and closes itself.
pub async fn store_selected_page() -> Html<&'static str> {
    Html(STORE_SELECTED_HTML)
}

const STORE_SELECTED_HTML: &str = r#"<!DOCTYPE html>
<html><head><meta charset="utf-8"><title>Store selected</title></head>
<body>
<script>
(function () {
  var params = new URLSearchParams(window.location.search);
  var store = {};
  params.forEach(function (value, key) { store[key] = value; });
  if (window.opener) {
    window.opener.postMessage({ type: "cvs-store-selected", store: store }, window.location.origin);
    window.close();
  } else {
    document.body.textContent = "Store selected: " + (store.storeName || store.storeId || "");
  }
})();
</script>
</body></html>
"#;

pub async fn create_shipment(
    State(state): State<AppState>,
    Json(mut params): Json<CreateShipmentParams>,
) -> ApiResult<Json<CreateShipmentResponse>> {
    let adapter = logistics_adapter(&state).await?;
    if params.server_reply_url.trim().is_empty() {
        params.server_reply_url = state.config.public_url("/webhooks/ecpay/logistics");
    }

    let result = adapter.create_shipment(&params).await;
    state.metrics.record_gateway_call("create_shipment", result.is_ok());
    let created = result.map_err(gateway_error)?;

    let trade_no = ecpay::sanitize_trade_no(&params.merchant_trade_no);
    let shipment = state
        .store
        .find_shipment(Some(&trade_no), None)
        .await
        .map_err(|e| ApiError::internal(e, None))?;
    let shipment_linked = match shipment {
        Some(shipment) => state
            .store
            .attach_logistics_refs(&shipment.id, &created.logistics_id, Some(&created.shipment_no))
            .await
            .map_err(|e| ApiError::internal(e, None))?,
        None => {
            warn!(trade_no = %trade_no, logistics_id = %created.logistics_id, "Created shipment has no local record");
            false
        }
    };
    Ok(Json(CreateShipmentResponse { created, shipment_linked }))
}

pub async fn shipment_status(State(state): State<AppState>, Path(trade_no): Path<String>) -> ApiResult<Json<ShipmentStatusReport>> {
    let adapter = logistics_adapter(&state).await?;
    let result = adapter.query_status(&trade_no).await;
    state.metrics.record_gateway_call("query_status", result.is_ok());
    result.map(Json).map_err(gateway_error)
}

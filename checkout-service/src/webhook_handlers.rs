use axum::body::Bytes;
use axum::extract::State;
use tracing::{error, warn};

use crate::app_state::AppState;
use crate::ecpay;
use crate::factory;
use crate::gateway::{Fields, PaymentGateway};
use crate::webhook::{self, GatewayAck};

const SIGNATURE_FAILURE: &str = "CheckMacValue verify fail";

fn decode(body: &Bytes) -> (String, Option<Fields>) {
    let text = String::from_utf8_lossy(body).into_owned();
    let fields = ecpay::parse_form(&text);
    let fields = (!fields.is_empty()).then_some(fields);
    (text, fields)
}

/// Payment result notification (`ReturnURL`). Everything after a valid
/// signature is acknowledged with `1|OK`, including internal failures.
pub async fn ecpay_payment_webhook(State(state): State<AppState>, body: Bytes) -> GatewayAck {
    let (raw, payload) = decode(&body);
    let Some(payload) = payload else {
        warn!("Payment callback with empty or malformed body");
        state.metrics.record_webhook("payment", "rejected");
        return GatewayAck::Reject("malformed payload".into());
    };
    let Some(gateway) = factory::ecpay_payment_adapter(state.credentials.as_ref(), &state.config).await else {
        error!("Payment callback received but payment credentials are not configured");
        state.metrics.record_webhook("payment", "rejected");
        return GatewayAck::Reject("gateway not configured".into());
    };

    let result = gateway.verify_webhook(&payload, &raw);
    if !result.is_valid {
        warn!(order_id = %result.order_id, trade_no = %result.transaction_id, "Payment callback failed signature check");
        state.metrics.record_webhook("payment", "rejected");
        return GatewayAck::Reject(SIGNATURE_FAILURE.into());
    }

    match webhook::apply_payment_notification(state.store.as_ref(), &result, gateway.provider()).await {
        Ok(transition) => state.record_transition("payment", transition),
        Err(err) => {
            error!(order_id = %result.order_id, error = %err, "Failed to apply verified payment callback");
            state.metrics.record_webhook("payment", "error");
        }
    }
    GatewayAck::Ok
}

/// Logistics status notification (`ServerReplyURL` of shipment creation).
pub async fn ecpay_logistics_webhook(State(state): State<AppState>, body: Bytes) -> GatewayAck {
    let (_, payload) = decode(&body);
    let Some(payload) = payload else {
        warn!("Logistics callback with empty or malformed body");
        state.metrics.record_webhook("logistics", "rejected");
        return GatewayAck::Reject("malformed payload".into());
    };
    let Some(adapter) = factory::active_logistics_adapter(state.credentials.as_ref(), &state.http_client, &state.config).await else {
        error!("Logistics callback received but logistics credentials are not configured");
        state.metrics.record_webhook("logistics", "rejected");
        return GatewayAck::Reject("gateway not configured".into());
    };

    if !adapter.verify_webhook(&payload) {
        warn!(
            trade_no = payload.get("MerchantTradeNo").map(String::as_str).unwrap_or_default(),
            "Logistics callback failed signature check"
        );
        state.metrics.record_webhook("logistics", "rejected");
        return GatewayAck::Reject(SIGNATURE_FAILURE.into());
    }

    match webhook::apply_logistics_notification(state.store.as_ref(), &payload).await {
        Ok(transition) => state.record_transition("logistics", transition),
        Err(err) => {
            error!(error = %err, "Failed to apply verified logistics callback");
            state.metrics.record_webhook("logistics", "error");
        }
    }
    GatewayAck::Ok
}

use anyhow::{bail, Result};
use axum::http::{header::CONTENT_TYPE, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::ecpay;
use crate::gateway::{Fields, PaymentStatus, WebhookVerifyResult};
use crate::logistics::{describe_code, shipment_status_for_code};
use crate::repo::{CheckoutStore, OrderStatus, PaymentRecord, ShipmentStatus, StatusUpdate, TimelineEntry};

/// Attempts per delivery before a version conflict is reported as an error.
const MAX_VERSION_RETRIES: usize = 3;
const LOGISTICS_OPERATOR: &str = "ecpay";

/// Plain-text acknowledgment the gateway expects on every callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayAck {
    Ok,
    Reject(String),
}

impl GatewayAck {
    pub fn body(&self) -> String {
        match self {
            GatewayAck::Ok => "1|OK".to_string(),
            GatewayAck::Reject(reason) => format!("0|{reason}"),
        }
    }
}

impl IntoResponse for GatewayAck {
    fn into_response(self) -> Response {
        (StatusCode::OK, [(CONTENT_TYPE, "text/plain; charset=utf-8")], self.body()).into_response()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// Same entry as the last one already logged.
    Duplicate,
    /// No order or shipment for the correlation key.
    Unmatched,
    /// Would move a row backwards.
    Ignored,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Applied => "applied",
            Transition::Duplicate => "duplicate",
            Transition::Unmatched => "unmatched",
            Transition::Ignored => "ignored",
        }
    }
}

fn payment_note(result: &WebhookVerifyResult, provider: &str) -> String {
    let mut note = match result.status {
        PaymentStatus::Paid if result.is_deposit => format!("Deposit paid via {provider}"),
        PaymentStatus::Paid => format!("Payment received via {provider}"),
        PaymentStatus::Failed => format!("Payment failed via {provider}"),
        PaymentStatus::Refunded => format!("Payment refunded via {provider}"),
    };
    note.push_str(&format!(" (code {}", result.rtn_code));
    if !result.rtn_msg.is_empty() {
        note.push_str(&format!(": {}", result.rtn_msg));
    }
    if !result.transaction_id.is_empty() {
        note.push_str(&format!(", trade {}", result.transaction_id));
    }
    if result.status == PaymentStatus::Paid {
        note.push_str(&format!(", amount {}", result.amount));
    }
    note.push(')');
    if result.simulated {
        note.push_str(" [simulated]");
    }
    note
}

/// Apply a verified payment callback to its order.
pub async fn apply_payment_notification(store: &dyn CheckoutStore, result: &WebhookVerifyResult, provider: &str) -> Result<Transition> {
    let note = payment_note(result, provider);

    for attempt in 1..=MAX_VERSION_RETRIES {
        let Some(order) = store.find_order(&result.order_id).await? else {
            warn!(order_id = %result.order_id, rtn_code = %result.rtn_code, "Payment callback for unknown order");
            return Ok(Transition::Unmatched);
        };

        let outcome = match result.status {
            PaymentStatus::Paid => {
                record_payment(store, result, provider).await?;
                let entry = TimelineEntry::new(OrderStatus::Paid, note.clone());
                if order.status == OrderStatus::Paid && order.repeats_last(&entry) {
                    return Ok(Transition::Duplicate);
                }
                if order.status.is_paid_or_later() {
                    debug!(order_id = %order.id, status = order.status.as_str(), "Order already past payment");
                    return Ok(Transition::Ignored);
                }
                store.update_order(&order.id, order.version, OrderStatus::Paid, entry).await?
            }
            PaymentStatus::Failed | PaymentStatus::Refunded => {
                if order.status.is_paid_or_later() {
                    info!(order_id = %order.id, status = order.status.as_str(), rtn_code = %result.rtn_code, "Ignoring failure callback for settled order");
                    return Ok(Transition::Ignored);
                }
                let entry = TimelineEntry::new(OrderStatus::Pending, note.clone());
                if order.repeats_last(&entry) {
                    return Ok(Transition::Duplicate);
                }
                store.update_order(&order.id, order.version, OrderStatus::Pending, entry).await?
            }
        };

        if outcome {
            info!(order_id = %order.id, status = result.status.as_str(), "Applied payment callback");
            return Ok(Transition::Applied);
        }
        debug!(order_id = %order.id, attempt, "Order version moved; retrying");
    }
    bail!("order {} kept changing during payment update", result.order_id)
}

async fn record_payment(store: &dyn CheckoutStore, result: &WebhookVerifyResult, provider: &str) -> Result<()> {
    let record = PaymentRecord {
        id: PaymentRecord::stable_id(&result.order_id, &result.transaction_id),
        order_id: result.order_id.clone(),
        transaction_id: result.transaction_id.clone(),
        provider: provider.to_string(),
        amount: result.amount,
        status: result.status.as_str().to_string(),
        raw: serde_json::to_value(&result.raw_data)?,
    };
    store.upsert_payment(&record).await
}

/// Apply a verified logistics callback to its shipment, cascading delivery
/// and pickup-ready events onto the order.
pub async fn apply_logistics_notification(store: &dyn CheckoutStore, payload: &Fields) -> Result<Transition> {
    let get = |k: &str| payload.get(k).map(|v| v.trim()).filter(|v| !v.is_empty());
    let code = get("RtnCode").unwrap_or_default();
    let status = shipment_status_for_code(code);
    let message = get("RtnMsg").map(str::to_string).unwrap_or_else(|| describe_code(code));
    let description = format!("[{code}] {message}");
    let timestamp = get("UpdateStatusDate")
        .and_then(ecpay::parse_trade_timestamp)
        .unwrap_or_else(Utc::now);
    let trade_no = get("MerchantTradeNo");
    let logistics_id = get("AllPayLogisticsID");

    let mut shipment_outcome = None;
    let mut order_id = String::new();
    for attempt in 1..=MAX_VERSION_RETRIES {
        let Some(shipment) = store.find_shipment(trade_no, logistics_id).await? else {
            warn!(trade_no = ?trade_no, logistics_id = ?logistics_id, rtn_code = %code, "Logistics callback for unknown shipment");
            return Ok(Transition::Unmatched);
        };
        order_id = shipment.order_id.clone();

        let update = StatusUpdate { timestamp, status, description: description.clone(), operator: LOGISTICS_OPERATOR.to_string() };
        if shipment.repeats_last(&update) {
            shipment_outcome = Some(Transition::Duplicate);
            break;
        }
        if shipment.shipment_status == ShipmentStatus::Delivered && status != ShipmentStatus::Delivered {
            info!(shipment_id = %shipment.id, rtn_code = %code, "Ignoring status change after delivery");
            return Ok(Transition::Ignored);
        }
        let delivered_at = (status == ShipmentStatus::Delivered && shipment.delivered_at.is_none()).then_some(timestamp);
        if store.update_shipment(&shipment.id, shipment.version, status, update, delivered_at).await? {
            info!(shipment_id = %shipment.id, status = status.as_str(), rtn_code = %code, "Applied logistics callback");
            shipment_outcome = Some(Transition::Applied);
            break;
        }
        debug!(shipment_id = %shipment.id, attempt, "Shipment version moved; retrying");
    }
    let Some(outcome) = shipment_outcome else {
        bail!("shipment {:?} kept changing during status update", trade_no.or(logistics_id));
    };

    // The cascade is itself deduplicated, so it runs on redelivery too and
    // completes a cascade interrupted by an earlier failure.
    match status {
        ShipmentStatus::Delivered => {
            cascade_order(store, &order_id, Some(OrderStatus::Delivered), "Package picked up by recipient").await?;
        }
        ShipmentStatus::OutForDelivery => {
            cascade_order(store, &order_id, None, "Package arrived at pickup point").await?;
        }
        _ => {}
    }
    Ok(outcome)
}

/// Append an order timeline entry, optionally moving the status. Terminal
/// orders are left alone.
async fn cascade_order(store: &dyn CheckoutStore, order_id: &str, new_status: Option<OrderStatus>, note: &str) -> Result<()> {
    for _ in 0..MAX_VERSION_RETRIES {
        let Some(order) = store.find_order(order_id).await? else {
            warn!(order_id = %order_id, "Shipment references unknown order");
            return Ok(());
        };
        let status = new_status.unwrap_or(order.status);
        if order.status.is_terminal() && status != order.status {
            info!(order_id = %order_id, status = order.status.as_str(), "Order already final; skipping cascade");
            return Ok(());
        }
        let entry = TimelineEntry::new(status, note);
        if order.repeats_last(&entry) {
            return Ok(());
        }
        if store.update_order(&order.id, order.version, status, entry).await? {
            return Ok(());
        }
    }
    bail!("order {order_id} kept changing during shipment cascade")
}

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Paid,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Processing => "processing",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<OrderStatus> {
        match s {
            "pending" => Some(OrderStatus::Pending),
            "paid" => Some(OrderStatus::Paid),
            "processing" => Some(OrderStatus::Processing),
            "shipped" => Some(OrderStatus::Shipped),
            "delivered" => Some(OrderStatus::Delivered),
            "cancelled" => Some(OrderStatus::Cancelled),
            "refunded" => Some(OrderStatus::Refunded),
            _ => None,
        }
    }

    /// Delivered, cancelled and refunded never move again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled | OrderStatus::Refunded)
    }

    /// True once payment has been captured (paid or any later fulfilment step).
    pub fn is_paid_or_later(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub status: OrderStatus,
    pub date: DateTime<Utc>,
    pub note: String,
}

impl TimelineEntry {
    pub fn new(status: OrderStatus, note: impl Into<String>) -> Self {
        Self { status, date: Utc::now(), note: note.into() }
    }

    /// Same logical entry, ignoring when it was written.
    pub fn same_as(&self, other: &TimelineEntry) -> bool {
        self.status == other.status && self.note == other.note
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub status: OrderStatus,
    pub timeline: Vec<TimelineEntry>,
    pub version: i64,
}

impl Order {
    pub fn new(id: impl Into<String>, status: OrderStatus) -> Self {
        Self { id: id.into(), status, timeline: Vec::new(), version: 0 }
    }

    pub fn repeats_last(&self, entry: &TimelineEntry) -> bool {
        self.timeline.last().is_some_and(|last| last.same_as(entry))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShipmentStatus {
    Pending,
    InTransit,
    OutForDelivery,
    Delivered,
    Failed,
    Returned,
}

impl ShipmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShipmentStatus::Pending => "pending",
            ShipmentStatus::InTransit => "in_transit",
            ShipmentStatus::OutForDelivery => "out_for_delivery",
            ShipmentStatus::Delivered => "delivered",
            ShipmentStatus::Failed => "failed",
            ShipmentStatus::Returned => "returned",
        }
    }

    pub fn parse(s: &str) -> Option<ShipmentStatus> {
        match s {
            "pending" => Some(ShipmentStatus::Pending),
            "in_transit" => Some(ShipmentStatus::InTransit),
            "out_for_delivery" => Some(ShipmentStatus::OutForDelivery),
            "delivered" => Some(ShipmentStatus::Delivered),
            "failed" => Some(ShipmentStatus::Failed),
            "returned" => Some(ShipmentStatus::Returned),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub timestamp: DateTime<Utc>,
    pub status: ShipmentStatus,
    pub description: String,
    pub operator: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shipment {
    pub id: String,
    pub order_id: String,
    pub carrier: String,
    pub tracking_number: Option<String>,
    pub merchant_trade_no: Option<String>,
    pub logistics_id: Option<String>,
    pub shipment_status: ShipmentStatus,
    pub status_updates: Vec<StatusUpdate>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl Shipment {
    pub fn new(id: impl Into<String>, order_id: impl Into<String>, carrier: impl Into<String>, merchant_trade_no: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            order_id: order_id.into(),
            carrier: carrier.into(),
            tracking_number: None,
            merchant_trade_no: Some(merchant_trade_no.into()),
            logistics_id: None,
            shipment_status: ShipmentStatus::Pending,
            status_updates: Vec::new(),
            delivered_at: None,
            version: 0,
        }
    }

    pub fn repeats_last(&self, update: &StatusUpdate) -> bool {
        self.status_updates
            .last()
            .is_some_and(|last| last.status == update.status && last.description == update.description)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: String,
    pub order_id: String,
    pub transaction_id: String,
    pub provider: String,
    pub amount: i64,
    pub status: String,
    pub raw: serde_json::Value,
}

impl PaymentRecord {
    /// Identifier derived from the business keys so redelivery upserts
    /// the same row.
    pub fn stable_id(order_id: &str, transaction_id: &str) -> String {
        common_crypto::stable_key("pay_", &[order_id, transaction_id])
    }
}

/// Order, shipment and payment persistence. Updates are compare-and-swap on
/// `version` and return `false` when the row moved underneath the caller.
#[async_trait::async_trait]
pub trait CheckoutStore: Send + Sync {
    async fn find_order(&self, id: &str) -> Result<Option<Order>>;
    /// Set `status` and append `entry` in one write.
    async fn update_order(&self, id: &str, expected_version: i64, status: OrderStatus, entry: TimelineEntry) -> Result<bool>;
    async fn upsert_payment(&self, payment: &PaymentRecord) -> Result<()>;
    async fn payments_for_order(&self, order_id: &str) -> Result<Vec<PaymentRecord>>;
    /// Trade number wins when both keys are given and both match.
    async fn find_shipment(&self, merchant_trade_no: Option<&str>, logistics_id: Option<&str>) -> Result<Option<Shipment>>;
    /// Set `status`, append `update` and stamp `delivered_at` (when given) in one write.
    async fn update_shipment(
        &self,
        id: &str,
        expected_version: i64,
        status: ShipmentStatus,
        update: StatusUpdate,
        delivered_at: Option<DateTime<Utc>>,
    ) -> Result<bool>;
    async fn attach_logistics_refs(&self, shipment_id: &str, logistics_id: &str, tracking_number: Option<&str>) -> Result<bool>;
}

#[derive(Default)]
struct Tables {
    orders: HashMap<String, Order>,
    shipments: HashMap<String, Shipment>,
    payments: HashMap<String, PaymentRecord>,
}

/// Process-local store used when no database is configured.
#[derive(Default)]
pub struct InMemoryCheckoutStore {
    tables: RwLock<Tables>,
}

impl InMemoryCheckoutStore {
    pub fn new() -> Self { Self::default() }

    pub async fn insert_order(&self, order: Order) {
        self.tables.write().await.orders.insert(order.id.clone(), order);
    }

    pub async fn insert_shipment(&self, shipment: Shipment) {
        self.tables.write().await.shipments.insert(shipment.id.clone(), shipment);
    }

    pub async fn shipment(&self, id: &str) -> Option<Shipment> {
        self.tables.read().await.shipments.get(id).cloned()
    }
}

fn matches_key(value: &Option<String>, key: Option<&str>) -> bool {
    match (value.as_deref(), key) {
        (Some(v), Some(k)) => !k.is_empty() && v == k,
        _ => false,
    }
}

/// Most recently changed row (highest version) when a key is shared.
fn latest<'a>(candidates: impl Iterator<Item = &'a Shipment>) -> Option<&'a Shipment> {
    candidates.max_by(|a, b| a.version.cmp(&b.version).then_with(|| b.id.cmp(&a.id)))
}

#[async_trait::async_trait]
impl CheckoutStore for InMemoryCheckoutStore {
    async fn find_order(&self, id: &str) -> Result<Option<Order>> {
        Ok(self.tables.read().await.orders.get(id).cloned())
    }

    async fn update_order(&self, id: &str, expected_version: i64, status: OrderStatus, entry: TimelineEntry) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.orders.get_mut(id) {
            Some(order) if order.version == expected_version => {
                order.timeline.push(entry);
                order.status = status;
                order.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn upsert_payment(&self, payment: &PaymentRecord) -> Result<()> {
        self.tables.write().await.payments.insert(payment.id.clone(), payment.clone());
        Ok(())
    }

    async fn payments_for_order(&self, order_id: &str) -> Result<Vec<PaymentRecord>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<PaymentRecord> = tables
            .payments
            .values()
            .filter(|p| p.order_id == order_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rows)
    }

    async fn find_shipment(&self, merchant_trade_no: Option<&str>, logistics_id: Option<&str>) -> Result<Option<Shipment>> {
        let tables = self.tables.read().await;
        let found = latest(tables.shipments.values().filter(|s| matches_key(&s.merchant_trade_no, merchant_trade_no)))
            .or_else(|| latest(tables.shipments.values().filter(|s| matches_key(&s.logistics_id, logistics_id))));
        Ok(found.cloned())
    }

    async fn update_shipment(
        &self,
        id: &str,
        expected_version: i64,
        status: ShipmentStatus,
        update: StatusUpdate,
        delivered_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.shipments.get_mut(id) {
            Some(shipment) if shipment.version == expected_version => {
                shipment.status_updates.push(update);
                shipment.shipment_status = status;
                if delivered_at.is_some() {
                    shipment.delivered_at = delivered_at;
                }
                shipment.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn attach_logistics_refs(&self, shipment_id: &str, logistics_id: &str, tracking_number: Option<&str>) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let Some(shipment) = tables.shipments.get_mut(shipment_id) else {
            return Ok(false);
        };
        shipment.logistics_id = Some(logistics_id.to_string());
        if let Some(tracking) = tracking_number.filter(|t| !t.is_empty()) {
            shipment.tracking_number = Some(tracking.to_string());
        }
        shipment.version += 1;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let store = InMemoryCheckoutStore::new();
        store.insert_order(Order::new("o-1", OrderStatus::Pending)).await;

        let entry = TimelineEntry::new(OrderStatus::Paid, "paid");
        assert!(store.update_order("o-1", 0, OrderStatus::Paid, entry.clone()).await.unwrap());
        assert!(!store.update_order("o-1", 0, OrderStatus::Paid, entry).await.unwrap());

        let order = store.find_order("o-1").await.unwrap().unwrap();
        assert_eq!(order.version, 1);
        assert_eq!(order.timeline.len(), 1);
        assert_eq!(order.status, OrderStatus::Paid);
    }

    #[tokio::test]
    async fn shipments_resolve_by_either_key() {
        let store = InMemoryCheckoutStore::new();
        store.insert_shipment(Shipment::new("s-1", "o-1", "ecpay", "SOM202501010001")).await;
        assert!(store.attach_logistics_refs("s-1", "1718546", Some("F01234567")).await.unwrap());

        let by_trade = store.find_shipment(Some("SOM202501010001"), None).await.unwrap();
        let by_logistics = store.find_shipment(None, Some("1718546")).await.unwrap();
        assert_eq!(by_trade.map(|s| s.id), Some("s-1".to_string()));
        let found = by_logistics.unwrap();
        assert_eq!(found.tracking_number.as_deref(), Some("F01234567"));
        assert!(store.find_shipment(Some(""), Some("")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn payment_upsert_is_keyed_by_id() {
        let store = InMemoryCheckoutStore::new();
        let id = PaymentRecord::stable_id("o-1", "T1");
        let record = PaymentRecord {
            id: id.clone(),
            order_id: "o-1".into(),
            transaction_id: "T1".into(),
            provider: "ecpay".into(),
            amount: 100,
            status: "paid".into(),
            raw: serde_json::json!({}),
        };
        store.upsert_payment(&record).await.unwrap();
        store.upsert_payment(&record).await.unwrap();
        assert_eq!(store.payments_for_order("o-1").await.unwrap().len(), 1);
        assert_eq!(id, PaymentRecord::stable_id("o-1", "T1"));
    }

    #[test]
    fn status_strings_round_trip() {
        for s in ["pending", "in_transit", "out_for_delivery", "delivered", "failed", "returned"] {
            assert_eq!(ShipmentStatus::parse(s).map(|v| v.as_str()), Some(s));
        }
        for s in ["pending", "paid", "processing", "shipped", "delivered", "cancelled", "refunded"] {
            assert_eq!(OrderStatus::parse(s).map(|v| v.as_str()), Some(s));
        }
        assert_eq!(OrderStatus::parse("PAID"), None);
        assert!(OrderStatus::Delivered.is_terminal());
        assert!(!OrderStatus::Paid.is_terminal());
    }

    #[tokio::test]
    async fn shared_trade_number_resolves_to_latest_shipment() {
        let store = InMemoryCheckoutStore::new();
        store.insert_shipment(Shipment::new("s-old", "o-1", "ecpay", "SOM202501010001")).await;
        store.insert_shipment(Shipment::new("s-new", "o-1", "ecpay", "SOM202501010001")).await;
        let update = StatusUpdate {
            timestamp: Utc::now(),
            status: ShipmentStatus::InTransit,
            description: "[310] accepted".into(),
            operator: "ecpay".into(),
        };
        assert!(store.update_shipment("s-new", 0, ShipmentStatus::InTransit, update, None).await.unwrap());

        for _ in 0..10 {
            let found = store.find_shipment(Some("SOM202501010001"), None).await.unwrap().unwrap();
            assert_eq!(found.id, "s-new");
        }
    }
}

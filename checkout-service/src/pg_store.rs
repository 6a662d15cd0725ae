use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{Executor, PgPool};
use std::collections::HashMap;

use crate::config::{parse_flag, CredentialSource, MerchantCredentials, PaymentSettings};
use crate::repo::{CheckoutStore, Order, OrderStatus, PaymentRecord, Shipment, ShipmentStatus, StatusUpdate, TimelineEntry};

const SCHEMA: [&str; 4] = [
    r#"CREATE TABLE IF NOT EXISTS orders (
        id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        timeline JSONB NOT NULL DEFAULT '[]'::jsonb,
        version BIGINT NOT NULL DEFAULT 0,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS shipments (
        id TEXT PRIMARY KEY,
        order_id TEXT NOT NULL,
        carrier TEXT NOT NULL,
        tracking_number TEXT NULL,
        merchant_trade_no TEXT NULL,
        logistics_id TEXT NULL,
        shipment_status TEXT NOT NULL DEFAULT 'pending',
        status_updates JSONB NOT NULL DEFAULT '[]'::jsonb,
        delivered_at TIMESTAMPTZ NULL,
        version BIGINT NOT NULL DEFAULT 0,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS payments (
        id TEXT PRIMARY KEY,
        order_id TEXT NOT NULL,
        transaction_id TEXT NOT NULL,
        provider TEXT NOT NULL,
        amount BIGINT NOT NULL,
        status TEXT NOT NULL,
        raw JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS gateway_settings (
        scope TEXT NOT NULL,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (scope, key)
    )"#,
];

#[derive(Clone)]
pub struct PgCheckoutStore {
    pool: PgPool,
}

impl PgCheckoutStore {
    pub fn new(pool: PgPool) -> Self { Self { pool } }

    pub fn pool(&self) -> &PgPool { &self.pool }

    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            self.pool.execute(statement).await.context("failed to apply checkout schema")?;
        }
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: String,
    status: String,
    timeline: Json<Vec<TimelineEntry>>,
    version: i64,
}

impl TryFrom<OrderRow> for Order {
    type Error = anyhow::Error;

    fn try_from(row: OrderRow) -> Result<Self> {
        let status = OrderStatus::parse(&row.status)
            .ok_or_else(|| anyhow!("order {} has unknown status {}", row.id, row.status))?;
        Ok(Order { id: row.id, status, timeline: row.timeline.0, version: row.version })
    }
}

#[derive(sqlx::FromRow)]
struct ShipmentRow {
    id: String,
    order_id: String,
    carrier: String,
    tracking_number: Option<String>,
    merchant_trade_no: Option<String>,
    logistics_id: Option<String>,
    shipment_status: String,
    status_updates: Json<Vec<StatusUpdate>>,
    delivered_at: Option<DateTime<Utc>>,
    version: i64,
}

impl TryFrom<ShipmentRow> for Shipment {
    type Error = anyhow::Error;

    fn try_from(row: ShipmentRow) -> Result<Self> {
        let shipment_status = ShipmentStatus::parse(&row.shipment_status)
            .ok_or_else(|| anyhow!("shipment {} has unknown status {}", row.id, row.shipment_status))?;
        Ok(Shipment {
            id: row.id,
            order_id: row.order_id,
            carrier: row.carrier,
            tracking_number: row.tracking_number,
            merchant_trade_no: row.merchant_trade_no,
            logistics_id: row.logistics_id,
            shipment_status,
            status_updates: row.status_updates.0,
            delivered_at: row.delivered_at,
            version: row.version,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PaymentRow {
    id: String,
    order_id: String,
    transaction_id: String,
    provider: String,
    amount: i64,
    status: String,
    raw: Json<serde_json::Value>,
}

impl From<PaymentRow> for PaymentRecord {
    fn from(row: PaymentRow) -> Self {
        PaymentRecord {
            id: row.id,
            order_id: row.order_id,
            transaction_id: row.transaction_id,
            provider: row.provider,
            amount: row.amount,
            status: row.status,
            raw: row.raw.0,
        }
    }
}

const SHIPMENT_COLUMNS: &str = "id, order_id, carrier, tracking_number, merchant_trade_no, logistics_id, shipment_status, status_updates, delivered_at, version";

impl PgCheckoutStore {
    async fn shipment_where(&self, column: &str, key: &str) -> Result<Option<Shipment>> {
        let sql = format!("SELECT {SHIPMENT_COLUMNS} FROM shipments WHERE {column} = $1 ORDER BY updated_at DESC LIMIT 1");
        let row = sqlx::query_as::<_, ShipmentRow>(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Shipment::try_from).transpose()
    }
}

#[async_trait::async_trait]
impl CheckoutStore for PgCheckoutStore {
    async fn find_order(&self, id: &str) -> Result<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>("SELECT id, status, timeline, version FROM orders WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Order::try_from).transpose()
    }

    async fn update_order(&self, id: &str, expected_version: i64, status: OrderStatus, entry: TimelineEntry) -> Result<bool> {
        let res = sqlx::query(
            r#"UPDATE orders
               SET status = $3, timeline = timeline || $4, version = version + 1, updated_at = now()
               WHERE id = $1 AND version = $2"#,
        )
        .bind(id)
        .bind(expected_version)
        .bind(status.as_str())
        .bind(Json(vec![entry]))
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn upsert_payment(&self, payment: &PaymentRecord) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO payments (id, order_id, transaction_id, provider, amount, status, raw)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               ON CONFLICT (id) DO UPDATE
               SET amount = EXCLUDED.amount, status = EXCLUDED.status, raw = EXCLUDED.raw, updated_at = now()"#,
        )
        .bind(&payment.id)
        .bind(&payment.order_id)
        .bind(&payment.transaction_id)
        .bind(&payment.provider)
        .bind(payment.amount)
        .bind(&payment.status)
        .bind(Json(&payment.raw))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn payments_for_order(&self, order_id: &str) -> Result<Vec<PaymentRecord>> {
        let rows = sqlx::query_as::<_, PaymentRow>(
            "SELECT id, order_id, transaction_id, provider, amount, status, raw FROM payments WHERE order_id = $1 ORDER BY id",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(PaymentRecord::from).collect())
    }

    async fn find_shipment(&self, merchant_trade_no: Option<&str>, logistics_id: Option<&str>) -> Result<Option<Shipment>> {
        if let Some(trade_no) = merchant_trade_no.filter(|v| !v.is_empty()) {
            if let Some(found) = self.shipment_where("merchant_trade_no", trade_no).await? {
                return Ok(Some(found));
            }
        }
        match logistics_id.filter(|v| !v.is_empty()) {
            Some(id) => self.shipment_where("logistics_id", id).await,
            None => Ok(None),
        }
    }

    async fn update_shipment(
        &self,
        id: &str,
        expected_version: i64,
        status: ShipmentStatus,
        update: StatusUpdate,
        delivered_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"UPDATE shipments
               SET shipment_status = $3,
                   status_updates = status_updates || $4,
                   delivered_at = COALESCE($5, delivered_at),
                   version = version + 1,
                   updated_at = now()
               WHERE id = $1 AND version = $2"#,
        )
        .bind(id)
        .bind(expected_version)
        .bind(status.as_str())
        .bind(Json(vec![update]))
        .bind(delivered_at)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn attach_logistics_refs(&self, shipment_id: &str, logistics_id: &str, tracking_number: Option<&str>) -> Result<bool> {
        let res = sqlx::query(
            r#"UPDATE shipments
               SET logistics_id = $2,
                   tracking_number = COALESCE(NULLIF($3, ''), tracking_number),
                   version = version + 1,
                   updated_at = now()
               WHERE id = $1"#,
        )
        .bind(shipment_id)
        .bind(logistics_id)
        .bind(tracking_number)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }
}

/// Credentials stored as `(scope, key, value)` rows, read at every call.
#[derive(Clone)]
pub struct PgCredentialSource {
    pool: PgPool,
}

impl PgCredentialSource {
    pub fn new(pool: PgPool) -> Self { Self { pool } }

    async fn scope(&self, scope: &str) -> Result<HashMap<String, String>> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM gateway_settings WHERE scope = $1")
            .bind(scope)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("failed to load {scope} gateway settings"))?;
        Ok(rows.into_iter().collect())
    }
}

fn credentials_from(values: &HashMap<String, String>) -> MerchantCredentials {
    let get = |k: &str| values.get(k).cloned().unwrap_or_default();
    MerchantCredentials {
        merchant_id: get("merchant_id"),
        hash_key: get("hash_key"),
        hash_iv: get("hash_iv"),
        test_mode: parse_flag(&get("test_mode")).unwrap_or(true),
    }
}

#[async_trait::async_trait]
impl CredentialSource for PgCredentialSource {
    async fn payment_settings(&self) -> Result<PaymentSettings> {
        let values = self.scope("payment").await?;
        Ok(PaymentSettings {
            provider: values.get("provider").cloned().unwrap_or_else(|| "manual".to_string()),
            credentials: credentials_from(&values),
        })
    }

    async fn logistics_credentials(&self) -> Result<MerchantCredentials> {
        let values = self.scope("logistics").await?;
        Ok(credentials_from(&values))
    }
}

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::MerchantCredentials;
use crate::ecpay::{self, FormFields};
use crate::gateway::Fields;
use crate::repo::ShipmentStatus;

const MAP_PATH: &str = "/Express/map";
const CREATE_PATH: &str = "/Express/Create";
const QUERY_PATH: &str = "/Helper/QueryLogisticsTradeInfo/V4";
const MAX_PERSON_NAME_LEN: usize = 10;
const MAX_GOODS_NAME_LEN: usize = 50;
/// `1` is plain success; `300` is "order created", which is how the gateway
/// acknowledges an accepted shipment.
const CREATE_SUCCESS_CODES: [&str; 2] = ["1", "300"];
const MAP_FORM_ID: &str = "ecpay-store-map";

#[derive(Debug, thiserror::Error)]
pub enum LogisticsError {
    #[error("gateway request failed: {0}")]
    Transport(String),
    #[error("gateway returned {code}: {message}")]
    Gateway { code: String, message: String },
    #[error("unreadable gateway response: {0}")]
    InvalidResponse(String),
    #[error("invalid shipment request: {0}")]
    InvalidRequest(String),
}

impl LogisticsError {
    pub fn code(&self) -> &'static str {
        match self {
            LogisticsError::Transport(_) => "gateway_unavailable",
            LogisticsError::Gateway { .. } => "gateway_rejected",
            LogisticsError::InvalidResponse(_) => "gateway_invalid_response",
            LogisticsError::InvalidRequest(_) => "invalid_shipment_request",
        }
    }
}

/// Convenience-store brands offered for C2C pickup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CvsSubType {
    #[serde(rename = "UNIMARTC2C")]
    UnimartC2C,
    #[serde(rename = "FAMIC2C")]
    FamiC2C,
}

impl CvsSubType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CvsSubType::UnimartC2C => "UNIMARTC2C",
            CvsSubType::FamiC2C => "FAMIC2C",
        }
    }

    pub fn parse(raw: &str) -> Option<CvsSubType> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "UNIMARTC2C" | "UNIMART" | "711" => Some(CvsSubType::UnimartC2C),
            "FAMIC2C" | "FAMI" | "FAMILYMART" => Some(CvsSubType::FamiC2C),
            _ => None,
        }
    }
}

/// Gateway status code to shipment status. Unknown codes read as in transit.
pub fn shipment_status_for_code(code: &str) -> ShipmentStatus {
    match code.trim() {
        "300" => ShipmentStatus::Pending,
        "310" => ShipmentStatus::InTransit,
        "3024" => ShipmentStatus::OutForDelivery,
        "3018" => ShipmentStatus::Returned,
        "304" | "3006" => ShipmentStatus::Failed,
        "3042" => ShipmentStatus::Delivered,
        _ => ShipmentStatus::InTransit,
    }
}

pub fn status_message(code: &str) -> Option<&'static str> {
    match code.trim() {
        "300" => Some("Shipment order created"),
        "310" => Some("Store accepted the shipment"),
        "3024" => Some("Arrived at pickup store, awaiting pickup"),
        "3018" => Some("Return in progress"),
        "304" => Some("Overdue at store, returning to sender"),
        "3006" => Some("Shipment order cancelled"),
        "3042" => Some("Picked up by recipient"),
        _ => None,
    }
}

pub fn describe_code(code: &str) -> String {
    status_message(code)
        .map(str::to_string)
        .unwrap_or_else(|| format!("unknown logistics status {}", code.trim()))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateShipmentParams {
    pub merchant_trade_no: String,
    pub sub_type: CvsSubType,
    pub goods_amount: i64,
    pub goods_name: String,
    pub sender_name: String,
    pub sender_cell_phone: String,
    pub receiver_name: String,
    pub receiver_cell_phone: String,
    #[serde(default)]
    pub receiver_email: String,
    pub receiver_store_id: String,
    #[serde(default)]
    pub server_reply_url: String,
    /// Cash on pickup for the goods amount.
    #[serde(default)]
    pub is_collection: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipmentCreated {
    pub logistics_id: String,
    pub shipment_no: String,
    pub validation_no: String,
    pub rtn_code: String,
    pub rtn_msg: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipmentStatusReport {
    pub code: i64,
    pub message: String,
    pub status: ShipmentStatus,
    pub amount: i64,
    pub sub_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shipment_no: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade_date: Option<String>,
}

pub struct EcpayLogistics {
    credentials: MerchantCredentials,
    base_url: String,
    http: Client,
    timeout: Duration,
}

impl EcpayLogistics {
    pub fn new(credentials: MerchantCredentials, http: Client, timeout: Duration) -> Self {
        let base_url = ecpay::logistics_host(credentials.test_mode).to_string();
        Self { credentials, base_url, http, timeout }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Auto-submitting form that opens the gateway's store picker. The
    /// picker is an unsigned request.
    pub fn store_selection_redirect(&self, server_reply_url: &str, sub_type: CvsSubType, merchant_trade_no: &str) -> String {
        let fields = ecpay::non_empty_fields([
            ("MerchantID", self.credentials.merchant_id.clone()),
            ("MerchantTradeNo", ecpay::sanitize_trade_no(merchant_trade_no)),
            ("LogisticsType", "CVS".to_string()),
            ("LogisticsSubType", sub_type.as_str().to_string()),
            ("IsCollection", "N".to_string()),
            ("ServerReplyURL", server_reply_url.to_string()),
        ]);
        ecpay::auto_submit_form(MAP_FORM_ID, &self.url(MAP_PATH), &fields)
    }

    /// Signed create-shipment fields.
    pub fn create_fields(&self, params: &CreateShipmentParams, now: DateTime<Utc>) -> Result<FormFields, LogisticsError> {
        let trade_no = ecpay::sanitize_trade_no(&params.merchant_trade_no);
        if trade_no.is_empty() {
            return Err(LogisticsError::InvalidRequest("merchant trade number is empty".into()));
        }
        if params.goods_amount <= 0 {
            return Err(LogisticsError::InvalidRequest("goods amount must be positive".into()));
        }
        if params.receiver_store_id.trim().is_empty() {
            return Err(LogisticsError::InvalidRequest("receiver store id is required".into()));
        }
        for (label, value) in [
            ("sender name", &params.sender_name),
            ("receiver name", &params.receiver_name),
            ("receiver phone", &params.receiver_cell_phone),
        ] {
            if value.trim().is_empty() {
                return Err(LogisticsError::InvalidRequest(format!("{label} is required")));
            }
        }

        let amount = params.goods_amount.to_string();
        let mut fields = ecpay::non_empty_fields([
            ("MerchantID", self.credentials.merchant_id.clone()),
            ("MerchantTradeNo", trade_no),
            ("MerchantTradeDate", ecpay::trade_timestamp(now)),
            ("LogisticsType", "CVS".to_string()),
            ("LogisticsSubType", params.sub_type.as_str().to_string()),
            ("GoodsAmount", amount.clone()),
            ("GoodsName", ecpay::truncate_chars(&params.goods_name, MAX_GOODS_NAME_LEN)),
            ("SenderName", ecpay::truncate_chars(&params.sender_name, MAX_PERSON_NAME_LEN)),
            ("SenderCellPhone", params.sender_cell_phone.trim().to_string()),
            ("ReceiverName", ecpay::truncate_chars(&params.receiver_name, MAX_PERSON_NAME_LEN)),
            ("ReceiverCellPhone", params.receiver_cell_phone.trim().to_string()),
            ("ReceiverEmail", params.receiver_email.trim().to_string()),
            ("ReceiverStoreID", params.receiver_store_id.trim().to_string()),
            ("ServerReplyURL", params.server_reply_url.clone()),
            ("IsCollection", if params.is_collection { "Y" } else { "N" }.to_string()),
            ("CollectionAmount", if params.is_collection { amount } else { String::new() }),
        ]);
        ecpay::append_check_mac(&mut fields, &self.credentials.hash_key, &self.credentials.hash_iv);
        Ok(fields)
    }

    pub async fn create_shipment(&self, params: &CreateShipmentParams) -> Result<ShipmentCreated, LogisticsError> {
        let fields = self.create_fields(params, Utc::now())?;
        let body = self.post_form(CREATE_PATH, &fields).await?;
        let (prefix, rest) = ecpay::split_status_prefix(&body);
        let response = ecpay::parse_form(rest);

        let Some(rtn_code) = response.get("RtnCode").cloned() else {
            if prefix == Some("0") {
                return Err(LogisticsError::Gateway { code: "0".into(), message: rest.to_string() });
            }
            return Err(LogisticsError::InvalidResponse(format!("missing RtnCode in {}", truncate_for_log(&body))));
        };
        self.check_response_mac(&response)?;

        let rtn_msg = response.get("RtnMsg").cloned().unwrap_or_default();
        if !CREATE_SUCCESS_CODES.contains(&rtn_code.trim()) {
            warn!(trade_no = %params.merchant_trade_no, rtn_code = %rtn_code, rtn_msg = %rtn_msg, "Shipment creation rejected");
            return Err(LogisticsError::Gateway { code: rtn_code, message: rtn_msg });
        }

        let get = |k: &str| response.get(k).cloned().unwrap_or_default();
        let created = ShipmentCreated {
            logistics_id: get("AllPayLogisticsID"),
            shipment_no: get("CVSPaymentNo"),
            validation_no: get("CVSValidationNo"),
            rtn_code,
            rtn_msg,
        };
        if created.logistics_id.is_empty() {
            return Err(LogisticsError::InvalidResponse("accepted shipment carries no AllPayLogisticsID".into()));
        }
        debug!(trade_no = %params.merchant_trade_no, logistics_id = %created.logistics_id, "Shipment created");
        Ok(created)
    }

    pub async fn query_status(&self, merchant_trade_no: &str) -> Result<ShipmentStatusReport, LogisticsError> {
        let trade_no = ecpay::sanitize_trade_no(merchant_trade_no);
        if trade_no.is_empty() {
            return Err(LogisticsError::InvalidRequest("merchant trade number is empty".into()));
        }
        let mut fields = ecpay::non_empty_fields([
            ("MerchantID", self.credentials.merchant_id.clone()),
            ("MerchantTradeNo", trade_no),
            ("TimeStamp", Utc::now().timestamp().to_string()),
        ]);
        ecpay::append_check_mac(&mut fields, &self.credentials.hash_key, &self.credentials.hash_iv);

        let body = self.post_form(QUERY_PATH, &fields).await?;
        let (prefix, rest) = ecpay::split_status_prefix(&body);
        let response = ecpay::parse_form(rest);
        self.check_response_mac(&response)?;

        let raw_code = response
            .get("LogisticsStatus")
            .filter(|v| !v.trim().is_empty())
            .or_else(|| response.get("RtnCode"))
            .cloned();
        let Some(raw_code) = raw_code else {
            if prefix == Some("0") {
                return Err(LogisticsError::Gateway { code: "0".into(), message: rest.to_string() });
            }
            return Err(LogisticsError::InvalidResponse(format!("missing status code in {}", truncate_for_log(&body))));
        };
        let code = raw_code
            .trim()
            .parse::<i64>()
            .map_err(|_| LogisticsError::InvalidResponse(format!("non-numeric status code {raw_code}")))?;

        let sub_type = response
            .get("LogisticsType")
            .and_then(|v| v.split_once('_').map(|(_, sub)| sub.to_string()))
            .or_else(|| response.get("LogisticsSubType").cloned())
            .unwrap_or_default();
        let non_empty = |k: &str| response.get(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        Ok(ShipmentStatusReport {
            code,
            message: describe_code(&raw_code),
            status: shipment_status_for_code(&raw_code),
            amount: response.get("GoodsAmount").and_then(|v| v.trim().parse().ok()).unwrap_or(0),
            sub_type,
            shipment_no: non_empty("ShipmentNo").or_else(|| non_empty("CVSPaymentNo")),
            trade_date: non_empty("TradeDate"),
        })
    }

    pub fn verify_webhook(&self, payload: &Fields) -> bool {
        common_crypto::verify(payload, &self.credentials.hash_key, &self.credentials.hash_iv)
    }

    /// Responses that carry a digest must carry a valid one.
    fn check_response_mac(&self, response: &Fields) -> Result<(), LogisticsError> {
        if response.contains_key(common_crypto::CHECK_MAC_FIELD) && !self.verify_webhook(response) {
            return Err(LogisticsError::InvalidResponse("response CheckMacValue mismatch".into()));
        }
        Ok(())
    }

    async fn post_form(&self, path: &str, fields: &FormFields) -> Result<String, LogisticsError> {
        let url = self.url(path);
        let resp = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .form(fields)
            .send()
            .await
            .map_err(|err| {
                warn!(error = %err, url = %url, "Logistics gateway request failed");
                LogisticsError::Transport(err.to_string())
            })?;
        let status = resp.status();
        if !status.is_success() {
            warn!(status = %status, url = %url, "Logistics gateway returned HTTP error");
            return Err(LogisticsError::Transport(format!("gateway returned HTTP {status}")));
        }
        resp.text()
            .await
            .map_err(|err| LogisticsError::Transport(err.to_string()))
    }
}

fn truncate_for_log(body: &str) -> String {
    body.chars().take(120).collect()
}

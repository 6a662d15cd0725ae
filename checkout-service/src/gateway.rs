use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type Fields = BTreeMap<String, String>;

fn default_currency() -> String {
    "TWD".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOrderParams {
    pub order_id: String,
    /// Whole currency units; the gateway accepts no decimals.
    pub amount: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub customer_email: String,
    pub return_url: String,
    pub notify_url: String,
    #[serde(default)]
    pub is_deposit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(into = "PaymentResultBody")]
pub enum PaymentResult {
    Failed { error: String },
    Form { form_html: String },
    Redirect { redirect_url: String },
}

impl PaymentResult {
    pub fn failed(error: impl Into<String>) -> Self {
        PaymentResult::Failed { error: error.into() }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, PaymentResult::Failed { .. })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PaymentResultBody {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    form_html: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    redirect_url: Option<String>,
}

impl From<PaymentResult> for PaymentResultBody {
    fn from(result: PaymentResult) -> Self {
        let mut body = PaymentResultBody { success: result.is_success(), error: None, form_html: None, redirect_url: None };
        match result {
            PaymentResult::Failed { error } => body.error = Some(error),
            PaymentResult::Form { form_html } => body.form_html = Some(form_html),
            PaymentResult::Redirect { redirect_url } => body.redirect_url = Some(redirect_url),
        }
        body
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Paid,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

/// Outcome of checking an inbound payment callback. `is_valid` reflects only
/// the signature; the business fields are parsed regardless.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookVerifyResult {
    pub is_valid: bool,
    pub order_id: String,
    pub transaction_id: String,
    pub amount: i64,
    pub status: PaymentStatus,
    pub rtn_code: String,
    pub rtn_msg: String,
    pub is_deposit: bool,
    pub simulated: bool,
    pub raw_data: Fields,
}

#[async_trait::async_trait]
pub trait PaymentGateway: Send + Sync {
    fn provider(&self) -> &'static str;
    async fn create_payment(&self, params: &PaymentOrderParams) -> PaymentResult;
    /// `payload` is the decoded form; `raw_body` is consulted only when the
    /// payload is empty.
    fn verify_webhook(&self, payload: &Fields, raw_body: &str) -> WebhookVerifyResult;
}

/// Providers the factory recognises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Ecpay,
    NewebPay,
    LinePay,
}

impl ProviderKind {
    /// `manual` and unknown identifiers yield `None`.
    pub fn parse(raw: &str) -> Option<ProviderKind> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ecpay" => Some(ProviderKind::Ecpay),
            "newebpay" => Some(ProviderKind::NewebPay),
            "linepay" => Some(ProviderKind::LinePay),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Ecpay => "ecpay",
            ProviderKind::NewebPay => "newebpay",
            ProviderKind::LinePay => "linepay",
        }
    }
}

/// Placeholder for recognised providers without a protocol implementation.
pub struct StubGateway {
    kind: ProviderKind,
}

impl StubGateway {
    pub fn new(kind: ProviderKind) -> Self { Self { kind } }
}

#[async_trait::async_trait]
impl PaymentGateway for StubGateway {
    fn provider(&self) -> &'static str {
        self.kind.as_str()
    }

    async fn create_payment(&self, _params: &PaymentOrderParams) -> PaymentResult {
        PaymentResult::failed(format!("payment provider {} is not implemented", self.kind.as_str()))
    }

    fn verify_webhook(&self, payload: &Fields, _raw_body: &str) -> WebhookVerifyResult {
        WebhookVerifyResult {
            is_valid: false,
            order_id: String::new(),
            transaction_id: String::new(),
            amount: 0,
            status: PaymentStatus::Failed,
            rtn_code: String::new(),
            rtn_msg: String::new(),
            is_deposit: false,
            simulated: false,
            raw_data: payload.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_result_serialises_as_tagged_body() {
        let ok = serde_json::to_value(PaymentResult::Form { form_html: "<form/>".into() }).unwrap();
        assert_eq!(ok, serde_json::json!({"success": true, "formHtml": "<form/>"}));

        let redirect = serde_json::to_value(PaymentResult::Redirect { redirect_url: "https://x".into() }).unwrap();
        assert_eq!(redirect, serde_json::json!({"success": true, "redirectUrl": "https://x"}));

        let failed = serde_json::to_value(PaymentResult::failed("boom")).unwrap();
        assert_eq!(failed, serde_json::json!({"success": false, "error": "boom"}));
    }

    #[test]
    fn provider_identifiers_parse() {
        assert_eq!(ProviderKind::parse("ECPay"), Some(ProviderKind::Ecpay));
        assert_eq!(ProviderKind::parse("linepay"), Some(ProviderKind::LinePay));
        assert_eq!(ProviderKind::parse("manual"), None);
        assert_eq!(ProviderKind::parse("paypal"), None);
    }

    #[tokio::test]
    async fn stub_gateway_reports_not_implemented() {
        let stub = StubGateway::new(ProviderKind::NewebPay);
        let params = PaymentOrderParams {
            order_id: "o-1".into(),
            amount: 100,
            currency: "TWD".into(),
            description: String::new(),
            customer_email: String::new(),
            return_url: "https://x/r".into(),
            notify_url: "https://x/n".into(),
            is_deposit: false,
        };
        match stub.create_payment(&params).await {
            PaymentResult::Failed { error } => assert!(error.contains("not implemented")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!stub.verify_webhook(&Fields::new(), "").is_valid);
    }
}

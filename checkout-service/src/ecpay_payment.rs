use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::MerchantCredentials;
use crate::ecpay::{self, FormFields};
use crate::gateway::{Fields, PaymentGateway, PaymentOrderParams, PaymentResult, PaymentStatus, WebhookVerifyResult};

const CHECKOUT_PATH: &str = "/Cashier/AioCheckOut/V5";
const MAX_TRADE_DESC_LEN: usize = 200;
const MAX_ITEM_NAME_LEN: usize = 400;
const SUCCESS_RTN_CODE: &str = "1";
const DEPOSIT_FLAG: &str = "deposit";
const FORM_ID: &str = "ecpay-checkout";

/// All-in-one checkout: the buyer is posted to the gateway's hosted page and
/// the result arrives later on `ReturnURL`.
pub struct EcpayPayment {
    credentials: MerchantCredentials,
    base_url: String,
}

impl EcpayPayment {
    pub fn new(credentials: MerchantCredentials) -> Self {
        let base_url = ecpay::payment_host(credentials.test_mode).to_string();
        Self { credentials, base_url }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn checkout_url(&self) -> String {
        format!("{}{}", self.base_url, CHECKOUT_PATH)
    }

    /// Signed checkout fields, `CheckMacValue` last.
    pub fn checkout_fields(&self, params: &PaymentOrderParams, now: DateTime<Utc>) -> Result<FormFields, String> {
        if params.amount <= 0 {
            return Err("amount must be a positive whole number".to_string());
        }
        if !params.currency.trim().is_empty() && !params.currency.trim().eq_ignore_ascii_case("TWD") {
            return Err(format!("currency {} is not supported", params.currency.trim()));
        }
        let trade_no = ecpay::sanitize_trade_no(&params.order_id);
        if trade_no.is_empty() {
            return Err("order id has no alphanumeric characters".to_string());
        }
        if params.notify_url.trim().is_empty() {
            return Err("notify url is required".to_string());
        }

        let description = if params.description.trim().is_empty() {
            format!("Order {}", params.order_id)
        } else {
            params.description.clone()
        };
        let trade_desc = urlencoding::encode(&ecpay::truncate_chars(&description, MAX_TRADE_DESC_LEN)).into_owned();
        let item_name = ecpay::truncate_chars(&description, MAX_ITEM_NAME_LEN);

        let mut fields = ecpay::non_empty_fields([
            ("MerchantID", self.credentials.merchant_id.clone()),
            ("MerchantTradeNo", trade_no),
            ("MerchantTradeDate", ecpay::trade_timestamp(now)),
            ("PaymentType", "aio".to_string()),
            ("TotalAmount", params.amount.to_string()),
            ("TradeDesc", trade_desc),
            ("ItemName", item_name),
            ("ReturnURL", params.notify_url.clone()),
            ("ClientBackURL", params.return_url.clone()),
            ("ChoosePayment", "ALL".to_string()),
            ("EncryptType", "1".to_string()),
            ("CustomField1", params.order_id.clone()),
            ("CustomField2", if params.is_deposit { DEPOSIT_FLAG.to_string() } else { String::new() }),
        ]);
        ecpay::append_check_mac(&mut fields, &self.credentials.hash_key, &self.credentials.hash_iv);
        Ok(fields)
    }
}

#[async_trait::async_trait]
impl PaymentGateway for EcpayPayment {
    fn provider(&self) -> &'static str {
        "ecpay"
    }

    async fn create_payment(&self, params: &PaymentOrderParams) -> PaymentResult {
        match self.checkout_fields(params, Utc::now()) {
            Ok(fields) => {
                debug!(order_id = %params.order_id, amount = params.amount, "Built ECPay checkout form");
                PaymentResult::Form { form_html: ecpay::auto_submit_form(FORM_ID, &self.checkout_url(), &fields) }
            }
            Err(error) => {
                warn!(order_id = %params.order_id, %error, "Rejected payment request");
                PaymentResult::failed(error)
            }
        }
    }

    fn verify_webhook(&self, payload: &Fields, raw_body: &str) -> WebhookVerifyResult {
        let fields = if payload.is_empty() { ecpay::parse_form(raw_body) } else { payload.clone() };
        let is_valid = common_crypto::verify(&fields, &self.credentials.hash_key, &self.credentials.hash_iv);

        let get = |name: &str| fields.get(name).map(|v| v.trim().to_string()).unwrap_or_default();
        let rtn_code = get("RtnCode");
        let order_id = Some(get("CustomField1"))
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| get("MerchantTradeNo"));
        let status = if rtn_code == SUCCESS_RTN_CODE { PaymentStatus::Paid } else { PaymentStatus::Failed };

        WebhookVerifyResult {
            is_valid,
            order_id,
            transaction_id: get("TradeNo"),
            amount: get("TradeAmt").parse::<i64>().unwrap_or(0),
            status,
            rtn_msg: get("RtnMsg"),
            is_deposit: get("CustomField2") == DEPOSIT_FLAG,
            simulated: get("SimulatePaid") == "1",
            rtn_code,
            raw_data: fields,
        }
    }
}

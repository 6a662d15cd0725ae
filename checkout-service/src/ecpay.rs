//! Wire helpers shared by the ECPay payment and logistics adapters.

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};

use crate::gateway::Fields;

pub const PAYMENT_STAGE_HOST: &str = "https://payment-stage.ecpay.com.tw";
pub const PAYMENT_PROD_HOST: &str = "https://payment.ecpay.com.tw";
pub const LOGISTICS_STAGE_HOST: &str = "https://logistics-stage.ecpay.com.tw";
pub const LOGISTICS_PROD_HOST: &str = "https://logistics.ecpay.com.tw";

pub const MAX_TRADE_NO_LEN: usize = 20;
const TRADE_DATE_FORMAT: &str = "%Y/%m/%d %H:%M:%S";
/// Gateway timestamps are Asia/Taipei, which has no DST.
const TAIPEI_OFFSET_HOURS: i64 = 8;

/// Ordered `(name, value)` pairs as submitted to the gateway.
pub type FormFields = Vec<(String, String)>;

pub fn payment_host(test_mode: bool) -> &'static str {
    if test_mode { PAYMENT_STAGE_HOST } else { PAYMENT_PROD_HOST }
}

pub fn logistics_host(test_mode: bool) -> &'static str {
    if test_mode { LOGISTICS_STAGE_HOST } else { LOGISTICS_PROD_HOST }
}

/// Keep ASCII alphanumerics only, capped at the trade number length.
pub fn sanitize_trade_no(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(MAX_TRADE_NO_LEN)
        .collect()
}

/// Truncate by characters, not bytes; gateway limits count CJK glyphs as one.
pub fn truncate_chars(raw: &str, max: usize) -> String {
    raw.trim().chars().take(max).collect()
}

pub fn trade_timestamp(now: DateTime<Utc>) -> String {
    (now.naive_utc() + Duration::hours(TAIPEI_OFFSET_HOURS))
        .format(TRADE_DATE_FORMAT)
        .to_string()
}

/// Parse a gateway `YYYY/MM/DD HH:MM:SS` timestamp back into UTC.
pub fn parse_trade_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let local = NaiveDateTime::parse_from_str(raw.trim(), TRADE_DATE_FORMAT).ok()?;
    Some(Utc.from_utc_datetime(&(local - Duration::hours(TAIPEI_OFFSET_HOURS))))
}

/// Build the submitted field list, dropping empty values which must be
/// neither signed nor sent.
pub fn non_empty_fields<I, K>(pairs: I) -> FormFields
where
    I: IntoIterator<Item = (K, String)>,
    K: Into<String>,
{
    pairs
        .into_iter()
        .filter(|(_, v)| !v.trim().is_empty())
        .map(|(k, v)| (k.into(), v))
        .collect()
}

/// Append `CheckMacValue` computed over `fields`.
pub fn append_check_mac(fields: &mut FormFields, hash_key: &str, hash_iv: &str) {
    let digest = common_crypto::sign(
        fields.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        hash_key,
        hash_iv,
    );
    fields.push((common_crypto::CHECK_MAC_FIELD.to_string(), digest));
}

/// Hidden-input form that posts itself to `action` on load.
pub fn auto_submit_form(form_id: &str, action: &str, fields: &[(String, String)]) -> String {
    let id = htmlescape::encode_minimal(form_id);
    let mut html = format!(
        "<form id=\"{id}\" method=\"post\" action=\"{}\">\n",
        htmlescape::encode_minimal(action)
    );
    for (name, value) in fields {
        html.push_str(&format!(
            "  <input type=\"hidden\" name=\"{}\" value=\"{}\">\n",
            htmlescape::encode_minimal(name),
            htmlescape::encode_minimal(value)
        ));
    }
    html.push_str("</form>\n");
    html.push_str(&format!("<script>document.getElementById(\"{id}\").submit();</script>\n"));
    html
}

/// Gateway responses are `key=value&...`, sometimes prefixed with a
/// `<digit>|` status marker. Returns the marker (if any) and the rest.
pub fn split_status_prefix(body: &str) -> (Option<&str>, &str) {
    let body = body.trim();
    match body.split_once('|') {
        Some((prefix, rest)) if !prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_digit()) => {
            (Some(prefix), rest)
        }
        _ => (None, body),
    }
}

/// Decode a form-encoded body into fields. Malformed input yields an empty map.
pub fn parse_form(body: &str) -> Fields {
    serde_urlencoded::from_str::<Vec<(String, String)>>(body.trim())
        .map(|pairs| pairs.into_iter().collect())
        .unwrap_or_default()
}

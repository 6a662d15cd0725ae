use anyhow::{Context, Result};
use std::{env, fmt, time::Duration};

const DEFAULT_TIMEOUT_SECS: u64 = 15;
const MIN_TIMEOUT_SECS: u64 = 10;
const MAX_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub database_url: Option<String>,
    /// Read merchant credentials from the environment even when a database
    /// is configured.
    pub settings_from_env: bool,
    pub gateway_timeout: Duration,
    pub public_base_url: String,
    pub store_selection_client_url: String,
    /// Client page the buyer returns to after checkout; the order id is
    /// appended as `orderId`. Unset means no return link is sent.
    pub payment_return_url: Option<String>,
    pub allowed_origins: Vec<String>,
    /// Replaces the staging/production payment host when set.
    pub payment_base_url: Option<String>,
    /// Replaces the staging/production logistics host when set.
    pub logistics_base_url: Option<String>,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port: u16 = env::var("PORT")
            .unwrap_or_else(|_| "8090".to_string())
            .parse()
            .context("PORT must be a valid port number")?;
        let database_url = env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty());
        let settings_from_env = env::var("GATEWAY_SETTINGS_SOURCE")
            .map(|v| v.trim().eq_ignore_ascii_case("env"))
            .unwrap_or(false);
        let timeout_secs = env::var("GATEWAY_TIMEOUT_SECONDS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        let public_base_url = env::var("PUBLIC_BASE_URL")
            .unwrap_or_else(|_| format!("http://localhost:{port}"));
        let store_selection_client_url = env::var("STORE_SELECTION_CLIENT_URL")
            .unwrap_or_else(|_| "/logistics/store-selected".to_string());
        let payment_return_url = env::var("PAYMENT_RETURN_URL").ok().filter(|v| !v.trim().is_empty());
        let allowed_origins = env::var("CORS_ALLOWED_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_else(|_| {
                vec![
                    "http://localhost:3000".to_string(),
                    "http://localhost:5173".to_string(),
                ]
            });

        Ok(Self {
            host,
            port,
            database_url,
            settings_from_env,
            gateway_timeout: clamp_timeout(timeout_secs),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            store_selection_client_url,
            payment_return_url,
            allowed_origins,
            payment_base_url: env::var("ECPAY_PAYMENT_BASE_URL").ok(),
            logistics_base_url: env::var("ECPAY_LOGISTICS_BASE_URL").ok(),
        })
    }

    /// Absolute URL under this service's public base.
    pub fn public_url(&self, path: &str) -> String {
        format!("{}{}", self.public_base_url, path)
    }

    /// Configured checkout return page for `order_id`, if any.
    pub fn payment_return_url_for(&self, order_id: &str) -> Option<String> {
        let base = self.payment_return_url.as_deref()?;
        let separator = if base.contains('?') { '&' } else { '?' };
        Some(format!("{base}{separator}orderId={}", urlencoding::encode(order_id)))
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
            database_url: None,
            settings_from_env: false,
            gateway_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            public_base_url: "http://localhost:8090".to_string(),
            store_selection_client_url: "/logistics/store-selected".to_string(),
            payment_return_url: None,
            allowed_origins: Vec::new(),
            payment_base_url: None,
            logistics_base_url: None,
        }
    }
}

fn clamp_timeout(secs: u64) -> Duration {
    Duration::from_secs(secs.clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS))
}

/// One merchant credential set. Loaded per call, never cached.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct MerchantCredentials {
    pub merchant_id: String,
    pub hash_key: String,
    pub hash_iv: String,
    pub test_mode: bool,
}

impl MerchantCredentials {
    pub fn new(merchant_id: impl Into<String>, hash_key: impl Into<String>, hash_iv: impl Into<String>, test_mode: bool) -> Self {
        Self {
            merchant_id: merchant_id.into(),
            hash_key: hash_key.into(),
            hash_iv: hash_iv.into(),
            test_mode,
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.merchant_id.trim().is_empty()
            && !self.hash_key.trim().is_empty()
            && !self.hash_iv.trim().is_empty()
    }
}

impl fmt::Debug for MerchantCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MerchantCredentials")
            .field("merchant_id", &self.merchant_id)
            .field("hash_key", &"<redacted>")
            .field("hash_iv", &"<redacted>")
            .field("test_mode", &self.test_mode)
            .finish()
    }
}

/// Payment provider selection plus the credentials bound to it.
#[derive(Debug, Clone, Default)]
pub struct PaymentSettings {
    pub provider: String,
    pub credentials: MerchantCredentials,
}

#[async_trait::async_trait]
pub trait CredentialSource: Send + Sync {
    async fn payment_settings(&self) -> Result<PaymentSettings>;
    async fn logistics_credentials(&self) -> Result<MerchantCredentials>;
}

/// Reads the process environment at every call so rotated values apply
/// without a restart.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentialSource;

impl EnvCredentialSource {
    fn read(prefix: &str) -> MerchantCredentials {
        let var = |name: &str| env::var(format!("{prefix}_{name}")).unwrap_or_default();
        MerchantCredentials {
            merchant_id: var("MERCHANT_ID"),
            hash_key: var("HASH_KEY"),
            hash_iv: var("HASH_IV"),
            test_mode: parse_flag(&var("TEST_MODE")).unwrap_or(true),
        }
    }
}

#[async_trait::async_trait]
impl CredentialSource for EnvCredentialSource {
    async fn payment_settings(&self) -> Result<PaymentSettings> {
        Ok(PaymentSettings {
            provider: env::var("PAYMENT_PROVIDER").unwrap_or_else(|_| "manual".to_string()),
            credentials: Self::read("ECPAY"),
        })
    }

    async fn logistics_credentials(&self) -> Result<MerchantCredentials> {
        Ok(Self::read("ECPAY_LOGISTICS"))
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticCredentialSource {
    pub payment: PaymentSettings,
    pub logistics: MerchantCredentials,
}

impl StaticCredentialSource {
    pub fn new(payment: PaymentSettings, logistics: MerchantCredentials) -> Self {
        Self { payment, logistics }
    }
}

#[async_trait::async_trait]
impl CredentialSource for StaticCredentialSource {
    async fn payment_settings(&self) -> Result<PaymentSettings> {
        Ok(self.payment.clone())
    }

    async fn logistics_credentials(&self) -> Result<MerchantCredentials> {
        Ok(self.logistics.clone())
    }
}

/// Accepts `1/true/yes/on` and `0/false/no/off`; anything else is `None`.
pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_clamped_into_gateway_budget() {
        assert_eq!(clamp_timeout(3), Duration::from_secs(10));
        assert_eq!(clamp_timeout(12), Duration::from_secs(12));
        assert_eq!(clamp_timeout(120), Duration::from_secs(15));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let creds = MerchantCredentials::new("3002607", "pwFHCqoQZGmho4w6", "EkRm7iFT261dpevs", true);
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("3002607"));
        assert!(!rendered.contains("pwFHCqoQZGmho4w6"));
        assert!(!rendered.contains("EkRm7iFT261dpevs"));
    }

    #[test]
    fn incomplete_credentials_are_detected() {
        assert!(!MerchantCredentials::new("3002607", "", "iv", true).is_complete());
        assert!(!MerchantCredentials::new("  ", "key", "iv", true).is_complete());
        assert!(MerchantCredentials::new("3002607", "key", "iv", false).is_complete());
    }

    #[test]
    fn return_url_carries_order_id() {
        let mut cfg = ServiceConfig::default();
        assert_eq!(cfg.payment_return_url_for("SOM-1"), None);
        cfg.payment_return_url = Some("https://shop.example/checkout/done".into());
        assert_eq!(cfg.payment_return_url_for("SOM 1").as_deref(), Some("https://shop.example/checkout/done?orderId=SOM%201"));
        cfg.payment_return_url = Some("https://shop.example/done?step=3".into());
        assert_eq!(cfg.payment_return_url_for("SOM-1").as_deref(), Some("https://shop.example/done?step=3&orderId=SOM-1"));
    }

    #[test]
    fn flags_parse_loosely() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag(" 0 "), Some(false));
        assert_eq!(parse_flag(""), None);
    }
}

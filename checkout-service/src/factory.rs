use reqwest::Client;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{CredentialSource, ServiceConfig};
use crate::ecpay_payment::EcpayPayment;
use crate::gateway::{PaymentGateway, ProviderKind, StubGateway};
use crate::logistics::EcpayLogistics;

/// Adapter for the configured payment provider, or `None` for manual
/// payment mode (provider `manual`, unknown provider or incomplete
/// credentials). Credentials are read at every call.
pub async fn active_payment_adapter(source: &dyn CredentialSource, config: &ServiceConfig) -> Option<Arc<dyn PaymentGateway>> {
    let settings = match source.payment_settings().await {
        Ok(settings) => settings,
        Err(err) => {
            warn!(error = %err, "Failed to load payment settings; using manual mode");
            return None;
        }
    };
    let Some(kind) = ProviderKind::parse(&settings.provider) else {
        debug!(provider = %settings.provider, "No payment adapter for provider; manual mode");
        return None;
    };
    if !settings.credentials.is_complete() {
        info!(provider = kind.as_str(), "Payment credentials incomplete; manual mode");
        return None;
    }
    let gateway: Arc<dyn PaymentGateway> = match kind {
        ProviderKind::Ecpay => {
            let mut adapter = EcpayPayment::new(settings.credentials);
            if let Some(base) = &config.payment_base_url {
                adapter = adapter.with_base_url(base.clone());
            }
            Arc::new(adapter)
        }
        ProviderKind::NewebPay | ProviderKind::LinePay => Arc::new(StubGateway::new(kind)),
    };
    Some(gateway)
}

/// ECPay payment adapter regardless of the active provider, for verifying
/// callbacks of payments started before a provider switch.
pub async fn ecpay_payment_adapter(source: &dyn CredentialSource, config: &ServiceConfig) -> Option<EcpayPayment> {
    let settings = match source.payment_settings().await {
        Ok(settings) => settings,
        Err(err) => {
            warn!(error = %err, "Failed to load payment settings");
            return None;
        }
    };
    if !settings.credentials.is_complete() {
        return None;
    }
    let adapter = EcpayPayment::new(settings.credentials);
    Some(match &config.payment_base_url {
        Some(base) => adapter.with_base_url(base.clone()),
        None => adapter,
    })
}

pub async fn active_logistics_adapter(source: &dyn CredentialSource, http: &Client, config: &ServiceConfig) -> Option<EcpayLogistics> {
    let credentials = match source.logistics_credentials().await {
        Ok(credentials) => credentials,
        Err(err) => {
            warn!(error = %err, "Failed to load logistics credentials");
            return None;
        }
    };
    if !credentials.is_complete() {
        info!("Logistics credentials incomplete; logistics disabled");
        return None;
    }
    let adapter = EcpayLogistics::new(credentials, http.clone(), config.gateway_timeout);
    Some(match &config.logistics_base_url {
        Some(base) => adapter.with_base_url(base.clone()),
        None => adapter,
    })
}

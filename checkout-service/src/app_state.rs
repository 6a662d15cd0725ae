use anyhow::{Context, Result};
use common_observability::CheckoutMetrics;
use reqwest::Client;
use std::sync::Arc;

use crate::config::{CredentialSource, ServiceConfig};
use crate::repo::CheckoutStore;
use crate::webhook::Transition;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CheckoutStore>,
    pub credentials: Arc<dyn CredentialSource>,
    pub http_client: Client,
    pub metrics: Arc<CheckoutMetrics>,
    pub config: Arc<ServiceConfig>,
}

impl AppState {
    pub fn new(store: Arc<dyn CheckoutStore>, credentials: Arc<dyn CredentialSource>, config: ServiceConfig) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(config.gateway_timeout)
            .build()
            .context("failed to build gateway HTTP client")?;
        Ok(Self {
            store,
            credentials,
            http_client,
            metrics: Arc::new(CheckoutMetrics::new()),
            config: Arc::new(config),
        })
    }

    pub fn record_transition(&self, kind: &str, transition: Transition) {
        self.metrics.record_webhook(kind, transition.as_str());
    }
}

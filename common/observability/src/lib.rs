use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct CheckoutMetrics {
    pub registry: Registry,
    pub webhook_deliveries: IntCounterVec,
    pub gateway_requests: IntCounterVec,
}

impl CheckoutMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let webhook_deliveries = IntCounterVec::new(
            Opts::new(
                "checkout_webhook_deliveries_total",
                "Inbound gateway callbacks grouped by kind and outcome",
            ),
            &["kind", "outcome"],
        ).unwrap();
        let gateway_requests = IntCounterVec::new(
            Opts::new(
                "checkout_gateway_requests_total",
                "Outbound gateway calls grouped by operation and result",
            ),
            &["operation", "result"],
        ).unwrap();
        let _ = registry.register(Box::new(webhook_deliveries.clone()));
        let _ = registry.register(Box::new(gateway_requests.clone()));
        CheckoutMetrics { registry, webhook_deliveries, gateway_requests }
    }

    /// `kind` is `payment` or `logistics`; `outcome` is one of
    /// `applied`, `duplicate`, `unmatched`, `ignored`, `rejected` or `error`.
    pub fn record_webhook(&self, kind: &str, outcome: &str) {
        self.webhook_deliveries.with_label_values(&[kind, outcome]).inc();
    }

    pub fn record_gateway_call(&self, operation: &str, ok: bool) {
        let result = if ok { "ok" } else { "failed" };
        self.gateway_requests.with_label_values(&[operation, result]).inc();
    }

    /// Prometheus text exposition of this registry plus the process default
    /// registry (where `http_errors_total` lives).
    pub fn render_text(&self) -> Result<String, prometheus::Error> {
        let mut families = self.registry.gather();
        families.extend(prometheus::gather());
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl Default for CheckoutMetrics {
    fn default() -> Self { Self::new() }
}

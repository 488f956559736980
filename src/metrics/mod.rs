//! Prometheus counters for the order engine, exposed in text format at
//! `/metrics`.

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref ORDERS_CREATED: IntCounterVec = IntCounterVec::new(
        Opts::new("orders_created_total", "Orders created from confirmed payments"),
        &["source"]
    )
    .expect("metric can be created");
    pub static ref DUPLICATE_PAYMENTS: IntCounter = IntCounter::new(
        "duplicate_payments_skipped_total",
        "Payment confirmations that matched an existing order"
    )
    .expect("metric can be created");
    pub static ref STOCK_SHORTFALLS: IntCounter = IntCounter::new(
        "stock_shortfalls_total",
        "Order lines whose stock could not be decremented"
    )
    .expect("metric can be created");
    pub static ref STOCK_UNSAFE_DECREMENTS: IntCounter = IntCounter::new(
        "stock_unsafe_decrements_total",
        "Decrements applied through the degraded read-modify-write path"
    )
    .expect("metric can be created");
    pub static ref REFUNDS: IntCounterVec = IntCounterVec::new(
        Opts::new("refunds_total", "Refund attempts by outcome"),
        &["outcome"]
    )
    .expect("metric can be created");
    pub static ref RETURNS_EXPIRED: IntCounter = IntCounter::new(
        "returns_expired_total",
        "Return requests expired by the sweep"
    )
    .expect("metric can be created");
    pub static ref EMAIL_FAILURES: IntCounter = IntCounter::new(
        "email_failures_total",
        "Transactional emails that could not be delivered"
    )
    .expect("metric can be created");
}

/// Registers the counters with [`REGISTRY`]. Safe to call more than once.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(ORDERS_CREATED.clone()),
        Box::new(DUPLICATE_PAYMENTS.clone()),
        Box::new(STOCK_SHORTFALLS.clone()),
        Box::new(STOCK_UNSAFE_DECREMENTS.clone()),
        Box::new(REFUNDS.clone()),
        Box::new(RETURNS_EXPIRED.clone()),
        Box::new(EMAIL_FAILURES.clone()),
    ];
    for collector in collectors {
        // AlreadyReg on repeated calls is expected
        let _ = REGISTRY.register(collector);
    }
}

/// Renders every registered metric in the Prometheus text format.
pub fn render() -> String {
    register_metrics();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!(error = %e, "failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub async fn metrics_handler() -> impl axum::response::IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_business_counters() {
        ORDERS_CREATED.with_label_values(&["webhook"]).inc();
        RETURNS_EXPIRED.inc();
        let text = render();
        assert!(text.contains("orders_created_total"));
        assert!(text.contains("returns_expired_total"));
    }
}

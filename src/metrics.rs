use crate::poller::{CycleSummary, DeliveryOutcome};
use anyhow::{Context, Result};
use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all poller metrics
const PREFIX: &str = "reconcile_poller";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Cycle Metrics
    pub static ref CYCLES_TOTAL: IntCounter = IntCounter::new(
        format!("{PREFIX}_cycles_total"),
        "Total number of completed reconciliation cycles"
    ).expect("Failed to create cycles_total metric");

    pub static ref CYCLE_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            format!("{PREFIX}_cycle_duration_seconds"),
            "Reconciliation cycle duration in seconds"
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0])
    ).expect("Failed to create cycle_duration_seconds metric");

    pub static ref CHANGES_DETECTED_TOTAL: IntCounter = IntCounter::new(
        format!("{PREFIX}_changes_detected_total"),
        "Total number of watermark advances detected"
    ).expect("Failed to create changes_detected_total metric");

    pub static ref TRACKED_SUBJECTS: IntGauge = IntGauge::new(
        format!("{PREFIX}_tracked_subjects"),
        "Number of subjects loaded in the last cycle"
    ).expect("Failed to create tracked_subjects metric");

    // Upstream Metrics
    pub static ref FETCH_ATTEMPTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(format!("{PREFIX}_fetch_attempts_total"), "Upstream fetch attempts by result"),
        &["result"]
    ).expect("Failed to create fetch_attempts_total metric");

    // Delivery Metrics
    pub static ref DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(format!("{PREFIX}_deliveries_total"), "Notification deliveries by outcome"),
        &["outcome"]
    ).expect("Failed to create deliveries_total metric");

    // Store Metrics
    pub static ref STORE_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(format!("{PREFIX}_store_errors_total"), "Store failures by operation"),
        &["operation"]
    ).expect("Failed to create store_errors_total metric");

    pub static ref DELIVERY_RECORDS_PRUNED_TOTAL: IntCounter = IntCounter::new(
        format!("{PREFIX}_delivery_records_pruned_total"),
        "Delivery records removed by retention pruning"
    ).expect("Failed to create delivery_records_pruned_total metric");
}

/// Register all metrics with the Prometheus registry
pub fn init_metrics() {
    // Ignore errors if already registered (tests call this repeatedly)
    let _ = REGISTRY.register(Box::new(CYCLES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CYCLE_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(CHANGES_DETECTED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(TRACKED_SUBJECTS.clone()));
    let _ = REGISTRY.register(Box::new(FETCH_ATTEMPTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(DELIVERIES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(STORE_ERRORS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(DELIVERY_RECORDS_PRUNED_TOTAL.clone()));

    tracing::info!("Metrics system initialized successfully");
}

pub fn record_cycle(summary: &CycleSummary, duration: Duration) {
    CYCLES_TOTAL.inc();
    CYCLE_DURATION_SECONDS.observe(duration.as_secs_f64());
    CHANGES_DETECTED_TOTAL.inc_by(summary.changes_detected as u64);
}

pub fn set_tracked_subjects(count: usize) {
    TRACKED_SUBJECTS.set(count as i64);
}

/// `result` is "ok" or a `FetchError::as_str()` value.
pub fn record_fetch_attempt(result: &str) {
    FETCH_ATTEMPTS_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_delivery(outcome: DeliveryOutcome) {
    DELIVERIES_TOTAL.with_label_values(&[outcome.as_str()]).inc();
}

pub fn record_store_error(operation: &str) {
    STORE_ERRORS_TOTAL.with_label_values(&[operation]).inc();
}

pub fn record_pruned(count: usize) {
    DELIVERY_RECORDS_PRUNED_TOTAL.inc_by(count as u64);
}

pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_default();
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

pub fn metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

/// Serve `/metrics` on all interfaces until the task is dropped.
pub async fn run_metrics_server(port: u16) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind metrics port {}", port))?;
    axum::serve(listener, metrics_router()).await?;
    Ok(())
}

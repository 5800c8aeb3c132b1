//! Prometheus metrics exposition
//!
//! - `gateway_requests_total` (counter): labels `route`, `status`
//! - `gateway_request_duration_seconds` (histogram): label `route`
//! - `token_rotations_total` (counter): label `provider`, from `token-pool`
//! - `token_anonymous_fallbacks_total` (counter): label `provider`, from `token-pool`

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Instant;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Upstream calls can run for minutes while a GPU space wakes up, so the
/// buckets reach well past the default request timeout.
const DURATION_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

fn builder() -> Result<PrometheusBuilder> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("gateway_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .context("failed to set histogram buckets")
}

/// Install the global Prometheus recorder and return a handle for `/metrics`.
pub fn install_recorder() -> Result<PrometheusHandle> {
    builder()?
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

/// Record a finished API request.
pub fn record_request(route: &str, status: u16, duration_secs: f64) {
    metrics::counter!(
        "gateway_requests_total",
        "route" => route.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("gateway_request_duration_seconds", "route" => route.to_string())
        .record(duration_secs);
}

/// In-process counters reported by `/health`.
#[derive(Clone)]
pub struct ServiceMetrics {
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

//! Prometheus metrics exposition
//!
//! Request-level metrics recorded by the proxy:
//!
//! - `proxy_requests_total` (counter): label `status`
//! - `proxy_request_duration_seconds` (histogram): label `status`
//! - `proxy_upstream_errors_total` (counter): label `error_type`
//!
//! The key pool records its own `keypool_*` series through the same recorder.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram buckets for request latency, 5ms to 60s.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("proxy_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the global Prometheus recorder and return a handle for rendering.
///
/// `proxy_request_duration_seconds` gets explicit buckets so it renders as a
/// histogram with `_bucket` lines rather than a summary.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a completed request with its response status.
pub fn record_request(status: u16, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("proxy_requests_total", "status" => status_str.clone()).increment(1);
    metrics::histogram!("proxy_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}

/// Record a failed upstream call under a classification label.
pub fn record_upstream_error(error_type: &str) {
    metrics::counter!("proxy_upstream_errors_total", "error_type" => error_type.to_string())
        .increment(1);
}

//! Prometheus metrics exposition
//!
//! Gateway-level metrics recorded here:
//!
//! - `gateway_requests_total` (counter): labels `status`, `method`
//! - `gateway_request_duration_seconds` (histogram): label `status`
//! - `gateway_dispatch_errors_total` (counter): label `error_type`
//!
//! The pool crate records `pool_dispatch_attempts_total` and
//! `pool_account_events_total` through the same recorder.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Instant;

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Bucket boundaries from 5ms up to the longest allowed request budget (600s).
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
    600.0,
];

/// In-process counters surfaced on `/health`.
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

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("gateway_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// The duration histogram gets explicit buckets so it renders `_bucket`
/// lines instead of a summary.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed gateway request.
pub fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("gateway_requests_total", "status" => status_str.clone(), "method" => method.to_string())
        .increment(1);
    metrics::histogram!("gateway_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}

/// Record a dispatch failure by its error kind.
pub fn record_dispatch_error(error_type: &'static str) {
    metrics::counter!("gateway_dispatch_errors_total", "error_type" => error_type).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_request(200, "POST", 0.05);
        record_dispatch_error("no_accounts");
    }

    /// `build_recorder()` instead of `install_recorder()`: only one global
    /// recorder may exist per process.
    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = builder().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn record_request_increments_counter_and_histogram() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request(200, "POST", 0.042);
        record_request(503, "GET", 1.5);

        let output = handle.render();
        assert!(output.contains("gateway_requests_total"));
        assert!(output.contains("status=\"200\""));
        assert!(output.contains("method=\"POST\""));
        assert!(output.contains("status=\"503\""));
        assert!(output.contains("method=\"GET\""));
        assert!(
            output.contains("gateway_request_duration_seconds_bucket"),
            "histogram must render _bucket lines"
        );
    }

    #[test]
    fn dispatch_errors_are_labelled_by_kind() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_dispatch_error("budget_time");
        record_dispatch_error("network_error");

        let output = handle.render();
        assert!(output.contains("gateway_dispatch_errors_total"));
        assert!(output.contains("error_type=\"budget_time\""));
        assert!(output.contains("error_type=\"network_error\""));
    }

    #[test]
    fn histogram_buckets_cover_request_budget() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request(200, "POST", 0.003);

        let output = handle.render();
        assert!(output.contains("le=\"0.005\""), "5ms bucket must exist");
        assert!(output.contains("le=\"600\""), "600s bucket must exist");
        assert!(output.contains("le=\"+Inf\""));
    }
}

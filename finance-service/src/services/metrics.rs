//! Prometheus metrics for finance-service.
//!
//! Everything goes through the `metrics` facade so the HTTP middleware from
//! service-core and the domain counters below end up on the same recorder.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Safe to call more than once; only the
/// first call installs.
pub fn init_metrics() {
    METRICS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    });
}

/// Render all metrics in Prometheus text format.
pub fn get_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized\n".to_string())
}

/// Times one database operation.
pub struct DbTimer {
    operation: &'static str,
    start: Instant,
}

impl DbTimer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    pub fn observe_duration(self) {
        histogram!("db_query_duration_seconds", "operation" => self.operation)
            .record(self.start.elapsed().as_secs_f64());
    }
}

pub fn record_transaction_created(kind: &str) {
    counter!("transactions_created_total", "kind" => kind.to_string()).increment(1);
}

/// Record one call to an ML service. `outcome` is `ok`, `unavailable`
/// (connection failure or timeout) or `error` (non-2xx or undecodable reply).
pub fn record_ml_request(service: &'static str, outcome: &'static str, duration_secs: f64) {
    counter!("ml_requests_total", "service" => service, "outcome" => outcome).increment(1);
    histogram!("ml_request_duration_seconds", "service" => service).record(duration_secs);
}

pub fn record_ml_fallback(service: &'static str) {
    counter!("ml_fallbacks_total", "service" => service).increment(1);
}

/// `event` is one of `hit`, `miss`, `reload`, `reload_failed`, `invalidate`.
pub fn record_config_cache_event(event: &'static str) {
    counter!("config_cache_events_total", "event" => event).increment(1);
}

pub fn record_job_run(job: &'static str, outcome: &'static str, duration_secs: f64) {
    counter!("job_runs_total", "job" => job, "outcome" => outcome).increment(1);
    histogram!("job_duration_seconds", "job" => job).record(duration_secs);
}

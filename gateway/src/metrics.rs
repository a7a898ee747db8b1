use crate::metrics_defs::{ALL_METRICS, ERRORS, REQUESTS_ACTIVE, REQUESTS_SERVICE, RESPONSE_TIME};
use http::StatusCode;
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use shared::metrics_defs::describe_all;
use shared::{counter, gauge, histogram};
use std::time::Duration;

/// Response time buckets in seconds, from 5ms to 30s.
pub const RESPONSE_TIME_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

pub fn prometheus_builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full(RESPONSE_TIME.name.to_string()),
        RESPONSE_TIME_BUCKETS,
    )
}

/// Installs the process-wide Prometheus recorder. Must be called once, before serving.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = prometheus_builder()?.install_recorder()?;
    describe_all(ALL_METRICS);
    Ok(handle)
}

/// Keeps the active request gauge raised while alive.
pub struct ActiveRequest(());

impl ActiveRequest {
    pub fn start() -> Self {
        gauge!(REQUESTS_ACTIVE).increment(1.0);
        ActiveRequest(())
    }
}

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        gauge!(REQUESTS_ACTIVE).decrement(1.0);
    }
}

pub fn error_kind(status: StatusCode) -> Option<&'static str> {
    if status.is_client_error() {
        Some("client")
    } else if status.is_server_error() {
        Some("server")
    } else {
        None
    }
}

/// Records the outcome of one request once its response head is ready.
///
/// `service` is the upstream the request was routed to, if any. `count_error` is false
/// for responses that must not show up in the error counters, such as breaker fallbacks.
pub fn record_completion(
    service: Option<&str>,
    status: StatusCode,
    count_error: bool,
    elapsed: Duration,
) {
    if let Some(service) = service {
        counter!(REQUESTS_SERVICE, "service" => service.to_string()).increment(1);
        histogram!(RESPONSE_TIME, "service" => service.to_string()).record(elapsed.as_secs_f64());
    }

    if count_error && let Some(kind) = error_kind(status) {
        counter!(ERRORS, "type" => kind).increment(1);
    }
}

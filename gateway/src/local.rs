use crate::body::{GatewayBody, full_body};
use crate::errors::GatewayError;
use crate::filters::circuit_breaker::{BreakerTable, CircuitState};
use crate::response::{envelope_response, json_response};
use crate::routes::{Fallback, LocalEndpoint, RouteTable};
use chrono::{DateTime, SecondsFormat, Utc};
use http::header::{CONTENT_TYPE, HeaderValue};
use http::{Method, Response, StatusCode};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthStatus {
    status: &'static str,
    timestamp: String,
    startup_time: String,
    uptime: String,
}

#[derive(Serialize)]
struct OsInfo {
    name: &'static str,
    arch: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthDetails {
    #[serde(flatten)]
    health: HealthStatus,
    processors: usize,
    version: &'static str,
    os: OsInfo,
    circuit_breakers: BTreeMap<String, CircuitState>,
}

/// Endpoints answered by the gateway itself: health, metrics and fallback bodies.
pub struct LocalEndpoints {
    started_wall: DateTime<Utc>,
    started: Instant,
    metrics: PrometheusHandle,
}

impl LocalEndpoints {
    pub fn new(metrics: PrometheusHandle) -> Self {
        LocalEndpoints {
            started_wall: Utc::now(),
            started: Instant::now(),
            metrics,
        }
    }

    pub fn respond(
        &self,
        endpoint: LocalEndpoint,
        method: &Method,
        path: &str,
        routes: &RouteTable,
        breakers: &BreakerTable,
    ) -> Result<Response<GatewayBody>, GatewayError> {
        if *method != Method::GET {
            return Err(GatewayError::MethodNotAllowed(method.clone()));
        }

        match (endpoint, path) {
            (LocalEndpoint::Health, "/health") => Ok(json_response(StatusCode::OK, &self.health())),
            (LocalEndpoint::Health, "/health/details") => Ok(json_response(
                StatusCode::OK,
                &HealthDetails {
                    health: self.health(),
                    processors: std::thread::available_parallelism().map_or(1, |n| n.get()),
                    version: env!("CARGO_PKG_VERSION"),
                    os: OsInfo {
                        name: std::env::consts::OS,
                        arch: std::env::consts::ARCH,
                    },
                    circuit_breakers: breakers.states(),
                },
            )),
            (LocalEndpoint::Metrics, "/metrics") => Ok(self.render_metrics()),
            (LocalEndpoint::Fallback, "/fallback") => Ok(fallback_response(&Fallback::generic(), path)),
            (LocalEndpoint::Fallback, _) => path
                .strip_prefix("/fallback/")
                .and_then(|key| routes.fallback_for(key))
                .map(|fallback| fallback_response(fallback, path))
                .ok_or_else(|| GatewayError::NoRoute(path.to_string())),
            _ => Err(GatewayError::NoRoute(path.to_string())),
        }
    }

    fn health(&self) -> HealthStatus {
        HealthStatus {
            status: "UP",
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            startup_time: self
                .started_wall
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            uptime: format_uptime(self.started.elapsed()),
        }
    }

    fn render_metrics(&self) -> Response<GatewayBody> {
        let mut response = Response::new(full_body(self.metrics.render()));
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE),
        );
        response
    }
}

fn fallback_response(fallback: &Fallback, path: &str) -> Response<GatewayBody> {
    envelope_response(
        StatusCode::SERVICE_UNAVAILABLE,
        &fallback.error,
        &fallback.message,
        path,
    )
}

pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    format!(
        "{} days, {} hours, {} minutes, {} seconds",
        secs / 86_400,
        (secs % 86_400) / 3_600,
        (secs % 3_600) / 60,
        secs % 60
    )
}

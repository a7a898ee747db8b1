use crate::body::{GatewayBody, GuardedBody};
use crate::config::UpstreamTimeouts;
use crate::errors::{BodyError, GatewayError};
use crate::upstreams::Endpoint;
use http::header::HOST;
use http::{Request, Response, Version};
use http_body_util::BodyExt;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use shared::http::{add_via_header, filter_hop_by_hop};
use std::error::Error as _;
use std::time::{Duration, Instant};
use tokio::time::timeout;

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Streams requests to upstream endpoints over pooled HTTP/1.1 connections.
pub struct ProxyTransport {
    client: Client<HttpConnector, GatewayBody>,
    timeouts: UpstreamTimeouts,
}

impl ProxyTransport {
    pub fn new(timeouts: UpstreamTimeouts) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(timeouts.connect()));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .timer(TokioTimer::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build(connector);

        ProxyTransport { client, timeouts }
    }

    /// Sends `request` to `endpoint`. The request URI must be origin-form (path and query).
    ///
    /// Resolves once the upstream response head arrives; the body keeps streaming under
    /// the idle timeout and the request `deadline`.
    pub async fn forward(
        &self,
        service: &str,
        endpoint: &Endpoint,
        request: Request<GatewayBody>,
        deadline: Instant,
    ) -> Result<Response<GatewayBody>, GatewayError> {
        let (mut parts, body) = request.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        parts.uri = endpoint
            .uri(path_and_query)
            .map_err(|e| GatewayError::Internal(format!("could not build upstream uri: {e}")))?;

        let request_version = parts.version;
        filter_hop_by_hop(&mut parts.headers, request_version);
        add_via_header(&mut parts.headers, request_version);
        // Derived from the endpoint by the client
        parts.headers.remove(HOST);
        parts.version = Version::HTTP_11;

        let remaining = deadline.saturating_duration_since(Instant::now());
        let wait = self.timeouts.header_read().min(remaining);

        let response = timeout(wait, self.client.request(Request::from_parts(parts, body)))
            .await
            .map_err(|_| GatewayError::UpstreamTimeout {
                service: service.to_string(),
            })?
            .map_err(|e| classify(service, endpoint, e))?;

        let (mut parts, body) = response.into_parts();
        let response_version = parts.version;
        filter_hop_by_hop(&mut parts.headers, response_version);
        add_via_header(&mut parts.headers, response_version);

        let body = GuardedBody::new(body, self.timeouts.idle(), deadline, None).boxed();
        Ok(Response::from_parts(parts, body))
    }
}

/// Maps a client error to the pipeline error, looking through its causes for faults
/// raised by the request body we were streaming.
fn classify(
    service: &str,
    endpoint: &Endpoint,
    err: hyper_util::client::legacy::Error,
) -> GatewayError {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(body_err) = cause.downcast_ref::<BodyError>() {
            return match body_err {
                BodyError::TooLarge(limit) => GatewayError::PayloadTooLarge(*limit),
                BodyError::Stream(_) => GatewayError::Cancelled,
                BodyError::Idle | BodyError::Deadline => GatewayError::UpstreamTimeout {
                    service: service.to_string(),
                },
            };
        }
        source = cause.source();
    }

    if err.is_connect() {
        tracing::debug!(service, endpoint = %endpoint, error = ?err, "Upstream connect failed");
        GatewayError::UpstreamConnect {
            service: service.to_string(),
            reason: err.to_string(),
        }
    } else {
        GatewayError::UpstreamRequest {
            service: service.to_string(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::full_body;
    use crate::testutils::{MockUpstream, unused_endpoint};
    use http::Method;
    use http::header::VIA;

    fn request(path: &str) -> Request<GatewayBody> {
        Request::builder()
            .method(Method::GET)
            .uri(path)
            .header(HOST, "gateway.local")
            .header("connection", "keep-alive")
            .body(full_body(""))
            .unwrap()
    }

    fn in_seconds(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    #[tokio::test]
    async fn test_forwards_path_and_query() {
        let upstream = MockUpstream::start().await;
        let transport = ProxyTransport::new(UpstreamTimeouts::default());
        let endpoint = Endpoint::parse(&upstream.endpoint()).unwrap();

        let response = transport
            .forward(
                "task-service",
                &endpoint,
                request("/api/tasks?page=2"),
                in_seconds(5),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        assert!(
            response
                .headers()
                .get(VIA)
                .unwrap()
                .to_str()
                .unwrap()
                .ends_with("1.1 gateway")
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["path"], "/api/tasks?page=2");
        assert_eq!(json["via"], "1.1 gateway");
        assert_eq!(json["host"], upstream.endpoint());
        assert_eq!(upstream.hits(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_is_classified() {
        let transport = ProxyTransport::new(UpstreamTimeouts::default());
        let endpoint = Endpoint::parse(&unused_endpoint().await).unwrap();

        let err = transport
            .forward("task-service", &endpoint, request("/api/tasks"), in_seconds(5))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamConnect { .. }), "{err:?}");
        assert!(err.is_upstream_failure());
    }

    #[tokio::test]
    async fn test_slow_upstream_times_out() {
        let upstream = MockUpstream::start().await;
        upstream.set_delay(Duration::from_millis(500));
        let transport = ProxyTransport::new(UpstreamTimeouts {
            header_read_ms: 100,
            ..Default::default()
        });
        let endpoint = Endpoint::parse(&upstream.endpoint()).unwrap();

        let err = transport
            .forward("task-service", &endpoint, request("/api/tasks"), in_seconds(5))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamTimeout { .. }));
    }

    #[tokio::test]
    async fn test_deadline_caps_header_wait() {
        let upstream = MockUpstream::start().await;
        upstream.set_delay(Duration::from_millis(500));
        let transport = ProxyTransport::new(UpstreamTimeouts::default());
        let endpoint = Endpoint::parse(&upstream.endpoint()).unwrap();

        let started = Instant::now();
        let err = transport
            .forward(
                "task-service",
                &endpoint,
                request("/api/tasks"),
                Instant::now() + Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamTimeout { .. }));
        assert!(started.elapsed() < Duration::from_millis(450));
    }
}

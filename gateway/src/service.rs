use crate::body::{GatewayBody, GuardedBody};
use crate::config::{Config, RequestLimits, ValidationError};
use crate::context::RequestContext;
use crate::cors::Cors;
use crate::errors::GatewayError;
use crate::filters::Filter;
use crate::filters::auth::{Authenticator, X_USER_EMAIL, X_USER_ID, X_USER_ROLE};
use crate::filters::circuit_breaker::{BreakerPermit, BreakerTable, CircuitBreakerFilter, Outcome};
use crate::filters::rate_limit::RateLimiter;
use crate::local::LocalEndpoints;
use crate::metrics::{ActiveRequest, record_completion};
use crate::proxy::ProxyTransport;
use crate::response::error_response;
use crate::routes::{RouteTable, RouteTableError, Target, default_routes};
use crate::upstreams::{ConnectOutcome, Resolver, StaticResolver};
use bytes::Bytes;
use futures::FutureExt;
use http::header::{CONTENT_LENGTH, HOST, HeaderName, HeaderValue};
use http::request::Parts;
use http::{HeaderMap, Method, Request, Response, Uri};
use hyper::body::{Body, Incoming};
use hyper::service::Service;
use metrics_exporter_prometheus::PrometheusHandle;
use shared::http::{BoxError, append_forwarded_for};
use std::any::Any;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

const MAX_REQUEST_ID_LEN: usize = 128;

#[derive(Error, Debug)]
pub enum GatewayBuildError {
    #[error("invalid route table: {0}")]
    Routes(#[from] RouteTableError),
    #[error("invalid upstreams: {0}")]
    Upstreams(#[from] ValidationError),
}

/// The request pipeline: ingress checks, routing, the filter chain and the proxy.
pub struct Gateway {
    limits: RequestLimits,
    idle_timeout: std::time::Duration,
    routes: RouteTable,
    cors: Cors,
    filters: Vec<Arc<dyn Filter>>,
    breakers: Arc<BreakerTable>,
    resolver: Arc<dyn Resolver>,
    transport: ProxyTransport,
    local: LocalEndpoints,
}

impl Gateway {
    pub fn new(config: &Config, metrics: PrometheusHandle) -> Result<Self, GatewayBuildError> {
        let resolver = StaticResolver::from_config(&config.upstreams, &config.endpoint_health)?;
        let routes = RouteTable::new(default_routes(&config.rate_limit))?;

        for upstream in routes.upstreams() {
            if !config.upstreams.contains_key(upstream) {
                tracing::warn!(
                    service = upstream,
                    "No endpoints configured for upstream, its routes will answer 503"
                );
            }
        }

        Ok(Self::with_parts(config, routes, Arc::new(resolver), metrics))
    }

    pub fn with_parts(
        config: &Config,
        routes: RouteTable,
        resolver: Arc<dyn Resolver>,
        metrics: PrometheusHandle,
    ) -> Self {
        let breakers = Arc::new(BreakerTable::new(
            routes.breakers(),
            &config.circuit_breaker,
        ));

        let filters: Vec<Arc<dyn Filter>> = vec![
            Arc::new(Authenticator::new(&config.jwt_secret)),
            Arc::new(RateLimiter::new(
                config.rate_limit.max_buckets,
                config.rate_limit.shards,
            )),
            Arc::new(CircuitBreakerFilter::new(breakers.clone())),
        ];
        tracing::debug!(
            filters = ?filters.iter().map(|f| f.name()).collect::<Vec<_>>(),
            "Filter chain assembled"
        );

        Gateway {
            limits: config.limits.clone(),
            idle_timeout: config.timeouts.idle(),
            routes,
            cors: Cors::new(&config.cors),
            filters,
            breakers,
            resolver,
            transport: ProxyTransport::new(config.timeouts.clone()),
            local: LocalEndpoints::new(metrics),
        }
    }

    pub fn breakers(&self) -> &BreakerTable {
        &self.breakers
    }

    /// Runs one request through the pipeline. Never fails: every error, including a
    /// panic inside the pipeline, becomes an envelope response.
    pub async fn handle<B>(&self, request: Request<B>, remote_addr: SocketAddr) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let _active = ActiveRequest::start();
        let started_at = Instant::now();
        let deadline = started_at + self.limits.request_timeout();

        let (mut parts, body) = request.into_parts();
        let request_id = request_id(&parts.headers);
        let origin = self.cors.allowed_origin(&parts.headers);
        let headers = std::mem::take(&mut parts.headers);
        let mut ctx = RequestContext::new(
            request_id,
            parts.method.clone(),
            parts.uri.path(),
            remote_addr,
            headers,
            started_at,
            deadline,
        );

        let result = AssertUnwindSafe(self.dispatch(parts, body, &mut ctx))
            .catch_unwind()
            .await;

        let (mut response, count_error) = match result {
            Ok(Ok(response)) => (response, true),
            Ok(Err(err)) => {
                log_rejection(&ctx, &err);
                (error_response(&err, &ctx.path), err.counts_as_error())
            }
            Err(panic) => {
                tracing::error!(
                    request_id = %ctx.request_id,
                    path = %ctx.path,
                    panic = panic_message(panic.as_ref()),
                    "Request handler panicked"
                );
                let err = GatewayError::Internal("An unexpected error occurred".into());
                (error_response(&err, &ctx.path), true)
            }
        };

        self.cors.decorate(&mut response, origin);
        if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
            response.headers_mut().insert(X_REQUEST_ID, value);
        }

        record_completion(
            ctx.service(),
            response.status(),
            count_error,
            started_at.elapsed(),
        );
        response
    }

    async fn dispatch<B>(
        &self,
        parts: Parts,
        body: B,
        ctx: &mut RequestContext,
    ) -> Result<Response<GatewayBody>, GatewayError>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        if !is_supported_method(&ctx.method) {
            return Err(GatewayError::MethodNotAllowed(ctx.method.clone()));
        }
        if Cors::is_preflight(&ctx.method, &ctx.headers) {
            return self.cors.preflight(&ctx.headers);
        }
        check_content_length(&ctx.headers, self.limits.max_body_bytes)?;
        if body.size_hint().lower() > self.limits.max_body_bytes {
            return Err(GatewayError::PayloadTooLarge(self.limits.max_body_bytes));
        }

        let route = self.routes.find(&ctx.path)?;
        ctx.route = Some(route.clone());

        match &route.target {
            Target::Local(endpoint) => {
                self.local
                    .respond(*endpoint, &ctx.method, &ctx.path, &self.routes, &self.breakers)
            }
            Target::Upstream(service) => self.forward(service, parts, body, ctx).await,
        }
    }

    async fn forward<B>(
        &self,
        service: &str,
        parts: Parts,
        body: B,
        ctx: &mut RequestContext,
    ) -> Result<Response<GatewayBody>, GatewayError>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        normalize_headers(&mut ctx.headers, &ctx.request_id, ctx.remote_addr);

        for filter in &self.filters {
            filter.apply(ctx)?;
        }
        let permit = ctx.breaker_permit.take();
        let route = ctx.route()?.clone();

        let endpoint = match self.resolver.resolve(service).await {
            Ok(endpoint) => endpoint,
            Err(err) => {
                settle(permit, Outcome::Failure);
                return Err(err);
            }
        };

        let mut path_and_query = route.rewrite_path(&ctx.path);
        if let Some(query) = parts.uri.query() {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }
        let uri: Uri = path_and_query
            .parse()
            .map_err(|_| GatewayError::BadRequest("request path cannot be forwarded".into()))?;

        let body = GuardedBody::new(
            body,
            self.idle_timeout,
            ctx.deadline,
            Some(self.limits.max_body_bytes),
        );
        let mut request = Request::new(http_body_util::BodyExt::boxed(body));
        *request.method_mut() = parts.method;
        *request.uri_mut() = uri;
        *request.version_mut() = parts.version;
        *request.headers_mut() = std::mem::take(&mut ctx.headers);

        let result = self
            .transport
            .forward(service, &endpoint, request, ctx.deadline)
            .await;

        match &result {
            Ok(response) => {
                self.resolver
                    .report(service, &endpoint, ConnectOutcome::Connected);
                if response.status().is_server_error() {
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        service,
                        endpoint = %endpoint,
                        status = response.status().as_u16(),
                        "Upstream answered with a server error"
                    );
                    settle(permit, Outcome::Failure);
                } else {
                    settle(permit, Outcome::Success);
                }
            }
            Err(err) => {
                if matches!(err, GatewayError::UpstreamConnect { .. }) {
                    self.resolver
                        .report(service, &endpoint, ConnectOutcome::Failed);
                }
                if err.is_upstream_failure() {
                    settle(permit, Outcome::Failure);
                }
            }
        }

        result
    }

    #[cfg(test)]
    pub(crate) fn push_filter(&mut self, filter: Arc<dyn Filter>) {
        self.filters.push(filter);
    }
}

fn settle(permit: Option<BreakerPermit>, outcome: Outcome) {
    if let Some(permit) = permit {
        permit.record(outcome);
    }
}

fn is_supported_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::POST | Method::PUT | Method::PATCH | Method::DELETE | Method::OPTIONS
    )
}

fn check_content_length(headers: &HeaderMap, limit: u64) -> Result<(), GatewayError> {
    let Some(value) = headers.get(CONTENT_LENGTH) else {
        return Ok(());
    };
    let length = value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .ok_or_else(|| GatewayError::BadRequest("invalid Content-Length".into()))?;

    if length > limit {
        return Err(GatewayError::PayloadTooLarge(limit));
    }
    Ok(())
}

/// Reuses a sane client-supplied request id, otherwise mints a new one.
fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty() && id.len() <= MAX_REQUEST_ID_LEN)
        .map(String::from)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

// Only the authenticator may set identity headers.
fn normalize_headers(headers: &mut HeaderMap, request_id: &str, remote_addr: SocketAddr) {
    headers.remove(X_USER_ID);
    headers.remove(X_USER_EMAIL);
    headers.remove(X_USER_ROLE);

    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    append_forwarded_for(headers, remote_addr.ip());
    if let Some(host) = headers.get(HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
}

fn log_rejection(ctx: &RequestContext, err: &GatewayError) {
    let status = err.status().as_u16();
    match err {
        GatewayError::NoRoute(_) => {
            tracing::warn!(request_id = %ctx.request_id, path = %ctx.path, status, "No route for request")
        }
        GatewayError::Internal(_) => {
            tracing::error!(request_id = %ctx.request_id, path = %ctx.path, status, error = %err, "Internal error")
        }
        e if e.is_upstream_failure() => tracing::warn!(
            request_id = %ctx.request_id,
            service = ctx.service().unwrap_or_default(),
            path = %ctx.path,
            status,
            error = %err,
            "Upstream call failed"
        ),
        _ => {
            tracing::debug!(request_id = %ctx.request_id, path = %ctx.path, status, error = %err, "Request rejected")
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Per-connection hyper service handing requests to the shared [`Gateway`].
#[derive(Clone)]
pub struct GatewayService {
    gateway: Arc<Gateway>,
    remote_addr: SocketAddr,
}

impl GatewayService {
    pub fn new(gateway: Arc<Gateway>, remote_addr: SocketAddr) -> Self {
        GatewayService {
            gateway,
            remote_addr,
        }
    }
}

impl Service<Request<Incoming>> for GatewayService {
    type Response = Response<GatewayBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, request: Request<Incoming>) -> Self::Future {
        let gateway = self.gateway.clone();
        let remote_addr = self.remote_addr;
        Box::pin(async move { Ok(gateway.handle(request, remote_addr).await) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Role;
    use crate::filters::circuit_breaker::CircuitState;
    use crate::testutils::{
        MockUpstream, body_json, bearer, claims_for, mint_token, test_config, test_gateway,
        unused_endpoint,
    };
    use http::StatusCode;
    use http::header::{
        ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_REQUEST_METHOD, AUTHORIZATION, ORIGIN,
        RETRY_AFTER, VARY,
    };
    use futures::stream;
    use http_body_util::{Full, StreamBody};
    use hyper::body::Frame;
    use std::time::Duration;

    fn remote() -> SocketAddr {
        "10.1.2.3:5555".parse().unwrap()
    }

    fn get(path: &str) -> Request<Full<Bytes>> {
        Request::get(path).body(Full::default()).unwrap()
    }

    fn authed(path: &str, id: i64) -> Request<Full<Bytes>> {
        Request::get(path)
            .header(AUTHORIZATION, bearer(&mint_token(&claims_for(id, Role::Member, 3600))))
            .body(Full::default())
            .unwrap()
    }

    // Scenario A
    #[tokio::test]
    async fn test_public_route_is_proxied_without_identity() {
        let upstream = MockUpstream::start().await;
        upstream.set_status(201);
        let gateway = test_gateway(test_config(&[("auth-service", &upstream)]));

        let response = gateway.handle(get("/api/auth/login?next=/home"), remote()).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(response.headers().get(X_REQUEST_ID).is_some());

        let echo = body_json(response).await;
        assert_eq!(echo["path"], "/api/auth/login?next=/home");
        assert!(echo["x-user-id"].is_null());
        assert_eq!(echo["x-forwarded-for"], "10.1.2.3");
        assert!(echo["x-request-id"].is_string());
        assert_eq!(upstream.hits(), 1);
    }

    // Scenario B
    #[tokio::test]
    async fn test_protected_route_without_token() {
        let upstream = MockUpstream::start().await;
        let gateway = test_gateway(test_config(&[("task-service", &upstream)]));

        let response = gateway.handle(get("/api/tasks"), remote()).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body.as_object().unwrap().len(), 5);
        assert_eq!(body["status"], 401);
        assert_eq!(body["error"], "Unauthorized");
        assert_eq!(body["path"], "/api/tasks");
        assert_eq!(upstream.hits(), 0);
    }

    #[tokio::test]
    async fn test_identity_headers_are_injected_and_spoofing_stripped() {
        let upstream = MockUpstream::start().await;
        let gateway = test_gateway(test_config(&[("task-service", &upstream)]));

        let mut request = authed("/api/tasks/7", 42);
        request
            .headers_mut()
            .insert(X_USER_ROLE, HeaderValue::from_static("ADMIN"));
        request
            .headers_mut()
            .insert(HOST, HeaderValue::from_static("tasks.example.com"));

        let response = gateway.handle(request, remote()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let echo = body_json(response).await;
        assert_eq!(echo["x-user-id"], "42");
        assert_eq!(echo["x-user-email"], "user42@example.com");
        assert_eq!(echo["x-user-role"], "MEMBER");
        assert_eq!(echo["x-forwarded-host"], "tasks.example.com");
        assert!(echo["authorization"].as_str().unwrap().starts_with("Bearer "));
    }

    #[tokio::test]
    async fn test_spoofed_identity_stripped_on_public_route() {
        let upstream = MockUpstream::start().await;
        let gateway = test_gateway(test_config(&[("auth-service", &upstream)]));

        let mut request = get("/api/auth/me");
        request
            .headers_mut()
            .insert(X_USER_ID, HeaderValue::from_static("1"));
        let echo = body_json(gateway.handle(request, remote()).await).await;
        assert!(echo["x-user-id"].is_null());
    }

    #[tokio::test]
    async fn test_request_id_is_propagated() {
        let upstream = MockUpstream::start().await;
        let gateway = test_gateway(test_config(&[("auth-service", &upstream)]));

        let mut request = get("/api/auth/login");
        request
            .headers_mut()
            .insert(X_REQUEST_ID, HeaderValue::from_static("abc-123"));
        let response = gateway.handle(request, remote()).await;
        assert_eq!(response.headers().get(X_REQUEST_ID).unwrap(), "abc-123");
        assert_eq!(body_json(response).await["x-request-id"], "abc-123");
    }

    // Scenario C
    #[tokio::test]
    async fn test_rate_limit_rejects_after_capacity() {
        let upstream = MockUpstream::start().await;
        let gateway = test_gateway(test_config(&[("task-service", &upstream)]));

        for _ in 0..100 {
            let response = gateway.handle(authed("/api/tasks/1", 5), remote()).await;
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = gateway.handle(authed("/api/tasks/1", 5), remote()).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after: u64 = response
            .headers()
            .get(RETRY_AFTER)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry_after >= 1);
        assert_eq!(body_json(response).await["error"], "Too Many Requests");
        assert_eq!(upstream.hits(), 100);

        // Another principal has its own bucket
        let response = gateway.handle(authed("/api/tasks/1", 6), remote()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    async fn trip_project_breaker(gateway: &Gateway, upstream: &MockUpstream) {
        upstream.set_status(500);
        for i in 0..20 {
            if i == 15 {
                upstream.set_status(200);
            }
            let _ = gateway.handle(authed("/api/projects/1", i), remote()).await;
        }
    }

    // Scenario D
    #[tokio::test]
    async fn test_breaker_opens_and_serves_fallback() {
        let upstream = MockUpstream::start().await;
        let gateway = test_gateway(test_config(&[("project-service", &upstream)]));

        trip_project_breaker(&gateway, &upstream).await;
        assert_eq!(upstream.hits(), 20);
        assert_eq!(
            gateway.breakers().get("project-service").unwrap().state(),
            CircuitState::Open
        );

        let response = gateway.handle(authed("/api/projects/1", 99), remote()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Project Service Unavailable");
        assert_eq!(
            body["message"],
            "The project service is currently unavailable. Please try again later."
        );
        assert_eq!(upstream.hits(), 20);
    }

    // Scenario E
    #[tokio::test]
    async fn test_half_open_probe_outcomes() {
        let upstream = MockUpstream::start().await;
        let mut config = test_config(&[("project-service", &upstream)]);
        config.circuit_breaker.open_duration_ms = 100;
        let gateway = test_gateway(config);
        let breaker = gateway.breakers().get("project-service").unwrap().clone();

        trip_project_breaker(&gateway, &upstream).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // Failing probe re-opens
        tokio::time::sleep(Duration::from_millis(150)).await;
        upstream.set_status(500);
        let response = gateway.handle(authed("/api/projects/1", 50), remote()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(upstream.hits(), 21);

        // Healthy probe closes
        tokio::time::sleep(Duration::from_millis(150)).await;
        upstream.set_status(200);
        let response = gateway.handle(authed("/api/projects/1", 51), remote()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    // Scenario F
    #[tokio::test]
    async fn test_preflight_is_answered_locally() {
        let upstream = MockUpstream::start().await;
        let gateway = test_gateway(test_config(&[("task-service", &upstream)]));

        let request = Request::options("/api/tasks/1")
            .header(ORIGIN, "http://localhost:4200")
            .header(ACCESS_CONTROL_REQUEST_METHOD, "GET")
            .body(Full::<Bytes>::default())
            .unwrap();
        let response = gateway.handle(request, remote()).await;

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "http://localhost:4200"
        );
        let vary: Vec<_> = response.headers().get_all(VARY).iter().collect();
        assert_eq!(vary, ["Origin"]);
        assert_eq!(upstream.hits(), 0);
    }

    #[tokio::test]
    async fn test_cors_headers_on_proxied_response() {
        let upstream = MockUpstream::start().await;
        let gateway = test_gateway(test_config(&[("auth-service", &upstream)]));

        let request = Request::get("/api/auth/login")
            .header(ORIGIN, "http://127.0.0.1:3000")
            .body(Full::<Bytes>::default())
            .unwrap();
        let response = gateway.handle(request, remote()).await;
        assert_eq!(
            response.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "http://127.0.0.1:3000"
        );
    }

    #[tokio::test]
    async fn test_health_route_is_rewritten_and_public() {
        let upstream = MockUpstream::start().await;
        let gateway = test_gateway(test_config(&[("task-service", &upstream)]));

        let response = gateway.handle(get("/api/tasks/health"), remote()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["path"], "/actuator/health");
    }

    #[tokio::test]
    async fn test_ingress_rejections() {
        let gateway = test_gateway(test_config(&[]));

        let response = gateway.handle(get("/api/billing"), remote()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"], "Service Not Found");

        let request = Request::builder()
            .method(Method::TRACE)
            .uri("/api/tasks")
            .body(Full::<Bytes>::default())
            .unwrap();
        let response = gateway.handle(request, remote()).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let request = Request::post("/api/auth/register")
            .header(CONTENT_LENGTH, (11 * 1024 * 1024).to_string())
            .body(Full::<Bytes>::default())
            .unwrap();
        let response = gateway.handle(request, remote()).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_sized_body_over_limit_is_not_forwarded() {
        let upstream = MockUpstream::start().await;
        let mut config = test_config(&[("auth-service", &upstream)]);
        config.limits.max_body_bytes = 16;
        config.circuit_breaker.min_throughput = 2;
        let gateway = test_gateway(config);

        for _ in 0..4 {
            let request = Request::post("/api/auth/register")
                .body(Full::new(Bytes::from(vec![b'x'; 64])))
                .unwrap();
            let response = gateway.handle(request, remote()).await;
            assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        }

        assert_eq!(upstream.hits(), 0);
        let breaker = gateway.breakers().get("auth-service").unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_streamed_body_over_limit() {
        let upstream = MockUpstream::start().await;
        let mut config = test_config(&[("auth-service", &upstream)]);
        config.limits.max_body_bytes = 16;
        config.circuit_breaker.min_throughput = 2;
        let gateway = test_gateway(config);

        for _ in 0..4 {
            let chunks = stream::iter(vec![
                Ok::<_, Infallible>(Frame::data(Bytes::from_static(b"0123456789"))),
                Ok(Frame::data(Bytes::from_static(b"0123456789"))),
            ]);
            let request = Request::post("/api/auth/register")
                .body(StreamBody::new(chunks))
                .unwrap();
            let response = gateway.handle(request, remote()).await;
            assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        }

        assert_eq!(upstream.completed(), 0);
        let breaker = gateway.breakers().get("auth-service").unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_unreachable_upstream() {
        let endpoint = unused_endpoint().await;
        let mut config = test_config(&[]);
        config.upstreams.insert("auth-service".into(), vec![endpoint]);
        let gateway = test_gateway(config);

        let response = gateway.handle(get("/api/auth/login"), remote()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["error"], "Service Unavailable");
    }

    #[tokio::test]
    async fn test_missing_upstream_pool() {
        let gateway = test_gateway(test_config(&[]));
        let response = gateway.handle(get("/api/auth/login"), remote()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    struct PanicOnBoom;

    impl Filter for PanicOnBoom {
        fn name(&self) -> &'static str {
            "panic_on_boom"
        }

        fn apply(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
            if ctx.path.contains("boom") {
                panic!("boom");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_500_and_gateway_keeps_serving() {
        let upstream = MockUpstream::start().await;
        let mut gateway = test_gateway(test_config(&[("auth-service", &upstream)]));
        gateway.push_filter(Arc::new(PanicOnBoom));

        let response = gateway.handle(get("/api/auth/boom"), remote()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await["error"], "Internal Server Error");

        let response = gateway.handle(get("/api/auth/login"), remote()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_local_endpoints() {
        let gateway = test_gateway(test_config(&[]));

        let response = gateway.handle(get("/health"), remote()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "UP");

        let response = gateway.handle(get("/fallback/tasks"), remote()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["error"], "Task Service Unavailable");

        let response = gateway.handle(get("/metrics"), remote()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}

use crate::body::GatewayBody;
use crate::config::Config;
use crate::context::Role;
use crate::filters::auth::Claims;
use crate::service::Gateway;
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use jsonwebtoken::{EncodingKey, Header, encode};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{Map, Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;

pub const TEST_SECRET: &str = "test-secret-key-for-the-gateway-0123456789";

const ECHOED_HEADERS: &[&str] = &[
    "host",
    "via",
    "authorization",
    "x-user-id",
    "x-user-email",
    "x-user-role",
    "x-request-id",
    "x-forwarded-for",
    "x-forwarded-host",
];

pub fn claims_for(id: i64, role: Role, ttl_secs: i64) -> Claims {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    Claims {
        id,
        email: format!("user{id}@example.com"),
        name: format!("User {id}"),
        role,
        exp: (now + ttl_secs).max(0) as u64,
    }
}

pub fn mint_token(claims: &Claims) -> String {
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
    )
    .unwrap()
}

pub fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}

#[derive(Default)]
struct MockState {
    hits: AtomicUsize,
    completed: AtomicUsize,
    status: AtomicU16,
    delay_ms: AtomicU64,
}

/// Upstream stand-in that answers every request with a JSON echo of its path,
/// method and the forwarded headers.
pub struct MockUpstream {
    port: u16,
    state: Arc<MockState>,
}

impl MockUpstream {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(MockState {
            status: AtomicU16::new(200),
            ..Default::default()
        });

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| echo(state.clone(), req));
                    let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        MockUpstream { port, state }
    }

    pub fn endpoint(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    /// Requests whose body arrived in full.
    pub fn completed(&self) -> usize {
        self.state.completed.load(Ordering::SeqCst)
    }

    pub fn set_status(&self, status: u16) {
        self.state.status.store(status, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

async fn echo(state: Arc<MockState>, req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let delay = state.delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    let (parts, body) = req.into_parts();
    let received = match body.collect().await {
        Ok(collected) => {
            state.completed.fetch_add(1, Ordering::SeqCst);
            collected.to_bytes().len()
        }
        Err(_) => 0,
    };

    let mut echo = Map::new();
    echo.insert(
        "path".into(),
        json!(parts.uri.path_and_query().map_or("/", |pq| pq.as_str())),
    );
    echo.insert("method".into(), json!(parts.method.as_str()));
    echo.insert("bodyBytes".into(), json!(received));
    for name in ECHOED_HEADERS {
        if let Some(value) = parts.headers.get(*name).and_then(|v| v.to_str().ok()) {
            echo.insert((*name).into(), json!(value));
        }
    }

    let mut response = Response::new(Full::new(Bytes::from(
        serde_json::to_vec(&Value::Object(echo)).unwrap(),
    )));
    *response.status_mut() = http::StatusCode::from_u16(state.status.load(Ordering::SeqCst)).unwrap();
    response
        .headers_mut()
        .insert(http::header::CONTENT_TYPE, "application/json".parse().unwrap());
    Ok(response)
}

/// An address nothing listens on.
pub async fn unused_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

pub fn test_config(upstreams: &[(&str, &MockUpstream)]) -> Config {
    let mut config = Config {
        jwt_secret: TEST_SECRET.into(),
        ..Default::default()
    };
    for (service, upstream) in upstreams {
        config
            .upstreams
            .insert((*service).to_string(), vec![upstream.endpoint()]);
    }
    config
}

pub fn test_gateway(config: Config) -> Gateway {
    let handle = PrometheusBuilder::new().build_recorder().handle();
    Gateway::new(&config, handle).unwrap()
}

pub async fn body_json(response: Response<GatewayBody>) -> Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

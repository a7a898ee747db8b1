// Serving loop and header helpers shared by every listener in the workspace.
// Hop-by-hop filtering should be applied by the proxy in both directions: requests from
// clients to upstreams, and responses coming back from upstreams to clients.

use http::Version;
use http::header::{
    CONNECTION, HeaderMap, HeaderName, HeaderValue, TE, TRAILER, TRANSFER_ENCODING, UPGRADE, VIA,
};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::Service;
use hyper::{Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::server::graceful::GracefulShutdown;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpListener;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

// Keep-Alive has no constant in `http::header` and is removed by name.
static HOP_BY_HOP_NAMES: &[HeaderName] = &[CONNECTION, TRANSFER_ENCODING, TE, TRAILER, UPGRADE];
const KEEP_ALIVE: &str = "keep-alive";

/// Connection level settings for [`run_http_service`].
#[derive(Clone, Debug)]
pub struct ServeOptions {
    /// Upper bound on the per-connection read buffer. Must be at least 8 KiB.
    pub max_buf_size: usize,
    /// How long a client may take to send the request head.
    pub header_read_timeout: Duration,
    /// How long in-flight requests get to finish once shutdown starts.
    pub drain: Duration,
}

impl Default for ServeOptions {
    fn default() -> Self {
        ServeOptions {
            max_buf_size: 64 * 1024,
            header_read_timeout: Duration::from_secs(30),
            drain: Duration::from_secs(20),
        }
    }
}

pub async fn bind(host: &str, port: u16) -> std::io::Result<TcpListener> {
    TcpListener::bind(format!("{host}:{port}")).await
}

/// Accepts HTTP/1.1 connections on `listener` until `shutdown` resolves, then waits up to
/// `options.drain` for open connections to finish their in-flight requests.
///
/// `make_service` is called once per connection with the peer address so services can
/// key per-client state on it.
pub async fn run_http_service<M, S, B, F>(
    listener: TcpListener,
    options: ServeOptions,
    make_service: M,
    shutdown: F,
) where
    M: Fn(SocketAddr) -> S,
    S: Service<Request<Incoming>, Response = Response<B>> + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
    F: Future<Output = ()>,
{
    let mut builder = http1::Builder::new();
    builder
        .timer(TokioTimer::new())
        .max_buf_size(options.max_buf_size)
        .header_read_timeout(options.header_read_timeout)
        .keep_alive(true);

    let graceful = GracefulShutdown::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);
                let io = TokioIo::new(stream);
                let conn = builder.serve_connection(io, make_service(peer_addr));
                let conn = graceful.watch(conn);

                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        tracing::debug!(error = %e, peer = %peer_addr, "Connection closed with error");
                    }
                });
            }
            _ = &mut shutdown => {
                tracing::info!("Shutdown requested, no longer accepting connections");
                break;
            }
        }
    }

    drop(listener);

    tokio::select! {
        _ = graceful.shutdown() => {
            tracing::info!("All connections drained");
        }
        _ = tokio::time::sleep(options.drain) => {
            tracing::warn!(drain_secs = options.drain.as_secs(), "Drain window elapsed with connections still open");
        }
    }
}

pub fn is_http1(v: Version) -> bool {
    matches!(v, Version::HTTP_09 | Version::HTTP_10 | Version::HTTP_11)
}

/// Adds a Via header to indicate the request/response passed through this proxy.
/// Appends to existing if Via is already present.
pub fn add_via_header(headers: &mut HeaderMap, version: Version) {
    let proxy_name = "gateway";

    let version_str = match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_11 => "1.1",
        Version::HTTP_2 => "2",
        Version::HTTP_3 => "3",
        _ => {
            tracing::debug!(?version, "Unknown HTTP version, skipping Via header");
            return;
        }
    };

    let via_value = format!("{version_str} {proxy_name}");
    append_list_header(headers, VIA, &via_value);
}

/// Appends the client address to X-Forwarded-For, creating the header if needed.
pub fn append_forwarded_for(headers: &mut HeaderMap, client: IpAddr) {
    append_list_header(headers, X_FORWARDED_FOR, &client.to_string());
}

fn append_list_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    let combined = match headers.get(&name).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{existing}, {value}"),
        _ => value.to_string(),
    };

    if let Ok(new_value) = HeaderValue::from_str(&combined) {
        headers.insert(name, new_value);
    }
}

// For HTTP/1.x connections, hop-by-hop headers are removed before forwarding:
// - standard hop-by-hop headers, including keep-alive
// - every Proxy-* header
// - any extra headers listed in the Connection header value
//
// HTTP/2 and HTTP/3 don't use hop-by-hop headers, so no filtering is performed.
pub fn filter_hop_by_hop(headers: &mut HeaderMap, version: Version) -> &mut HeaderMap {
    if !is_http1(version) {
        return headers;
    }

    // Parse the Connection header to find additional headers to drop
    let mut extra_drops: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|s| s.split(','))
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .filter_map(|t| HeaderName::from_bytes(t.as_bytes()).ok())
        .collect();

    extra_drops.extend(
        headers
            .keys()
            .filter(|name| name.as_str().starts_with("proxy-"))
            .cloned(),
    );

    for name in HOP_BY_HOP_NAMES {
        headers.remove(name);
    }
    headers.remove(KEEP_ALIVE);

    for name in extra_drops {
        headers.remove(&name);
    }

    headers
}

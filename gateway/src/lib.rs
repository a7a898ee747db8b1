pub mod body;
pub mod config;
pub mod context;
pub mod cors;
pub mod errors;
pub mod filters;
pub mod local;
pub mod metrics;
pub mod metrics_defs;
pub mod proxy;
pub mod response;
pub mod routes;
pub mod service;
pub mod upstreams;

#[cfg(test)]
mod testutils;

use config::Config;
use metrics_exporter_prometheus::PrometheusHandle;
use service::{Gateway, GatewayBuildError, GatewayService};
use shared::http::{ServeOptions, bind, run_http_service};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const CLIENT_HEADER_READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(thiserror::Error, Debug)]
pub enum RunError {
    #[error("could not bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Setup(#[from] GatewayBuildError),
}

/// Builds the gateway from `config` and serves it on the configured listener until
/// `shutdown` resolves.
pub async fn run<F>(config: Config, metrics: PrometheusHandle, shutdown: F) -> Result<(), RunError>
where
    F: Future<Output = ()>,
{
    let gateway = Gateway::new(&config, metrics)?;

    let listener = bind(&config.listener.host, config.listener.port)
        .await
        .map_err(|source| RunError::Bind {
            addr: format!("{}:{}", config.listener.host, config.listener.port),
            source,
        })?;

    serve(listener, gateway, &config, shutdown).await;
    Ok(())
}

/// Serves an already built gateway on `listener`.
pub async fn serve<F>(listener: TcpListener, gateway: Gateway, config: &Config, shutdown: F)
where
    F: Future<Output = ()>,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "Gateway listening");
    }

    let options = ServeOptions {
        max_buf_size: config.limits.buffer_bytes,
        header_read_timeout: CLIENT_HEADER_READ_TIMEOUT,
        drain: config.drain(),
    };
    let gateway = Arc::new(gateway);

    run_http_service(
        listener,
        options,
        move |remote_addr| GatewayService::new(gateway.clone(), remote_addr),
        shutdown,
    )
    .await;

    tracing::info!("Gateway stopped");
}

use crate::config::{EndpointHealthConfig, ValidationError};
use crate::errors::GatewayError;
use async_trait::async_trait;
use http::Uri;
use http::uri::Authority;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum EndpointError {
    #[error("endpoint must be host:port without scheme or path")]
    NotAuthority,
    #[error("endpoint is missing a port")]
    MissingPort,
    #[error("endpoint could not be parsed: {0}")]
    Invalid(String),
}

/// A single `host:port` an upstream service can be reached at.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    authority: String,
}

impl Endpoint {
    pub fn parse(s: &str) -> Result<Self, EndpointError> {
        let s = s.trim();
        if s.is_empty() || s.contains("://") || s.contains('/') || s.contains('@') {
            return Err(EndpointError::NotAuthority);
        }

        let authority: Authority = s
            .parse()
            .map_err(|e: http::uri::InvalidUri| EndpointError::Invalid(e.to_string()))?;
        let host = authority.host();
        if host.is_empty() {
            return Err(EndpointError::NotAuthority);
        }
        let port = authority.port_u16().ok_or(EndpointError::MissingPort)?;

        Ok(Endpoint {
            authority: format!("{host}:{port}"),
        })
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Absolute URI for `path_and_query` on this endpoint.
    pub fn uri(&self, path_and_query: &str) -> Result<Uri, http::uri::InvalidUri> {
        format!("http://{}{}", self.authority, path_and_query).parse()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    Failed,
}

/// Maps a service name to a concrete endpoint for one request.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, service: &str) -> Result<Endpoint, GatewayError>;

    /// Feeds the result of connecting to `endpoint` back into health tracking.
    fn report(&self, service: &str, endpoint: &Endpoint, outcome: ConnectOutcome);
}

struct EndpointSlot {
    endpoint: Endpoint,
    consecutive_failures: u32,
    first_failure_at: Option<Instant>,
    unhealthy_until: Option<Instant>,
}

impl EndpointSlot {
    fn is_healthy(&self, now: Instant) -> bool {
        self.unhealthy_until.is_none_or(|until| now >= until)
    }
}

struct EndpointPool {
    slots: RwLock<Vec<EndpointSlot>>,
    next: AtomicUsize,
}

/// Resolver over fixed endpoint lists, rotating round-robin and skipping endpoints
/// that recently failed to accept connections.
pub struct StaticResolver {
    pools: HashMap<String, EndpointPool>,
    failure_threshold: u32,
    failure_window: Duration,
    recovery: Duration,
}

impl StaticResolver {
    pub fn from_config(
        upstreams: &HashMap<String, Vec<String>>,
        health: &EndpointHealthConfig,
    ) -> Result<Self, ValidationError> {
        let mut pools = HashMap::with_capacity(upstreams.len());

        for (service, endpoints) in upstreams {
            if endpoints.is_empty() {
                return Err(ValidationError::EmptyUpstream(service.clone()));
            }

            let slots = endpoints
                .iter()
                .map(|raw| {
                    let endpoint =
                        Endpoint::parse(raw).map_err(|_| ValidationError::InvalidEndpoint {
                            service: service.clone(),
                            endpoint: raw.clone(),
                        })?;
                    Ok(EndpointSlot {
                        endpoint,
                        consecutive_failures: 0,
                        first_failure_at: None,
                        unhealthy_until: None,
                    })
                })
                .collect::<Result<Vec<_>, ValidationError>>()?;

            pools.insert(
                service.clone(),
                EndpointPool {
                    slots: RwLock::new(slots),
                    next: AtomicUsize::new(0),
                },
            );
        }

        Ok(StaticResolver {
            pools,
            failure_threshold: health.failure_threshold.max(1),
            failure_window: Duration::from_secs(health.failure_window_secs),
            recovery: Duration::from_secs(health.recovery_secs),
        })
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.pools.keys().map(String::as_str)
    }

    pub fn resolve_at(&self, service: &str, now: Instant) -> Result<Endpoint, GatewayError> {
        let pool = self
            .pools
            .get(service)
            .ok_or_else(|| GatewayError::NoUpstream(service.to_string()))?;

        let slots = pool.slots.read();
        let len = slots.len();
        let start = pool.next.fetch_add(1, Ordering::Relaxed) % len;

        (0..len)
            .map(|offset| &slots[(start + offset) % len])
            .find(|slot| slot.is_healthy(now))
            .map(|slot| slot.endpoint.clone())
            .ok_or_else(|| GatewayError::NoUpstream(service.to_string()))
    }

    pub fn report_at(
        &self,
        service: &str,
        endpoint: &Endpoint,
        outcome: ConnectOutcome,
        now: Instant,
    ) {
        let Some(pool) = self.pools.get(service) else {
            return;
        };
        let mut slots = pool.slots.write();
        let Some(slot) = slots.iter_mut().find(|s| &s.endpoint == endpoint) else {
            return;
        };

        match outcome {
            ConnectOutcome::Connected => {
                slot.consecutive_failures = 0;
                slot.first_failure_at = None;
                slot.unhealthy_until = None;
            }
            ConnectOutcome::Failed => {
                match slot.first_failure_at {
                    Some(first) if now.saturating_duration_since(first) <= self.failure_window => {
                        slot.consecutive_failures += 1;
                    }
                    _ => {
                        slot.first_failure_at = Some(now);
                        slot.consecutive_failures = 1;
                    }
                }

                if slot.consecutive_failures >= self.failure_threshold {
                    tracing::warn!(
                        service,
                        endpoint = %slot.endpoint,
                        recovery_secs = self.recovery.as_secs(),
                        "Endpoint marked unhealthy after repeated connection failures"
                    );
                    slot.unhealthy_until = Some(now + self.recovery);
                    slot.consecutive_failures = 0;
                    slot.first_failure_at = None;
                }
            }
        }
    }

    /// Number of endpoints currently in rotation for `service`.
    pub fn healthy_count(&self, service: &str) -> usize {
        let now = Instant::now();
        self.pools
            .get(service)
            .map(|pool| pool.slots.read().iter().filter(|s| s.is_healthy(now)).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, service: &str) -> Result<Endpoint, GatewayError> {
        self.resolve_at(service, Instant::now())
    }

    fn report(&self, service: &str, endpoint: &Endpoint, outcome: ConnectOutcome) {
        self.report_at(service, endpoint, outcome, Instant::now())
    }
}

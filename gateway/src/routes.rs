use crate::config::RateLimitConfig;
use crate::errors::GatewayError;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum RouteTableError {
    #[error("route prefix {0:?} must start with '/'")]
    InvalidPrefix(String),
    #[error("route prefix {0:?} is declared twice")]
    DuplicatePrefix(String),
}

/// Handlers served by the gateway itself rather than an upstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocalEndpoint {
    Health,
    Metrics,
    Fallback,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Target {
    /// Proxy to the named upstream pool
    Upstream(String),
    Local(LocalEndpoint),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Rewrite {
    /// Forward the path unchanged
    Keep,
    /// Swap the matched prefix for another one, keeping the remainder
    ReplacePrefix(String),
}

/// Error text and message returned while a breaker rejects calls.
#[derive(Clone, Debug, PartialEq)]
pub struct Fallback {
    pub error: String,
    pub message: String,
}

impl Fallback {
    /// Builds the fallback for a service given its display name, e.g. "Project".
    pub fn for_service(display_name: &str) -> Self {
        Fallback {
            error: format!("{display_name} Service Unavailable"),
            message: format!(
                "The {} service is currently unavailable. Please try again later.",
                display_name.to_lowercase()
            ),
        }
    }

    pub fn generic() -> Self {
        Fallback {
            error: "Service Unavailable".into(),
            message: "The service is currently unavailable. Please try again later.".into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RateLimit {
    pub capacity: u32,
    pub window: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RouteDescriptor {
    pub prefix: Arc<str>,
    pub target: Target,
    pub rewrite: Rewrite,
    pub requires_auth: bool,
    pub rate_limit: Option<RateLimit>,
    /// Name of the breaker guarding this route, usually the upstream name
    pub circuit_breaker: Option<String>,
    pub fallback: Option<Fallback>,
}

impl RouteDescriptor {
    pub fn matches(&self, path: &str) -> bool {
        prefix_matches(&self.prefix, path)
    }

    pub fn upstream(&self) -> Option<&str> {
        match &self.target {
            Target::Upstream(name) => Some(name),
            Target::Local(_) => None,
        }
    }

    /// Path to send upstream for a request `path` matched by this route.
    pub fn rewrite_path(&self, path: &str) -> String {
        match &self.rewrite {
            Rewrite::Keep => path.to_string(),
            Rewrite::ReplacePrefix(replacement) => {
                let rest = path.get(self.prefix.len()..).unwrap_or("");
                let rewritten = format!("{replacement}{rest}");
                if rewritten.is_empty() {
                    "/".to_string()
                } else {
                    rewritten
                }
            }
        }
    }
}

/// Segment-aware prefix match: `/api/tasks` matches `/api/tasks` and `/api/tasks/1`
/// but not `/api/tasksfoo`.
pub fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix.ends_with('/') {
        return path.starts_with(prefix);
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Route table ordered by descending prefix length. Ties keep declaration order.
#[derive(Debug)]
pub struct RouteTable {
    routes: Vec<Arc<RouteDescriptor>>,
}

impl RouteTable {
    pub fn new(routes: Vec<RouteDescriptor>) -> Result<Self, RouteTableError> {
        let mut seen = HashSet::new();
        for route in &routes {
            if !route.prefix.starts_with('/') {
                return Err(RouteTableError::InvalidPrefix(route.prefix.to_string()));
            }
            if !seen.insert(route.prefix.clone()) {
                return Err(RouteTableError::DuplicatePrefix(route.prefix.to_string()));
            }
        }

        let mut routes: Vec<_> = routes.into_iter().map(Arc::new).collect();
        // sort_by is stable
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        Ok(RouteTable { routes })
    }

    pub fn find(&self, path: &str) -> Result<Arc<RouteDescriptor>, GatewayError> {
        self.routes
            .iter()
            .find(|route| route.matches(path))
            .cloned()
            .ok_or_else(|| GatewayError::NoRoute(path.to_string()))
    }

    pub fn routes(&self) -> impl Iterator<Item = &Arc<RouteDescriptor>> {
        self.routes.iter()
    }

    /// Names of all upstreams referenced by the table.
    pub fn upstreams(&self) -> BTreeSet<&str> {
        self.routes.iter().filter_map(|r| r.upstream()).collect()
    }

    /// Names of all breakers referenced by the table.
    pub fn breakers(&self) -> BTreeSet<&str> {
        self.routes
            .iter()
            .filter_map(|r| r.circuit_breaker.as_deref())
            .collect()
    }

    /// Fallback declared by the `/api/{key}` route, as served under `/fallback/{key}`.
    pub fn fallback_for(&self, key: &str) -> Option<&Fallback> {
        let prefix = format!("/api/{key}");
        self.routes
            .iter()
            .find(|r| *r.prefix == *prefix)
            .and_then(|r| r.fallback.as_ref())
    }
}

struct ServiceRoute {
    key: &'static str,
    upstream: &'static str,
    display_name: &'static str,
    requires_auth: bool,
}

const SERVICES: &[ServiceRoute] = &[
    ServiceRoute {
        key: "auth",
        upstream: "auth-service",
        display_name: "Authentication",
        requires_auth: false,
    },
    ServiceRoute {
        key: "projects",
        upstream: "project-service",
        display_name: "Project",
        requires_auth: true,
    },
    ServiceRoute {
        key: "tasks",
        upstream: "task-service",
        display_name: "Task",
        requires_auth: true,
    },
    ServiceRoute {
        key: "admin",
        upstream: "admin-service",
        display_name: "Admin",
        requires_auth: true,
    },
    ServiceRoute {
        key: "integrations",
        upstream: "integration-service",
        display_name: "Integration",
        requires_auth: true,
    },
];

const UPSTREAM_HEALTH_PATH: &str = "/actuator/health";

/// The gateway's route table for the task management platform.
///
/// Every service gets an authenticated, rate limited and breaker-guarded route under
/// `/api/{key}`, plus an open `/api/{key}/health` route rewritten to the service's
/// actuator endpoint.
pub fn default_routes(rate_limit: &RateLimitConfig) -> Vec<RouteDescriptor> {
    let limit = RateLimit {
        capacity: rate_limit.requests_per_window,
        window: rate_limit.window(),
    };

    let mut routes = Vec::with_capacity(SERVICES.len() * 2 + 3);
    for service in SERVICES {
        let prefix = format!("/api/{}", service.key);
        routes.push(RouteDescriptor {
            prefix: format!("{prefix}/health").into(),
            target: Target::Upstream(service.upstream.into()),
            rewrite: Rewrite::ReplacePrefix(UPSTREAM_HEALTH_PATH.into()),
            requires_auth: false,
            rate_limit: None,
            circuit_breaker: None,
            fallback: None,
        });
        routes.push(RouteDescriptor {
            prefix: prefix.into(),
            target: Target::Upstream(service.upstream.into()),
            rewrite: Rewrite::Keep,
            requires_auth: service.requires_auth,
            rate_limit: Some(limit.clone()),
            circuit_breaker: Some(service.upstream.into()),
            fallback: Some(Fallback::for_service(service.display_name)),
        });
    }

    for (prefix, endpoint) in [
        ("/health", LocalEndpoint::Health),
        ("/metrics", LocalEndpoint::Metrics),
        ("/fallback", LocalEndpoint::Fallback),
    ] {
        routes.push(RouteDescriptor {
            prefix: prefix.into(),
            target: Target::Local(endpoint),
            rewrite: Rewrite::Keep,
            requires_auth: false,
            rate_limit: None,
            circuit_breaker: None,
            fallback: None,
        });
    }

    routes
}

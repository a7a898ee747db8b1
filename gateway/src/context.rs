use crate::errors::GatewayError;
use crate::filters::circuit_breaker::BreakerPermit;
use crate::routes::RouteDescriptor;
use http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Admin,
    Manager,
    Member,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "ADMIN",
            Role::Manager => "MANAGER",
            Role::Member => "MEMBER",
        }
    }
}

/// Caller identity established from a verified bearer token.
#[derive(Clone, Debug, PartialEq)]
pub struct Identity {
    pub subject_id: i64,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub token: String,
}

/// Per-request state threaded through the filter chain.
///
/// Filters read and write it in order. Nothing in here outlives the request.
pub struct RequestContext {
    pub request_id: String,
    pub method: Method,
    pub path: String,
    pub remote_addr: SocketAddr,
    /// Inbound headers, normalized and later forwarded upstream
    pub headers: HeaderMap,
    pub route: Option<Arc<RouteDescriptor>>,
    pub identity: Option<Identity>,
    /// Admission granted by the breaker, settled once the upstream outcome is known
    pub breaker_permit: Option<BreakerPermit>,
    pub started_at: Instant,
    pub deadline: Instant,
}

impl RequestContext {
    pub fn new(
        request_id: String,
        method: Method,
        path: &str,
        remote_addr: SocketAddr,
        headers: HeaderMap,
        started_at: Instant,
        deadline: Instant,
    ) -> Self {
        RequestContext {
            request_id,
            method,
            path: path.to_string(),
            remote_addr,
            headers,
            route: None,
            identity: None,
            breaker_permit: None,
            started_at,
            deadline,
        }
    }

    /// The matched route. Filters run only after routing, so a miss is a bug.
    pub fn route(&self) -> Result<&Arc<RouteDescriptor>, GatewayError> {
        self.route
            .as_ref()
            .ok_or_else(|| GatewayError::Internal("filter ran before routing".into()))
    }

    pub fn service(&self) -> Option<&str> {
        self.route.as_ref().and_then(|r| r.upstream())
    }
}

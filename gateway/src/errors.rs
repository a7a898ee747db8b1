use crate::routes::Fallback;
use http::{Method, StatusCode};
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

/// Every way a request can be terminated by the gateway itself.
///
/// Each variant maps to one status code and one short `error` text of the JSON
/// envelope. The `Display` output becomes the envelope's `message`.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("No route matches {0}")]
    NoRoute(String),

    #[error("Method {0} is not supported")]
    MethodNotAllowed(Method),

    #[error("Malformed request: {0}")]
    BadRequest(String),

    #[error("Request body exceeds the limit of {0} bytes")]
    PayloadTooLarge(u64),

    #[error("Origin is not allowed to make cross-origin requests")]
    CorsRejected,

    #[error("{0}")]
    Unauthenticated(&'static str),

    #[error("Rate limit exceeded, retry after {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },

    #[error("{}", fallback.message)]
    CircuitOpen { service: String, fallback: Fallback },

    #[error("No healthy endpoint available for {0}")]
    NoUpstream(String),

    #[error("Could not connect to {service}: {reason}")]
    UpstreamConnect { service: String, reason: String },

    #[error("Request to {service} failed: {reason}")]
    UpstreamRequest { service: String, reason: String },

    #[error("{service} did not respond in time")]
    UpstreamTimeout { service: String },

    #[error("Client closed the connection")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::NoRoute(_) => StatusCode::NOT_FOUND,
            GatewayError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::CorsRejected => StatusCode::FORBIDDEN,
            GatewayError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CircuitOpen { .. }
            | GatewayError::NoUpstream(_)
            | GatewayError::UpstreamConnect { .. }
            | GatewayError::UpstreamRequest { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            // Nobody reads this response, but it must still be accounted as a client fault.
            GatewayError::Cancelled => StatusCode::BAD_REQUEST,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short text for the envelope's `error` field.
    pub fn error_text(&self) -> &str {
        match self {
            GatewayError::NoRoute(_) => "Service Not Found",
            GatewayError::Unauthenticated(_) => "Unauthorized",
            GatewayError::RateLimited { .. } => "Too Many Requests",
            GatewayError::CircuitOpen { fallback, .. } => &fallback.error,
            GatewayError::NoUpstream(_)
            | GatewayError::UpstreamConnect { .. }
            | GatewayError::UpstreamRequest { .. } => "Service Unavailable",
            other => other.status().canonical_reason().unwrap_or("Error"),
        }
    }

    /// Whether the breaker guarding the upstream should count this as a failed call.
    pub fn is_upstream_failure(&self) -> bool {
        matches!(
            self,
            GatewayError::NoUpstream(_)
                | GatewayError::UpstreamConnect { .. }
                | GatewayError::UpstreamRequest { .. }
                | GatewayError::UpstreamTimeout { .. }
        )
    }

    /// Breaker fallbacks are expected degradation and stay out of the error counters.
    pub fn counts_as_error(&self) -> bool {
        !matches!(self, GatewayError::CircuitOpen { .. })
    }
}

/// Faults raised while streaming a body through the gateway, in either direction.
#[derive(Error, Debug)]
pub enum BodyError {
    #[error("body exceeds the limit of {0} bytes")]
    TooLarge(u64),

    #[error("no body data received within the idle timeout")]
    Idle,

    #[error("request deadline elapsed while streaming the body")]
    Deadline,

    #[error("body stream failed: {0}")]
    Stream(#[source] shared::http::BoxError),
}

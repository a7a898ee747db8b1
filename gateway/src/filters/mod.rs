//! Admission filters run, in order, on every request routed to an upstream.
//!
//! The chain is fixed at startup: authentication, then rate limiting, then the circuit
//! breaker. A filter either lets the request continue, possibly after enriching the
//! [`RequestContext`], or ends it with a [`GatewayError`] that the pipeline formats.

pub mod auth;
pub mod circuit_breaker;
pub mod rate_limit;

use crate::context::RequestContext;
use crate::errors::GatewayError;

pub trait Filter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs synchronously. Implementations must not block on I/O.
    fn apply(&self, ctx: &mut RequestContext) -> Result<(), GatewayError>;
}

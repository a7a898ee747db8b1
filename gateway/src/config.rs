use crate::upstreams::Endpoint;
use http::Method;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const ENV_PREFIX: &str = "GATEWAY_";
const UPSTREAM_ENV_PREFIX: &str = "GATEWAY_UPSTREAM_";

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("JWT secret is required")]
    MissingJwtSecret,

    #[error("Rate limit must allow at least one request per window")]
    InvalidRateLimit,

    #[error("Rate limit bucket table needs a non-zero capacity and shard count")]
    InvalidBucketTable,

    #[error("Failure ratio must be in (0, 1], got {0}")]
    InvalidFailureRatio(f64),

    #[error("Circuit breaker needs at least one probe")]
    InvalidProbeCount,

    #[error("Connection buffer must be at least 8192 bytes")]
    InvalidBufferSize,

    #[error("Upstream {0} has no endpoints")]
    EmptyUpstream(String),

    #[error("Invalid endpoint {endpoint} for upstream {service}")]
    InvalidEndpoint { service: String, endpoint: String },

    #[error("Invalid CORS method: {0}")]
    InvalidMethod(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid value for {name}: {reason}")]
    InvalidEnv { name: String, reason: String },
    #[error("invalid config: {0}")]
    Invalid(#[from] ValidationError),
}

/// Gateway configuration.
///
/// Every field has a default except `jwt_secret`, so a deployment can run from
/// environment variables alone.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Main listener for incoming requests
    pub listener: Listener,
    /// HMAC secret used to verify bearer tokens
    pub jwt_secret: String,
    /// Seconds in-flight requests get to finish during shutdown
    pub drain_secs: u64,
    pub limits: RequestLimits,
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub timeouts: UpstreamTimeouts,
    pub endpoint_health: EndpointHealthConfig,
    pub cors: CorsConfig,
    /// Maps upstream service names to their static `host:port` pools
    pub upstreams: HashMap<String, Vec<String>>,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listener: Listener::default(),
            jwt_secret: String::new(),
            drain_secs: 20,
            limits: RequestLimits::default(),
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            timeouts: UpstreamTimeouts::default(),
            endpoint_health: EndpointHealthConfig::default(),
            cors: CorsConfig::default(),
            upstreams: HashMap::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }

    /// Loads the optional YAML file, overlays the process environment and validates.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        config.apply_env(std::env::vars())?;
        config.validate()?;

        Ok(config)
    }

    /// Overlays `GATEWAY_*` variables on top of the current values.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            if !name.starts_with(ENV_PREFIX) {
                continue;
            }

            if let Some(upstream) = name.strip_prefix(UPSTREAM_ENV_PREFIX) {
                let endpoints = value
                    .split(',')
                    .map(str::trim)
                    .filter(|e| !e.is_empty())
                    .map(String::from)
                    .collect();
                self.upstreams
                    .insert(upstream.to_lowercase().replace('_', "-"), endpoints);
                continue;
            }

            match name.as_str() {
                "GATEWAY_LISTEN" => self.listener = parse_env(&name, &value)?,
                "GATEWAY_JWT_SECRET" => self.jwt_secret = value,
                "GATEWAY_RATE_LIMIT" => {
                    self.rate_limit.requests_per_window = parse_env(&name, &value)?
                }
                "GATEWAY_DRAIN_SECONDS" => self.drain_secs = parse_env(&name, &value)?,
                "GATEWAY_REQUEST_TIMEOUT_SECONDS" => {
                    self.limits.request_timeout_secs = parse_env(&name, &value)?
                }
                "GATEWAY_SENTRY_DSN" => {
                    self.logging.sentry_dsn = Some(value).filter(|dsn| !dsn.is_empty())
                }
                _ => tracing::debug!(name = %name, "Ignoring unknown gateway variable"),
            }
        }

        Ok(())
    }

    /// Validates the gateway configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;

        if self.jwt_secret.is_empty() {
            return Err(ValidationError::MissingJwtSecret);
        }

        if self.limits.buffer_bytes < 8192 {
            return Err(ValidationError::InvalidBufferSize);
        }

        self.rate_limit.validate()?;
        self.circuit_breaker.validate()?;
        self.cors.validate()?;

        for (service, endpoints) in &self.upstreams {
            if endpoints.is_empty() {
                return Err(ValidationError::EmptyUpstream(service.clone()));
            }
            for endpoint in endpoints {
                Endpoint::parse(endpoint).map_err(|_| ValidationError::InvalidEndpoint {
                    service: service.clone(),
                    endpoint: endpoint.clone(),
                })?;
            }
        }

        Ok(())
    }

    pub fn drain(&self) -> Duration {
        Duration::from_secs(self.drain_secs)
    }
}

fn parse_env<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidEnv {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

impl Listener {
    /// Validates the listener configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

/// Parses `host:port` or `:port` (all interfaces).
impl FromStr for Listener {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected [host]:port, got {s:?}"))?;
        let port = port.parse::<u16>().map_err(|e| e.to_string())?;
        let host = if host.is_empty() { "0.0.0.0" } else { host };

        Ok(Listener {
            host: host.to_string(),
            port,
        })
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RequestLimits {
    /// Wall-clock budget for one request, including the streamed response body
    pub request_timeout_secs: u64,
    /// Largest accepted request body
    pub max_body_bytes: u64,
    /// Per-connection read buffer
    pub buffer_bytes: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        RequestLimits {
            request_timeout_secs: 30,
            max_body_bytes: 10 * 1024 * 1024,
            buffer_bytes: 64 * 1024,
        }
    }
}

impl RequestLimits {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Bucket capacity, also the number of tokens refilled per window
    pub requests_per_window: u32,
    pub window_secs: u64,
    /// Upper bound on tracked buckets across all shards
    pub max_buckets: usize,
    pub shards: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            requests_per_window: 100,
            window_secs: 60,
            max_buckets: 100_000,
            shards: 64,
        }
    }
}

impl RateLimitConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.requests_per_window == 0 || self.window_secs == 0 {
            return Err(ValidationError::InvalidRateLimit);
        }
        if self.max_buckets == 0 || self.shards == 0 {
            return Err(ValidationError::InvalidBucketTable);
        }
        Ok(())
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Length of the rolling window outcomes are counted over
    pub window_secs: u64,
    /// Calls needed in the window before the failure ratio is considered
    pub min_throughput: u32,
    pub failure_ratio: f64,
    pub open_duration_ms: u64,
    /// Concurrent requests admitted while half-open
    pub probe_count: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            window_secs: 60,
            min_throughput: 20,
            failure_ratio: 0.5,
            open_duration_ms: 10_000,
            probe_count: 1,
        }
    }
}

impl CircuitBreakerConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if !(self.failure_ratio > 0.0 && self.failure_ratio <= 1.0) {
            return Err(ValidationError::InvalidFailureRatio(self.failure_ratio));
        }
        if self.probe_count == 0 {
            return Err(ValidationError::InvalidProbeCount);
        }
        Ok(())
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn open_duration(&self) -> Duration {
        Duration::from_millis(self.open_duration_ms)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpstreamTimeouts {
    pub connect_ms: u64,
    /// Time allowed between sending the request and receiving the response head
    pub header_read_ms: u64,
    /// Longest pause tolerated between two body frames in either direction
    pub idle_ms: u64,
}

impl Default for UpstreamTimeouts {
    fn default() -> Self {
        UpstreamTimeouts {
            connect_ms: 2_000,
            header_read_ms: 5_000,
            idle_ms: 30_000,
        }
    }
}

impl UpstreamTimeouts {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn header_read(&self) -> Duration {
        Duration::from_millis(self.header_read_ms)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }
}

/// Passive health tracking for individual upstream endpoints
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct EndpointHealthConfig {
    /// Consecutive connection failures that take an endpoint out of rotation
    pub failure_threshold: u32,
    pub failure_window_secs: u64,
    /// How long an unhealthy endpoint stays out of rotation
    pub recovery_secs: u64,
}

impl Default for EndpointHealthConfig {
    fn default() -> Self {
        EndpointHealthConfig {
            failure_threshold: 3,
            failure_window_secs: 30,
            recovery_secs: 15,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct CorsConfig {
    /// Glob patterns matched against the Origin header, e.g. `http://localhost:*`
    pub allowed_origin_patterns: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub exposed_headers: Vec<String>,
    pub max_age_secs: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        CorsConfig {
            allowed_origin_patterns: vec![
                "http://localhost:*".into(),
                "http://127.0.0.1:*".into(),
                "http://host.docker.internal:*".into(),
            ],
            allowed_methods: ["GET", "POST", "PUT", "DELETE", "PATCH", "OPTIONS"]
                .into_iter()
                .map(String::from)
                .collect(),
            exposed_headers: vec!["Authorization".into()],
            max_age_secs: 3600,
        }
    }
}

impl CorsConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        for method in &self.allowed_methods {
            Method::from_bytes(method.as_bytes())
                .map_err(|_| ValidationError::InvalidMethod(method.clone()))?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub sentry_dsn: Option<String>,
}

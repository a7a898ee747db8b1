use crate::body::{GatewayBody, empty_body};
use crate::config::CorsConfig;
use crate::errors::GatewayError;
use http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_MAX_AGE,
    ACCESS_CONTROL_REQUEST_HEADERS, ACCESS_CONTROL_REQUEST_METHOD, HeaderMap, HeaderValue, ORIGIN,
    VARY,
};
use http::{Method, Response, StatusCode};

const DEFAULT_METHODS: &str = "GET, POST, PUT, DELETE, PATCH, OPTIONS";

/// Cross-origin policy for browser clients.
pub struct Cors {
    origin_patterns: Vec<String>,
    allow_methods: HeaderValue,
    expose_headers: Option<HeaderValue>,
    max_age: HeaderValue,
}

impl Cors {
    pub fn new(config: &CorsConfig) -> Self {
        let allow_methods = HeaderValue::from_str(&config.allowed_methods.join(", "))
            .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_METHODS));
        let expose_headers = (!config.exposed_headers.is_empty())
            .then(|| HeaderValue::from_str(&config.exposed_headers.join(", ")).ok())
            .flatten();

        Cors {
            origin_patterns: config.allowed_origin_patterns.clone(),
            allow_methods,
            expose_headers,
            max_age: HeaderValue::from(config.max_age_secs),
        }
    }

    pub fn is_preflight(method: &Method, headers: &HeaderMap) -> bool {
        *method == Method::OPTIONS
            && headers.contains_key(ORIGIN)
            && headers.contains_key(ACCESS_CONTROL_REQUEST_METHOD)
    }

    /// The request's Origin, if it matches one of the allowed patterns.
    pub fn allowed_origin(&self, headers: &HeaderMap) -> Option<HeaderValue> {
        let origin = headers.get(ORIGIN)?;
        let text = origin.to_str().ok()?;
        self.origin_patterns
            .iter()
            .any(|pattern| glob_match(pattern, text))
            .then(|| origin.clone())
    }

    /// Answers a preflight locally. Disallowed origins are refused with 403.
    pub fn preflight(&self, headers: &HeaderMap) -> Result<Response<GatewayBody>, GatewayError> {
        let origin = self
            .allowed_origin(headers)
            .ok_or(GatewayError::CorsRejected)?;

        let mut response = Response::new(empty_body());
        *response.status_mut() = StatusCode::NO_CONTENT;

        let allow_headers = headers
            .get(ACCESS_CONTROL_REQUEST_HEADERS)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("*"));

        let out = response.headers_mut();
        out.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        out.insert(ACCESS_CONTROL_ALLOW_METHODS, self.allow_methods.clone());
        out.insert(ACCESS_CONTROL_ALLOW_HEADERS, allow_headers);
        out.insert(ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
        out.insert(ACCESS_CONTROL_MAX_AGE, self.max_age.clone());

        Ok(response)
    }

    /// Adds `Vary: Origin` to every response, plus the CORS response headers when `origin`
    /// is allowed. Preflight answers already carry their own allow headers.
    pub fn decorate<B>(&self, response: &mut Response<B>, origin: Option<HeaderValue>) {
        let headers = response.headers_mut();
        headers.append(VARY, HeaderValue::from_static("Origin"));

        let Some(origin) = origin else {
            return;
        };
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        headers.insert(ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
        if let Some(expose) = &self.expose_headers {
            headers.insert(ACCESS_CONTROL_EXPOSE_HEADERS, expose.clone());
        }
    }
}

/// Matches `text` against `pattern`, where `*` stands for any run of characters.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern = pattern.as_bytes();
    let text = text.as_bytes();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            backtrack = Some((p, t));
            p += 1;
        } else if p < pattern.len() && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&b| b == b'*')
}

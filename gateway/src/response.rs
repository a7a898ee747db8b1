use crate::body::{GatewayBody, full_body};
use crate::errors::GatewayError;
use chrono::{SecondsFormat, Utc};
use http::header::{CONTENT_TYPE, HeaderValue, RETRY_AFTER};
use http::{Response, StatusCode};
use serde::Serialize;

pub const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

// Used when serialization itself fails, which keeps error responses infallible.
const STATIC_INTERNAL_ERROR: &str = r#"{"status":500,"error":"Internal Server Error","message":"An unexpected error occurred"}"#;

/// Error body returned for every failure the gateway produces itself.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope<'a> {
    pub timestamp: String,
    pub status: u16,
    pub error: &'a str,
    pub message: &'a str,
    pub path: &'a str,
}

impl<'a> ErrorEnvelope<'a> {
    pub fn new(status: StatusCode, error: &'a str, message: &'a str, path: &'a str) -> Self {
        ErrorEnvelope {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            status: status.as_u16(),
            error,
            message,
            path,
        }
    }
}

/// Serializes `value` as the JSON body of a response with the given status.
pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<GatewayBody> {
    let (status, body) = match serde_json::to_vec(value) {
        Ok(body) => (status, body),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize response body");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                STATIC_INTERNAL_ERROR.as_bytes().to_vec(),
            )
        }
    };

    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
    response
}

pub fn envelope_response(
    status: StatusCode,
    error: &str,
    message: &str,
    path: &str,
) -> Response<GatewayBody> {
    json_response(status, &ErrorEnvelope::new(status, error, message, path))
}

/// Formats a pipeline error as an envelope response for the request `path`.
pub fn error_response(err: &GatewayError, path: &str) -> Response<GatewayBody> {
    let status = err.status();
    let message = err.to_string();
    let mut response = envelope_response(status, err.error_text(), &message, path);

    if let GatewayError::RateLimited { retry_after_secs } = err {
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(*retry_after_secs));
    }

    response
}

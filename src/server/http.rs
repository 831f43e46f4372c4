//! Plain HTTP requests served outside the WebSocket upgrade
//!
//! Parses the request head with `httparse` and builds the health, CORS
//! preflight and error responses as `http::Response` values. Each response
//! closes the connection after it is written.

use thiserror::Error;
use tokio_tungstenite::tungstenite::http::{self, header, response, Response, StatusCode};

use super::route::{HealthStatus, Route};

/// Methods advertised in CORS preflight responses
pub const ALLOWED_METHODS: &str = "GET, OPTIONS";

/// Most headers accepted in a request head
pub const MAX_HEADERS: usize = 64;

/// Errors that can occur while building a response
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Invalid response: {0}")]
    Build(#[from] http::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for response building
pub type HttpResult<T> = Result<T, HttpError>;

/// The parts of a request head used for routing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub origin: Option<String>,
    /// `access-control-request-headers`, echoed back on preflight
    pub requested_headers: Option<String>,
    /// Length of the head in bytes, including the blank line
    pub len: usize,
}

impl RequestHead {
    /// Parse a request head; `Ok(None)` means more bytes are needed
    pub fn parse(buf: &[u8]) -> Result<Option<Self>, httparse::Error> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        let len = match request.parse(buf)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return Ok(None),
        };

        let header = |name: &str| {
            request
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case(name))
                .and_then(|h| std::str::from_utf8(h.value).ok())
                .map(str::to_string)
        };

        Ok(Some(Self {
            method: request.method.unwrap_or_default().to_string(),
            target: request.path.unwrap_or_default().to_string(),
            origin: header("origin"),
            requested_headers: header("access-control-request-headers"),
            len,
        }))
    }

    pub fn route(&self) -> Route {
        Route::parse(&self.target)
    }
}

fn builder(status: StatusCode, cors_origin: Option<&str>) -> response::Builder {
    let builder = Response::builder()
        .status(status)
        .header(header::CONNECTION, "close");
    match cors_origin {
        Some(origin) => builder.header(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin),
        None => builder,
    }
}

fn finish(builder: response::Builder, body: String) -> HttpResult<Response<String>> {
    Ok(builder
        .header(header::CONTENT_LENGTH, body.len())
        .body(body)?)
}

/// `200 OK` with the JSON health status
pub fn health_response(
    status: &HealthStatus,
    cors_origin: Option<&str>,
) -> HttpResult<Response<String>> {
    let body = serde_json::to_string(status)?;
    finish(
        builder(StatusCode::OK, cors_origin).header(header::CONTENT_TYPE, "application/json"),
        body,
    )
}

/// `204 No Content` answering a CORS preflight
pub fn preflight_response(
    cors_origin: Option<&str>,
    requested_headers: Option<&str>,
) -> HttpResult<Response<String>> {
    let mut builder = builder(StatusCode::NO_CONTENT, cors_origin)
        .header(header::ACCESS_CONTROL_ALLOW_METHODS, ALLOWED_METHODS)
        .header(header::ACCESS_CONTROL_MAX_AGE, "86400");
    if let Some(requested) = requested_headers {
        builder = builder.header(header::ACCESS_CONTROL_ALLOW_HEADERS, requested);
    }
    finish(builder, String::new())
}

/// Plain-text error response whose body is the status reason
pub fn status_response(status: StatusCode, cors_origin: Option<&str>) -> HttpResult<Response<String>> {
    let body = status.canonical_reason().unwrap_or_default().to_string();
    finish(
        builder(status, cors_origin).header(header::CONTENT_TYPE, "text/plain"),
        body,
    )
}

/// Serialize a response for writing to the socket
pub fn encode(response: &Response<String>) -> Vec<u8> {
    let mut out = format!("{:?} {}\r\n", response.version(), response.status()).into_bytes();
    for (name, value) in response.headers() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(response.body().as_bytes());
    out
}

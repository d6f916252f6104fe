//! JSON response builders shared by every route.

use crate::error::ProposalError;
use chrono::{SecondsFormat, Utc};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;
use tracing::error;

/// Correlation header read from requests and echoed on responses
pub const REQUEST_ID_HEADER: &str = "x-request-id";

const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody<'a> {
    status: u16,
    error: &'a str,
    message: &'a str,
    request_id: &'a str,
    timestamp: String,
}

/// Current time as RFC 3339 UTC with millisecond precision
#[must_use]
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// 200-style JSON response with the correlation id attached
pub fn json_response(status: StatusCode, body: String, request_id: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Error response carrying only the client-safe message
pub fn error_response(err: &ProposalError, request_id: &str) -> Response<Full<Bytes>> {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = ErrorBody {
        status: status.as_u16(),
        error: status.canonical_reason().unwrap_or("Error"),
        message: err.client_message(),
        request_id,
        timestamp: timestamp_now(),
    };
    let json = serde_json::to_string(&body).unwrap_or_else(|e| {
        error!(request_id = %request_id, error = %e, "Failed to serialise error body");
        format!(r#"{{"status":{}}}"#, status.as_u16())
    });
    json_response(status, json, request_id)
}

//! # Middleware Module
//!
//! Per-request bookkeeping wrapped around every route: the correlation id
//! and the wall-clock timer feeding the metrics aggregator and the
//! completion log line.

use super::responses::REQUEST_ID_HEADER;
use hyper::HeaderMap;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Longest client-supplied correlation id that is reused
pub const MAX_REQUEST_ID_LEN: usize = 128;

/// Reuse the caller's `X-Request-Id` when usable, otherwise mint a UUID v4
#[must_use]
pub fn resolve_request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty() && id.len() <= MAX_REQUEST_ID_LEN)
        .map_or_else(|| Uuid::new_v4().to_string(), str::to_string)
}

/// Request timing and completion logging
#[derive(Debug, Clone)]
pub struct RequestMiddleware {
    request_id: String,
    start_time: Instant,
}

impl RequestMiddleware {
    /// Start timing a request identified by its headers
    pub fn start(headers: &HeaderMap) -> Self {
        Self {
            request_id: resolve_request_id(headers),
            start_time: Instant::now(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Whole milliseconds since the request was received
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.start_time.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Log request completion with timing
    pub fn log_completion(&self, status_code: u16, path: &str, method: &str) {
        let elapsed_ms = self.start_time.elapsed().as_secs_f64() * 1000.0;
        if status_code >= 400 {
            warn!(
                request_id = %self.request_id,
                "Request completed: {} {} - {} ({:.2}ms)",
                method, path, status_code, elapsed_ms
            );
        } else {
            info!(
                request_id = %self.request_id,
                "Request completed: {} {} - {} ({:.2}ms)",
                method, path, status_code, elapsed_ms
            );
        }
    }
}

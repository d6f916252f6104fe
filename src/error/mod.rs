//! # Error Handling Module
//!
//! Error taxonomy for the proposal gateway. Every failure inside the request
//! pipeline is converted into exactly one [`ProposalError`] and from there into
//! exactly one HTTP error response.
//!
//! ## Security Considerations
//!
//! Client-facing messages are chosen so that they never disclose:
//! - which cryptographic check failed (tag, key length, nonce, encoding)
//! - whether a rejected credential was valid but under-privileged
//! - secrets, key material, tokens or decrypted payloads
//!
//! The internal message is for server-side logs only.

use thiserror::Error;

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, ProposalError>;

/// Boxed source error carried by the variants that wrap lower-level failures
pub type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Every failure the gateway can surface
///
/// ## Error Categories
///
/// - **Client errors**: validation, media type, payload size, method
/// - **Access errors**: authentication, authorization, rate limiting
/// - **Processing errors**: timeout, interruption, persistence
/// - **Operational errors**: configuration, server, internal
#[derive(Error, Debug)]
pub enum ProposalError {
    /// Malformed or missing input (400)
    #[error("Validation failed: {message}")]
    ValidationError {
        /// Client-safe description of what was wrong
        message: String,
    },

    /// Request body larger than the configured cap (413)
    #[error("Payload too large: {message}")]
    PayloadTooLarge {
        /// Internal detail (sizes involved)
        message: String,
    },

    /// Content type missing or not JSON (415)
    #[error("Unsupported media type: {message}")]
    UnsupportedMediaType {
        /// Internal detail
        message: String,
    },

    /// HTTP method not accepted by the route (405)
    #[error("Method not allowed: {method}")]
    MethodNotAllowed {
        /// The offending method
        method: String,
    },

    /// Unknown route (404)
    #[error("Not found: {path}")]
    NotFound {
        /// The requested path
        path: String,
    },

    /// Missing, non-bearer or empty credential (401)
    ///
    /// **Security**: the message is client-safe and shown verbatim
    #[error("Authentication failed: {message}")]
    AuthenticationError {
        /// Client-safe reason
        message: String,
    },

    /// Credential rejected, tier insufficient, or endpoint not available in
    /// the current mode (403)
    ///
    /// **Security**: the client always sees the same generic message
    #[error("Authorization denied: {reason}")]
    AuthorizationError {
        /// Internal reason, logged but never returned
        reason: String,
    },

    /// Rate limiter refused admission (429)
    #[error("Rate limited: {key}")]
    RateLimited {
        /// Limiter key that exhausted its window
        key: String,
    },

    /// Computation exceeded the processing deadline (504)
    #[error("Processing deadline exceeded after {deadline_ms}ms")]
    TimeoutError {
        /// The deadline that elapsed
        deadline_ms: u64,
    },

    /// Envelope decryption or encryption failed
    ///
    /// **Security**: surfaced like a validation failure with a single generic
    /// message regardless of which check failed
    #[error("Cryptographic operation failed: {message}")]
    CryptoError {
        /// Generic internal message
        message: String,
    },

    /// Computation was interrupted before it produced a result (500)
    #[error("Processing interrupted: {message}")]
    Interrupted {
        /// Internal detail
        message: String,
    },

    /// The persistence collaborator failed (500)
    #[error("Persistence failed: {message}")]
    PersistenceError {
        /// Internal message for logging
        message: String,
        /// Optional source error
        #[source]
        source: Option<BoxedSource>,
    },

    /// Configuration is invalid (startup only)
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Internal message for logging
        message: String,
        /// Optional source error
        #[source]
        source: Option<BoxedSource>,
    },

    /// HTTP server operation failed
    #[error("Server error: {message}")]
    ServerError {
        /// Internal message for logging
        message: String,
        /// Optional source error
        #[source]
        source: Option<BoxedSource>,
    },

    /// Unexpected internal failure
    #[error("Internal error: {message}")]
    InternalError {
        /// Internal message for logging
        message: String,
        /// Optional source error
        #[source]
        source: Option<BoxedSource>,
    },
}

impl ProposalError {
    /// Create a validation error whose message is safe to return to clients
    #[inline]
    pub fn validation_error<T: Into<String>>(message: T) -> Self {
        Self::ValidationError {
            message: message.into(),
        }
    }

    /// Create a payload-too-large error
    #[inline]
    pub fn payload_too_large<T: Into<String>>(message: T) -> Self {
        Self::PayloadTooLarge {
            message: message.into(),
        }
    }

    /// Create an unsupported-media-type error
    #[inline]
    pub fn unsupported_media_type<T: Into<String>>(message: T) -> Self {
        Self::UnsupportedMediaType {
            message: message.into(),
        }
    }

    /// Create a method-not-allowed error
    #[inline]
    pub fn method_not_allowed<T: Into<String>>(method: T) -> Self {
        Self::MethodNotAllowed {
            method: method.into(),
        }
    }

    /// Create a not-found error
    #[inline]
    pub fn not_found<T: Into<String>>(path: T) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// Create an authentication error with a client-safe message
    #[inline]
    pub fn authentication_error<T: Into<String>>(message: T) -> Self {
        Self::AuthenticationError {
            message: message.into(),
        }
    }

    /// Create an authorization error; the reason is only logged
    #[inline]
    pub fn authorization_error<T: Into<String>>(reason: T) -> Self {
        Self::AuthorizationError {
            reason: reason.into(),
        }
    }

    /// Create a rate-limited error for the given limiter key
    #[inline]
    pub fn rate_limited<T: Into<String>>(key: T) -> Self {
        Self::RateLimited { key: key.into() }
    }

    /// Create a timeout error
    #[inline]
    pub fn timeout_error(deadline_ms: u64) -> Self {
        Self::TimeoutError { deadline_ms }
    }

    /// Create a crypto error
    #[inline]
    pub fn crypto_error<T: Into<String>>(message: T) -> Self {
        Self::CryptoError {
            message: message.into(),
        }
    }

    /// Create an interrupted-processing error
    #[inline]
    pub fn interrupted<T: Into<String>>(message: T) -> Self {
        Self::Interrupted {
            message: message.into(),
        }
    }

    /// Create a persistence error with optional source
    #[inline]
    pub fn persistence_error<T: Into<String>>(message: T, source: Option<BoxedSource>) -> Self {
        Self::PersistenceError {
            message: message.into(),
            source,
        }
    }

    /// Create a configuration error with optional source
    #[inline]
    pub fn config_error<T: Into<String>>(message: T, source: Option<BoxedSource>) -> Self {
        Self::ConfigError {
            message: message.into(),
            source,
        }
    }

    /// Create a server error with optional source
    #[inline]
    pub fn server_error<T: Into<String>>(message: T, source: Option<BoxedSource>) -> Self {
        Self::ServerError {
            message: message.into(),
            source,
        }
    }

    /// Create an internal error with optional source
    #[inline]
    pub fn internal_error<T: Into<String>>(message: T, source: Option<BoxedSource>) -> Self {
        Self::InternalError {
            message: message.into(),
            source,
        }
    }

    /// HTTP status code for this error
    ///
    /// Crypto failures map to 400 so that a bad envelope is indistinguishable
    /// from any other malformed body.
    #[inline]
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::ValidationError { .. } | Self::CryptoError { .. } => 400,
            Self::AuthenticationError { .. } => 401,
            Self::AuthorizationError { .. } => 403,
            Self::NotFound { .. } => 404,
            Self::MethodNotAllowed { .. } => 405,
            Self::PayloadTooLarge { .. } => 413,
            Self::UnsupportedMediaType { .. } => 415,
            Self::RateLimited { .. } => 429,
            Self::TimeoutError { .. } => 504,
            Self::Interrupted { .. }
            | Self::PersistenceError { .. }
            | Self::ConfigError { .. }
            | Self::ServerError { .. }
            | Self::InternalError { .. } => 500,
        }
    }

    /// Message returned to the client
    ///
    /// Validation and authentication messages are composed from client-safe
    /// text at construction. Everything else is a fixed string.
    #[inline]
    #[must_use]
    pub fn client_message(&self) -> &str {
        match self {
            Self::ValidationError { message } | Self::AuthenticationError { message } => message,
            Self::PayloadTooLarge { .. } => "payload exceeds the allowed size",
            Self::UnsupportedMediaType { .. } => "content type must be application/json",
            Self::MethodNotAllowed { .. } => "method not allowed",
            Self::NotFound { .. } => "not found",
            Self::AuthorizationError { .. } => "access denied",
            Self::RateLimited { .. } => "too many requests",
            Self::TimeoutError { .. } => "processing deadline exceeded",
            Self::CryptoError { .. } => "invalid encrypted payload",
            Self::Interrupted { .. } => "processing interrupted",
            Self::PersistenceError { .. } => "failed to persist proposal",
            Self::ConfigError { .. } => "service unavailable",
            Self::ServerError { .. } | Self::InternalError { .. } => "internal server error",
        }
    }

    /// Detailed message for server-side logging only
    #[inline]
    #[must_use]
    pub fn internal_message(&self) -> String {
        match self {
            Self::ValidationError { message }
            | Self::PayloadTooLarge { message }
            | Self::UnsupportedMediaType { message }
            | Self::AuthenticationError { message }
            | Self::CryptoError { message }
            | Self::Interrupted { message }
            | Self::PersistenceError { message, .. }
            | Self::ConfigError { message, .. }
            | Self::ServerError { message, .. }
            | Self::InternalError { message, .. } => message.clone(),
            Self::MethodNotAllowed { method } => format!("method {method} not allowed"),
            Self::NotFound { path } => format!("no route for {path}"),
            Self::AuthorizationError { reason } => reason.clone(),
            Self::RateLimited { key } => format!("rate limit exhausted for {key}"),
            Self::TimeoutError { deadline_ms } => format!("deadline of {deadline_ms}ms elapsed"),
        }
    }

    /// Whether this error should be logged at ERROR rather than WARN
    ///
    /// Client-caused failures are expected traffic; only server-side failures
    /// are critical.
    #[inline]
    #[must_use]
    pub fn is_critical(&self) -> bool {
        self.status_code() >= 500
    }
}

impl From<std::io::Error> for ProposalError {
    #[inline]
    fn from(err: std::io::Error) -> Self {
        Self::server_error(format!("I/O error: {err}"), Some(Box::new(err)))
    }
}

impl From<serde_json::Error> for ProposalError {
    #[inline]
    fn from(err: serde_json::Error) -> Self {
        Self::validation_error(format!("malformed JSON: {err}"))
    }
}

impl From<hyper::Error> for ProposalError {
    #[inline]
    fn from(err: hyper::Error) -> Self {
        Self::server_error(format!("Hyper error: {err}"), Some(Box::new(err)))
    }
}

impl From<http::Error> for ProposalError {
    #[inline]
    fn from(err: http::Error) -> Self {
        Self::server_error(format!("HTTP error: {err}"), Some(Box::new(err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_follow_taxonomy() {
        assert_eq!(ProposalError::validation_error("x").status_code(), 400);
        assert_eq!(ProposalError::crypto_error("x").status_code(), 400);
        assert_eq!(ProposalError::authentication_error("x").status_code(), 401);
        assert_eq!(ProposalError::authorization_error("x").status_code(), 403);
        assert_eq!(ProposalError::not_found("/x").status_code(), 404);
        assert_eq!(ProposalError::method_not_allowed("GET").status_code(), 405);
        assert_eq!(ProposalError::payload_too_large("x").status_code(), 413);
        assert_eq!(ProposalError::unsupported_media_type("x").status_code(), 415);
        assert_eq!(ProposalError::rate_limited("k").status_code(), 429);
        assert_eq!(ProposalError::timeout_error(10).status_code(), 504);
        assert_eq!(ProposalError::interrupted("x").status_code(), 500);
        assert_eq!(ProposalError::persistence_error("x", None).status_code(), 500);
        assert_eq!(ProposalError::internal_error("x", None).status_code(), 500);
    }

    #[test]
    fn test_authorization_reason_is_not_returned() {
        let err = ProposalError::authorization_error("insufficient tier: STARTER < VIP");
        assert_eq!(err.client_message(), "access denied");
        assert!(err.internal_message().contains("STARTER"));
    }

    #[test]
    fn test_client_messages_are_generic() {
        let messages = vec![
            ProposalError::crypto_error("aes tag mismatch with key 0xdeadbeef").client_message().to_string(),
            ProposalError::persistence_error("database password rejected", None)
                .client_message()
                .to_string(),
            ProposalError::config_error("secret missing", None).client_message().to_string(),
            ProposalError::internal_error("stack trace info", None)
                .client_message()
                .to_string(),
        ];

        for message in messages {
            assert!(!message.contains("key"));
            assert!(!message.contains("password"));
            assert!(!message.contains("secret"));
            assert!(!message.contains("trace"));
        }
    }

    #[test]
    fn test_criticality_classification() {
        assert!(!ProposalError::validation_error("x").is_critical());
        assert!(!ProposalError::rate_limited("k").is_critical());
        assert!(ProposalError::timeout_error(5).is_critical());
        assert!(ProposalError::persistence_error("x", None).is_critical());
        assert!(ProposalError::server_error("x", None).is_critical());
    }

    #[test]
    fn test_from_conversions() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ProposalError = io_err.into();
        assert_eq!(err.status_code(), 500);

        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: ProposalError = json_err.into();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_error_chain() {
        use std::error::Error;

        let inner = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let outer = ProposalError::persistence_error("store unavailable", Some(Box::new(inner)));
        assert!(outer.source().is_some());
        assert!(format!("{outer}").contains("Persistence failed"));
    }
}

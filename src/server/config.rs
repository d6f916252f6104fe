//! # Server Configuration Module
//!
//! All runtime settings for the proposal gateway, read from command-line
//! flags with environment-variable fallbacks (or from the environment alone
//! via [`ServerConfig::from_env`]).
//!
//! ## Configuration Sources
//!
//! In order of precedence:
//! 1. Command-line arguments
//! 2. Environment variables
//! 3. Default values
//!
//! ## Security Considerations
//!
//! - The HMAC secret and AES key are wrapped in [`SecretValue`], which is
//!   redacted from `Debug` output and never serialised
//! - TLS material paths are checked for existence at startup
//! - Every problem found by [`ServerConfig::validate`] is fatal

use crate::crypto::{SymmetricKey, TokenPolicy};
use crate::error::{ProposalError, Result};
use clap::{builder::BoolishValueParser, ArgAction, Parser};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{metadata::ParseLevelError, Level};

/// Wrapper for `tracing::Level` so the log level can be parsed and serialised
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogLevel(Level);

impl LogLevel {
    /// Returns the inner `tracing::Level` value.
    #[must_use]
    pub fn inner(&self) -> Level {
        self.0
    }
}

impl From<Level> for LogLevel {
    fn from(level: Level) -> Self {
        Self(level)
    }
}

impl From<LogLevel> for Level {
    fn from(log_level: LogLevel) -> Self {
        log_level.0
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl Serialize for LogLevel {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Self(s.parse().map_err(serde::de::Error::custom)?))
    }
}

/// A configuration string that must never be printed
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The secret itself; callers must not log it
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::str::FromStr for SecretValue {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Proposal gateway configuration
///
/// ## Performance Settings
/// - `http_threads` sizes the runtime accepting connections
/// - `compute_threads` sizes the separate computation pool
///
/// ## Security Settings
/// - `jwt_secret` is mandatory; `aes_key` is mandatory in secure mode
/// - TLS is enabled when both a certificate chain and a key are given
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[command(
    name = "proposal-gate",
    about = "Authenticated, rate-limited fee proposal calculator",
    version,
    long_about = None
)]
pub struct ServerConfig {
    /// Network address to bind the server to
    ///
    /// ## Security
    /// Binding to 0.0.0.0 exposes the server on every interface.
    #[arg(
        short = 'b',
        long = "bind",
        value_name = "ADDRESS:PORT",
        default_value = "0.0.0.0:8080",
        env = "PROPOSAL_GATE_BIND_ADDR",
        help = "Network address to bind the server to"
    )]
    pub bind_addr: SocketAddr,

    /// Logging level (error, warn, info, debug, trace)
    #[arg(
        short = 'l',
        long = "log-level",
        value_name = "LEVEL",
        default_value = "info",
        env = "LOG_LEVEL",
        help = "Logging level (error, warn, info, debug, trace)"
    )]
    pub log_level: LogLevel,

    /// Maximum request body size in bytes
    ///
    /// Larger bodies are refused with 413, before parsing when the client
    /// declares a `Content-Length`.
    #[arg(
        short = 'm',
        long = "max-body-bytes",
        value_name = "BYTES",
        default_value_t = crate::MAX_BODY_BYTES,
        env = "MAX_BODY_BYTES",
        help = "Maximum request body size in bytes"
    )]
    pub max_body_bytes: usize,

    /// Processing deadline in milliseconds
    ///
    /// A computation not finished within this time is answered with 504.
    #[arg(
        short = 't',
        long = "request-timeout",
        value_name = "MILLISECONDS",
        default_value_t = crate::REQUEST_TIMEOUT_MS,
        env = "REQUEST_TIMEOUT_MS",
        help = "Processing deadline in milliseconds"
    )]
    pub request_timeout_ms: u64,

    #[arg(
        long = "http-threads",
        value_name = "COUNT",
        env = "HTTP_THREADS",
        help = "Worker threads accepting connections (default: max(4, CPU cores))"
    )]
    pub http_threads: Option<usize>,

    #[arg(
        long = "compute-threads",
        value_name = "COUNT",
        env = "COMPUTE_THREADS",
        help = "Worker threads running computations (default: max(2, CPU cores))"
    )]
    pub compute_threads: Option<usize>,

    /// Artificial latency added to every computation, for load testing
    #[arg(
        long = "simulated-delay",
        value_name = "MILLISECONDS",
        default_value_t = 0,
        env = "SIMULATED_DELAY_MS",
        help = "Artificial computation delay in milliseconds (0 disables)"
    )]
    pub simulated_delay_ms: u64,

    /// Requests admitted per client per window; zero or below disables limiting
    #[arg(
        long = "rate-limit",
        value_name = "COUNT",
        default_value_t = crate::DEFAULT_RATE_LIMIT,
        env = "RATE_LIMIT_MAX",
        allow_negative_numbers = true,
        help = "Requests per client per window (<= 0 disables)"
    )]
    pub rate_limit_max: i64,

    #[arg(
        long = "rate-window",
        value_name = "MILLISECONDS",
        default_value_t = crate::DEFAULT_RATE_WINDOW_MS,
        env = "RATE_LIMIT_WINDOW_MS",
        help = "Rate limit window in milliseconds"
    )]
    pub rate_limit_window_ms: u64,

    /// Serve the encrypted endpoint and lock the plaintext one
    #[arg(long = "secure-mode", env = "SECURE_MODE", help = "Enable secure mode")]
    pub secure_mode: bool,

    #[arg(
        long = "allow-plain",
        env = "ALLOW_PLAIN",
        help = "Keep the plaintext endpoint open in secure mode"
    )]
    pub allow_plain: bool,

    /// AES key, standard base64 of 16, 24 or 32 bytes
    #[arg(
        long = "aes-key",
        value_name = "BASE64",
        env = "AES_KEY",
        hide_env_values = true,
        help = "AES-GCM key as base64 (16, 24 or 32 bytes)"
    )]
    #[serde(skip_serializing, default)]
    pub aes_key: Option<SecretValue>,

    /// Shared HMAC secret for bearer tokens
    #[arg(
        long = "jwt-secret",
        value_name = "SECRET",
        env = "JWT_SECRET",
        hide_env_values = true,
        help = "Shared HMAC-SHA256 secret for bearer tokens"
    )]
    #[serde(skip_serializing, default)]
    pub jwt_secret: Option<SecretValue>,

    #[arg(long = "jwt-issuer", value_name = "ISSUER", env = "JWT_ISSUER")]
    pub jwt_issuer: Option<String>,

    #[arg(long = "jwt-audience", value_name = "AUDIENCE", env = "JWT_AUDIENCE")]
    pub jwt_audience: Option<String>,

    #[arg(
        long = "jwt-require-exp",
        value_name = "BOOL",
        env = "JWT_REQUIRE_EXP",
        action = ArgAction::Set,
        default_value_t = true,
        value_parser = BoolishValueParser::new(),
        help = "Reject tokens without an expiry claim"
    )]
    pub jwt_require_exp: bool,

    #[arg(
        long = "jwt-clock-skew",
        value_name = "SECONDS",
        env = "JWT_CLOCK_SKEW",
        default_value_t = crate::crypto::token::DEFAULT_CLOCK_SKEW_SECS,
        help = "Tolerance applied to token expiry in seconds"
    )]
    pub jwt_clock_skew_secs: i64,

    /// Expose request statistics at /metrics (loopback clients only)
    #[arg(
        long = "enable-metrics",
        value_name = "BOOL",
        env = "ENABLE_METRICS",
        action = ArgAction::Set,
        default_value_t = true,
        value_parser = BoolishValueParser::new(),
        help = "Enable the metrics endpoint"
    )]
    pub enable_metrics: bool,

    #[arg(
        long = "enable-health-check",
        value_name = "BOOL",
        env = "ENABLE_HEALTH_CHECK",
        action = ArgAction::Set,
        default_value_t = true,
        value_parser = BoolishValueParser::new(),
        help = "Enable the health check endpoint"
    )]
    pub enable_health_check: bool,

    #[arg(long = "tls-cert", value_name = "PATH", env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<PathBuf>,

    #[arg(long = "tls-key", value_name = "PATH", env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<PathBuf>,

    /// CA bundle used to verify client certificates
    #[arg(long = "tls-client-ca", value_name = "PATH", env = "TLS_CLIENT_CA_PATH")]
    pub tls_client_ca_path: Option<PathBuf>,

    #[arg(
        long = "tls-require-client-auth",
        env = "TLS_REQUIRE_CLIENT_AUTH",
        help = "Require a verified client certificate"
    )]
    pub tls_require_client_auth: bool,
}

impl ServerConfig {
    /// Create a new configuration with default values
    ///
    /// The default has no HMAC secret and therefore does not validate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from command-line arguments and the environment
    #[must_use]
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Load configuration from environment variables only
    ///
    /// Unset variables keep their defaults.
    ///
    /// ## Errors
    /// - `ProposalError::ConfigError`: a variable is set but unparseable
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(bind_addr) = env_parse("PROPOSAL_GATE_BIND_ADDR")? {
            config.bind_addr = bind_addr;
        }
        if let Some(log_level) = env_parse("LOG_LEVEL")? {
            config.log_level = log_level;
        }
        if let Some(max_body) = env_parse("MAX_BODY_BYTES")? {
            config.max_body_bytes = max_body;
        }
        if let Some(timeout) = env_parse("REQUEST_TIMEOUT_MS")? {
            config.request_timeout_ms = timeout;
        }
        config.http_threads = env_parse("HTTP_THREADS")?.or(config.http_threads);
        config.compute_threads = env_parse("COMPUTE_THREADS")?.or(config.compute_threads);
        if let Some(delay) = env_parse("SIMULATED_DELAY_MS")? {
            config.simulated_delay_ms = delay;
        }
        if let Some(limit) = env_parse("RATE_LIMIT_MAX")? {
            config.rate_limit_max = limit;
        }
        if let Some(window) = env_parse("RATE_LIMIT_WINDOW_MS")? {
            config.rate_limit_window_ms = window;
        }
        if let Some(secure) = env_bool("SECURE_MODE")? {
            config.secure_mode = secure;
        }
        if let Some(allow_plain) = env_bool("ALLOW_PLAIN")? {
            config.allow_plain = allow_plain;
        }
        config.aes_key = env_string("AES_KEY").map(SecretValue::new).or(config.aes_key);
        config.jwt_secret = env_string("JWT_SECRET")
            .map(SecretValue::new)
            .or(config.jwt_secret);
        config.jwt_issuer = env_string("JWT_ISSUER").or(config.jwt_issuer);
        config.jwt_audience = env_string("JWT_AUDIENCE").or(config.jwt_audience);
        if let Some(require_exp) = env_bool("JWT_REQUIRE_EXP")? {
            config.jwt_require_exp = require_exp;
        }
        if let Some(skew) = env_parse("JWT_CLOCK_SKEW")? {
            config.jwt_clock_skew_secs = skew;
        }
        if let Some(metrics) = env_bool("ENABLE_METRICS")? {
            config.enable_metrics = metrics;
        }
        if let Some(health) = env_bool("ENABLE_HEALTH_CHECK")? {
            config.enable_health_check = health;
        }
        config.tls_cert_path = env_string("TLS_CERT_PATH")
            .map(PathBuf::from)
            .or(config.tls_cert_path);
        config.tls_key_path = env_string("TLS_KEY_PATH")
            .map(PathBuf::from)
            .or(config.tls_key_path);
        config.tls_client_ca_path = env_string("TLS_CLIENT_CA_PATH")
            .map(PathBuf::from)
            .or(config.tls_client_ca_path);
        if let Some(require_client_auth) = env_bool("TLS_REQUIRE_CLIENT_AUTH")? {
            config.tls_require_client_auth = require_client_auth;
        }

        Ok(config)
    }

    /// Validate the configuration for consistency and security
    ///
    /// ## Errors
    /// - `ProposalError::ConfigError`: on the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.bind_addr.ip().is_unspecified() {
            tracing::warn!(
                "Binding to wildcard address {} - ensure this is secure for your environment",
                self.bind_addr
            );
        }

        match &self.jwt_secret {
            Some(secret) if !secret.is_blank() => {}
            _ => return Err(config_error("JWT secret is required")),
        }

        if self.max_body_bytes == 0 {
            return Err(config_error("Maximum body size cannot be zero"));
        }
        if self.request_timeout_ms == 0 {
            return Err(config_error("Request timeout cannot be zero"));
        }
        if self.http_threads == Some(0) {
            return Err(config_error("HTTP thread count cannot be zero"));
        }
        if self.compute_threads == Some(0) {
            return Err(config_error("Compute thread count cannot be zero"));
        }
        if self.simulated_delay() > crate::engine::MAX_SIMULATED_DELAY {
            return Err(config_error(format!(
                "Simulated delay cannot exceed {}ms",
                crate::engine::MAX_SIMULATED_DELAY.as_millis()
            )));
        }
        if self.rate_limit_max > 0 && self.rate_limit_window_ms == 0 {
            return Err(config_error("Rate limit window cannot be zero"));
        }

        let key = self.symmetric_key()?;
        if self.secure_mode && key.is_none() {
            return Err(config_error("Secure mode requires an AES key"));
        }

        self.validate_tls()?;

        if self.max_body_bytes > 16 * 1024 * 1024 {
            tracing::warn!(
                "Very large maximum body size: {} bytes",
                self.max_body_bytes
            );
        }

        Ok(())
    }

    fn validate_tls(&self) -> Result<()> {
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(cert), Some(key)) => {
                require_file(cert, "TLS certificate")?;
                require_file(key, "TLS private key")?;
            }
            (None, None) => {}
            _ => {
                return Err(config_error(
                    "TLS certificate and key must be configured together",
                ))
            }
        }

        if let Some(ca) = &self.tls_client_ca_path {
            require_file(ca, "TLS client CA")?;
        }
        if self.tls_require_client_auth {
            if !self.tls_enabled() {
                return Err(config_error("Client authentication requires TLS"));
            }
            if self.tls_client_ca_path.is_none() {
                return Err(config_error("Client authentication requires a client CA"));
            }
        }
        Ok(())
    }

    /// Number of threads accepting connections
    #[must_use]
    pub fn get_http_threads(&self) -> usize {
        self.http_threads
            .unwrap_or_else(|| available_cores().max(4).min(16))
    }

    /// Number of threads running computations
    #[must_use]
    pub fn get_compute_threads(&self) -> usize {
        self.compute_threads
            .unwrap_or_else(|| available_cores().max(2).min(16))
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub fn simulated_delay(&self) -> Duration {
        Duration::from_millis(self.simulated_delay_ms)
    }

    #[must_use]
    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }

    /// Whether the listener terminates TLS
    #[must_use]
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert_path.is_some() && self.tls_key_path.is_some()
    }

    /// Token verification settings derived from the `jwt_*` fields
    ///
    /// ## Errors
    /// - `ProposalError::ConfigError`: no secret configured
    pub fn token_policy(&self) -> Result<TokenPolicy> {
        let secret = self
            .jwt_secret
            .as_ref()
            .filter(|secret| !secret.is_blank())
            .ok_or_else(|| config_error("JWT secret is required"))?;
        Ok(TokenPolicy::new(secret.expose())
            .with_issuer(self.jwt_issuer.clone())
            .with_audience(self.jwt_audience.clone())
            .with_require_expiry(self.jwt_require_exp)
            .with_clock_skew(self.jwt_clock_skew_secs))
    }

    /// Decoded AES key, if one is configured
    ///
    /// ## Errors
    /// - `ProposalError::ConfigError`: not base64, or not 16, 24 or 32 bytes
    pub fn symmetric_key(&self) -> Result<Option<SymmetricKey>> {
        match &self.aes_key {
            Some(encoded) if !encoded.is_blank() => {
                SymmetricKey::from_base64(encoded.expose()).map(Some)
            }
            _ => Ok(None),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, crate::DEFAULT_PORT)),
            log_level: LogLevel::from(Level::INFO),
            max_body_bytes: crate::MAX_BODY_BYTES,
            request_timeout_ms: crate::REQUEST_TIMEOUT_MS,
            http_threads: None,
            compute_threads: None,
            simulated_delay_ms: 0,
            rate_limit_max: crate::DEFAULT_RATE_LIMIT,
            rate_limit_window_ms: crate::DEFAULT_RATE_WINDOW_MS,
            secure_mode: false,
            allow_plain: false,
            aes_key: None,
            jwt_secret: None,
            jwt_issuer: None,
            jwt_audience: None,
            jwt_require_exp: true,
            jwt_clock_skew_secs: crate::crypto::token::DEFAULT_CLOCK_SKEW_SECS,
            enable_metrics: true,
            enable_health_check: true,
            tls_cert_path: None,
            tls_key_path: None,
            tls_client_ca_path: None,
            tls_require_client_auth: false,
        }
    }
}

fn config_error(message: impl Into<String>) -> ProposalError {
    ProposalError::config_error(message, None)
}

fn require_file(path: &Path, what: &str) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(config_error(format!(
            "{what} file does not exist: {}",
            path.display()
        )))
    }
}

fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = env_string(name) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|e| config_error(format!("Invalid value for {name} '{raw}': {e}")))
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    let Some(raw) = env_string(name) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(Some(true)),
        "false" | "0" | "no" | "off" => Ok(Some(false)),
        _ => Err(config_error(format!("Invalid boolean for {name} '{raw}'"))),
    }
}

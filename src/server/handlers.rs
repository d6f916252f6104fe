//! # Request Handlers Module
//!
//! The calculation handler runs one request through the whole pipeline:
//!
//! ```text
//! method -> rate limit -> endpoint mode -> content type -> bearer header
//!   -> body size -> body read -> (decrypt) -> fields -> token
//!   -> compute (deadline) -> persist -> (encrypt) -> 200
//! ```
//!
//! Any step may fail; the failure becomes exactly one JSON error response.
//! Every request that reaches the handler records one metrics sample,
//! whatever its outcome.
//!
//! ## Security
//!
//! - The bearer token, the key and decrypted bodies are never logged
//! - Invalid credentials and insufficient tiers are logged differently but
//!   both answer 403 with the same body
//! - Envelope failures answer 400 with one generic message

use super::middleware::RequestMiddleware;
use super::responses::{error_response, json_response};
use super::ServerConfig;
use crate::crypto::{Envelope, PayloadCipher, TokenVerifier, Verdict};
use crate::engine::{ComputeEngine, ProposalRequest};
use crate::error::{BoxedSource, ProposalError, Result};
use crate::limiter::RateLimiter;
use crate::metrics::MetricsRegistry;
use crate::store::{ProposalRecord, ProposalStore};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

const BEARER_PREFIX: &str = "Bearer ";

/// Which calculation route a request arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// `/api/calcular`, plaintext JSON bodies
    Plain,
    /// `/api/calcular-secure`, AES-GCM envelope bodies
    Secure,
}

/// Per-request limits and mode switches
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub max_body_bytes: usize,
    pub request_timeout: Duration,
    pub secure_mode: bool,
    pub allow_plain: bool,
}

impl HandlerSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            max_body_bytes: config.max_body_bytes,
            request_timeout: config.request_timeout(),
            secure_mode: config.secure_mode,
            allow_plain: config.allow_plain,
        }
    }
}

/// Handler for both calculation endpoints
pub struct CalculateHandler {
    verifier: TokenVerifier,
    cipher: Option<PayloadCipher>,
    limiter: RateLimiter,
    engine: Arc<ComputeEngine>,
    store: Arc<dyn ProposalStore>,
    metrics: Arc<MetricsRegistry>,
    settings: HandlerSettings,
}

impl CalculateHandler {
    /// Wire the handler from configuration and shared collaborators
    ///
    /// ## Errors
    /// - `ProposalError::ConfigError`: missing secret or invalid AES key
    pub fn from_config(
        config: &ServerConfig,
        engine: Arc<ComputeEngine>,
        store: Arc<dyn ProposalStore>,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self> {
        let verifier = TokenVerifier::new(config.token_policy()?);
        let cipher = config.symmetric_key()?.map(PayloadCipher::new);
        if config.secure_mode && cipher.is_none() {
            return Err(ProposalError::config_error(
                "Secure mode requires an AES key",
                None,
            ));
        }
        let limiter = RateLimiter::new(config.rate_limit_max, config.rate_window());
        if limiter.is_enabled() {
            debug!(
                max_requests = limiter.max_requests(),
                window_ms = u64::try_from(limiter.window().as_millis()).unwrap_or(u64::MAX),
                "Rate limiting enabled"
            );
        } else {
            debug!("Rate limiting disabled");
        }

        Ok(Self {
            verifier,
            cipher,
            limiter,
            engine,
            store,
            metrics,
            settings: HandlerSettings::from_config(config),
        })
    }

    pub fn settings(&self) -> &HandlerSettings {
        &self.settings
    }

    /// Handle a calculation request and always produce a response
    #[instrument(level = "debug", name = "calculate_handler", skip(self, request))]
    pub async fn handle<B>(
        &self,
        request: Request<B>,
        remote_addr: SocketAddr,
        endpoint: Endpoint,
    ) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxedSource>,
    {
        let middleware = RequestMiddleware::start(request.headers());
        let method = request.method().clone();
        let path = request.uri().path().to_string();

        let response = match self
            .process(request, remote_addr, endpoint, middleware.request_id())
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if e.is_critical() {
                    error!(
                        request_id = %middleware.request_id(),
                        peer = %remote_addr,
                        "Request failed: {}",
                        e.internal_message()
                    );
                } else {
                    warn!(
                        request_id = %middleware.request_id(),
                        peer = %remote_addr,
                        "Request rejected: {}",
                        e.internal_message()
                    );
                }
                error_response(&e, middleware.request_id())
            }
        };

        self.metrics
            .record(response.status().is_success(), middleware.elapsed_ms());
        middleware.log_completion(response.status().as_u16(), &path, method.as_str());
        response
    }

    async fn process<B>(
        &self,
        request: Request<B>,
        remote_addr: SocketAddr,
        endpoint: Endpoint,
        request_id: &str,
    ) -> Result<Response<Full<Bytes>>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxedSource>,
    {
        if request.method() != Method::POST {
            return Err(ProposalError::method_not_allowed(request.method().as_str()));
        }

        let client_key = remote_addr.ip().to_string();
        if !self.limiter.try_acquire(&client_key) {
            return Err(ProposalError::rate_limited(client_key));
        }

        self.check_endpoint_mode(endpoint)?;
        check_content_type(request.headers())?;
        let token = bearer_token(request.headers())?.to_string();
        self.check_declared_length(request.headers())?;

        let body = self.read_body(request.into_body()).await?;
        let plaintext = match endpoint {
            Endpoint::Plain => body,
            Endpoint::Secure => self.open_envelope(&body)?,
        };
        let proposal = ProposalRequest::from_json(&plaintext)?;

        if let Verdict::Denied(denial) = self.verifier.verify(&token, proposal.plan.as_str()) {
            if denial.is_credential_failure() {
                warn!(request_id = %request_id, reason = %denial, "Invalid credential");
            } else {
                warn!(
                    request_id = %request_id,
                    required = %proposal.plan,
                    "Insufficient tier for requested plan"
                );
            }
            return Err(ProposalError::authorization_error(denial.to_string()));
        }

        let pending = self.engine.compute_async(proposal.clone(), request_id);
        let result = match tokio::time::timeout(self.settings.request_timeout, pending).await {
            Ok(outcome) => outcome?,
            Err(_) => {
                // the computation keeps running on the compute pool; its result is dropped
                return Err(ProposalError::timeout_error(
                    u64::try_from(self.settings.request_timeout.as_millis()).unwrap_or(u64::MAX),
                ));
            }
        };

        self.store.save(&ProposalRecord::new(&proposal, &result))?;
        debug!(
            request_id = %request_id,
            proposal_id = %result.proposal_id,
            plan = %proposal.plan,
            "Proposal computed and stored"
        );

        let json = result.to_json()?;
        let body = match endpoint {
            Endpoint::Plain => json,
            Endpoint::Secure => self.cipher()?.encrypt(json.as_bytes())?.to_json()?,
        };
        Ok(json_response(StatusCode::OK, body, request_id))
    }

    fn check_endpoint_mode(&self, endpoint: Endpoint) -> Result<()> {
        match endpoint {
            Endpoint::Plain if self.settings.secure_mode && !self.settings.allow_plain => Err(
                ProposalError::authorization_error("plaintext endpoint disabled in secure mode"),
            ),
            Endpoint::Secure if !self.settings.secure_mode => Err(
                ProposalError::authorization_error("secure endpoint requires secure mode"),
            ),
            _ => Ok(()),
        }
    }

    fn check_declared_length(&self, headers: &HeaderMap) -> Result<()> {
        let Some(value) = headers.get(CONTENT_LENGTH) else {
            return Ok(());
        };
        let declared: usize = value
            .to_str()
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
            .ok_or_else(|| ProposalError::validation_error("invalid Content-Length"))?;
        if declared > self.settings.max_body_bytes {
            return Err(ProposalError::payload_too_large(format!(
                "declared {declared} bytes, limit {}",
                self.settings.max_body_bytes
            )));
        }
        Ok(())
    }

    async fn read_body<B>(&self, body: B) -> Result<String>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxedSource>,
    {
        let limit = self.settings.max_body_bytes;
        let bytes = Limited::new(body, limit)
            .collect()
            .await
            .map_err(|e| {
                if e.downcast_ref::<LengthLimitError>().is_some() {
                    ProposalError::payload_too_large(format!("body exceeds {limit} bytes"))
                } else {
                    ProposalError::validation_error("failed to read request body")
                }
            })?
            .to_bytes();

        let text = String::from_utf8(bytes.to_vec())
            .map_err(|_| ProposalError::validation_error("body must be UTF-8"))?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ProposalError::validation_error("empty body"));
        }
        Ok(trimmed.to_string())
    }

    fn open_envelope(&self, body: &str) -> Result<String> {
        let envelope = Envelope::from_json(body)?;
        let plaintext = self.cipher()?.decrypt(&envelope)?;
        String::from_utf8(plaintext).map_err(|_| ProposalError::crypto_error("decryption failed"))
    }

    fn cipher(&self) -> Result<&PayloadCipher> {
        self.cipher
            .as_ref()
            .ok_or_else(|| ProposalError::internal_error("no AES key configured", None))
    }
}

impl std::fmt::Debug for CalculateHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalculateHandler")
            .field("verifier", &self.verifier)
            .field("cipher", &self.cipher)
            .field("limiter", &self.limiter)
            .field("engine", &self.engine)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn check_content_type(headers: &HeaderMap) -> Result<()> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if content_type.contains("application/json") || content_type.contains("+json") {
        Ok(())
    } else {
        Err(ProposalError::unsupported_media_type(format!(
            "content type '{content_type}'"
        )))
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<&str> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix(BEARER_PREFIX))
        .ok_or_else(|| ProposalError::authentication_error("authorization required"))?
        .trim();
    if token.is_empty() {
        return Err(ProposalError::authentication_error("empty bearer token"));
    }
    Ok(token)
}

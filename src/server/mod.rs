//! # Proposal Gateway Server Module
//!
//! Hyper-based HTTP/1.1 server routing the calculation, health and metrics
//! endpoints. Connections are accepted on the caller's runtime (the I/O
//! pool); computations run on the engine's own runtime.
//!
//! ## Routes
//!
//! | Path | Method | Notes |
//! |---|---|---|
//! | `/api/calcular` | POST | plaintext JSON |
//! | `/api/calcular-secure` | POST | AES-GCM envelope, secure mode only |
//! | `/health` | GET | no auth |
//! | `/metrics` | GET | loopback peers only |

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod responses;
pub mod tls;

// Re-export commonly used types
pub use config::ServerConfig;
pub use handlers::{CalculateHandler, Endpoint};

use crate::engine::ComputeEngine;
use crate::error::{BoxedSource, ProposalError, Result};
use crate::metrics::MetricsRegistry;
use crate::store::{InMemoryProposalStore, ProposalStore};
use http_body_util::Full;
use hyper::body::{Body, Bytes};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use middleware::resolve_request_id;
use responses::{error_response, json_response, timestamp_now};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, instrument, warn};

/// Path of the plaintext calculation endpoint
pub const CALCULATE_PATH: &str = "/api/calcular";
/// Path of the encrypted calculation endpoint
pub const CALCULATE_SECURE_PATH: &str = "/api/calcular-secure";
pub const HEALTH_PATH: &str = "/health";
pub const METRICS_PATH: &str = "/metrics";

/// Main server instance owning every shared component
pub struct ProposalServer {
    config: ServerConfig,
    calculate_handler: CalculateHandler,
    metrics: Arc<MetricsRegistry>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl ProposalServer {
    /// Build a server with the in-memory proposal store
    ///
    /// ## Errors
    /// - `ProposalError::ConfigError`: invalid configuration or TLS material
    pub fn new(config: ServerConfig) -> Result<Self> {
        Self::with_store(config, Arc::new(InMemoryProposalStore::new()))
    }

    /// Build a server persisting proposals through `store`
    ///
    /// ## Errors
    /// - `ProposalError::ConfigError`: invalid configuration or TLS material
    #[instrument(level = "info", name = "server_new", skip(store))]
    pub fn with_store(config: ServerConfig, store: Arc<dyn ProposalStore>) -> Result<Self> {
        config.validate()?;

        let engine = Arc::new(ComputeEngine::new(
            config.get_compute_threads(),
            config.simulated_delay(),
        )?);
        let compute_threads = engine.threads();
        let simulated_delay_ms = u64::try_from(engine.simulated_delay().as_millis()).unwrap_or(u64::MAX);
        let metrics = Arc::new(MetricsRegistry::new());
        let calculate_handler =
            CalculateHandler::from_config(&config, engine, store, Arc::clone(&metrics))?;
        let tls_acceptor = tls::build_acceptor(&config)?;

        info!(
            secure_mode = config.secure_mode,
            allow_plain = config.allow_plain,
            rate_limit = config.rate_limit_max,
            compute_threads,
            simulated_delay_ms,
            "Proposal server initialized"
        );

        Ok(Self {
            config,
            calculate_handler,
            metrics,
            tls_acceptor,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Bind the listener and serve connections until the task is dropped
    ///
    /// ## Errors
    /// - `ProposalError::ServerError`: bind or accept failure
    #[instrument(level = "info", name = "server_start", skip(self))]
    pub async fn start(self) -> Result<()> {
        let bind_addr = self.config.bind_addr;
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            error!("Failed to bind to address {}: {}", bind_addr, e);
            ProposalError::server_error(
                format!("Failed to bind to address {bind_addr}: {e}"),
                Some(Box::new(e)),
            )
        })?;
        let scheme = if self.tls_acceptor.is_some() { "https" } else { "http" };
        info!("Server listening on {}://{}", scheme, bind_addr);

        let server = Arc::new(self);
        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    // transient (e.g. EMFILE); keep serving
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let server = Arc::clone(&server);
            tokio::task::spawn(async move {
                match server.tls_acceptor.clone() {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => server.serve_connection(tls_stream, remote_addr).await,
                        Err(e) => warn!("TLS handshake failed from {}: {}", remote_addr, e),
                    },
                    None => server.serve_connection(stream, remote_addr).await,
                }
            });
        }
    }

    async fn serve_connection<S>(self: Arc<Self>, stream: S, remote_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let result = hyper::server::conn::http1::Builder::new()
            .serve_connection(
                TokioIo::new(stream),
                service_fn(move |request| {
                    let server = Arc::clone(&self);
                    async move { Ok::<_, Infallible>(server.route(request, remote_addr).await) }
                }),
            )
            .await;
        if let Err(e) = result {
            debug!("Connection error from {}: {}", remote_addr, e);
        }
    }

    /// Route one request to its endpoint
    #[instrument(level = "debug", name = "handle_request", skip(self, request))]
    pub async fn route<B>(&self, request: Request<B>, remote_addr: SocketAddr) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxedSource>,
    {
        let path = request.uri().path().to_string();
        match path.as_str() {
            CALCULATE_PATH => {
                self.calculate_handler
                    .handle(request, remote_addr, Endpoint::Plain)
                    .await
            }
            CALCULATE_SECURE_PATH => {
                self.calculate_handler
                    .handle(request, remote_addr, Endpoint::Secure)
                    .await
            }
            HEALTH_PATH if self.config.enable_health_check => self.handle_health_check(&request),
            METRICS_PATH if self.config.enable_metrics => {
                self.handle_metrics(&request, remote_addr)
            }
            _ => {
                let request_id = resolve_request_id(request.headers());
                warn!(request_id = %request_id, "Unknown endpoint: {} {}", request.method(), path);
                error_response(&ProposalError::not_found(path), &request_id)
            }
        }
    }

    fn handle_health_check<B>(&self, request: &Request<B>) -> Response<Full<Bytes>> {
        let request_id = resolve_request_id(request.headers());
        if request.method() != Method::GET {
            return error_response(
                &ProposalError::method_not_allowed(request.method().as_str()),
                &request_id,
            );
        }

        let body = serde_json::json!({
            "status": "UP",
            "timestamp": timestamp_now(),
            "version": crate::VERSION,
        });
        json_response(StatusCode::OK, body.to_string(), &request_id)
    }

    fn handle_metrics<B>(&self, request: &Request<B>, remote_addr: SocketAddr) -> Response<Full<Bytes>> {
        let request_id = resolve_request_id(request.headers());
        if request.method() != Method::GET {
            return error_response(
                &ProposalError::method_not_allowed(request.method().as_str()),
                &request_id,
            );
        }
        if !remote_addr.ip().to_canonical().is_loopback() {
            return error_response(
                &ProposalError::authorization_error(format!(
                    "metrics requested from non-loopback peer {}",
                    remote_addr.ip()
                )),
                &request_id,
            );
        }

        let body = self.metrics.to_json(self.config.secure_mode);
        json_response(StatusCode::OK, body.to_string(), &request_id)
    }
}

impl std::fmt::Debug for ProposalServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProposalServer")
            .field("config", &self.config)
            .field("calculate_handler", &self.calculate_handler)
            .field("tls", &self.tls_acceptor.is_some())
            .finish_non_exhaustive()
    }
}

/// Build a server from `config` and serve until the task is dropped
///
/// ## Errors
/// - `ProposalError::ConfigError`: invalid configuration
/// - `ProposalError::ServerError`: bind failure
#[instrument(level = "info", name = "start_server")]
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let server = ProposalServer::new(config)?;
    server.start().await
}

//! # Proposal Gateway Binary
//!
//! Runs the proposal calculator over HTTP or HTTPS with bearer-token
//! authentication, per-client rate limiting and optional payload encryption.
//!
//! ## Usage
//!
//! ```bash
//! # Plaintext endpoint only
//! JWT_SECRET=change-me proposal-gate --bind 127.0.0.1:8080
//!
//! # Secure mode with an AES-256 key and TLS
//! export JWT_SECRET=change-me
//! export AES_KEY=$(head -c 32 /dev/urandom | base64)
//! proposal-gate --secure-mode --tls-cert cert.pem --tls-key key.pem
//! ```
//!
//! ## Exit codes
//! - 0: Clean shutdown
//! - 1: Configuration or logging error
//! - 2: Critical server error (bind failure, invalid key material)
//! - 3: Other runtime error

use proposal_gate::{server::ServerConfig, start_server};
use std::process;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() {
    let config = ServerConfig::from_args();

    if let Err(e) = setup_logging(&config) {
        eprintln!("Failed to initialize logging: {e}");
        process::exit(1);
    }

    info!("Starting Proposal Gateway v{}", proposal_gate::VERSION);
    info!("Configuration: {:?}", config);

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e.internal_message());
        process::exit(1);
    }

    // I/O pool; computations run on the engine's own runtime
    let http_threads = config.get_http_threads();
    info!(
        "Using {} HTTP threads and {} compute threads",
        http_threads,
        config.get_compute_threads()
    );
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(http_threads)
        .thread_name("proposal-http")
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to build I/O runtime: {}", e);
            process::exit(2);
        }
    };

    let code = runtime.block_on(async move {
        tokio::select! {
            result = start_server(config) => match result {
                Ok(()) => {
                    info!("Server shut down cleanly");
                    0
                }
                Err(e) => {
                    error!("Server error: {}", e.internal_message());
                    if e.is_critical() { 2 } else { 3 }
                }
            },
            () = shutdown_signal() => {
                info!("Received shutdown signal, stopping server...");
                0
            }
        }
    });

    // in-flight computations are abandoned
    runtime.shutdown_background();
    process::exit(code);
}

/// Install the global subscriber
///
/// `ENVIRONMENT=production` selects JSON output, anything else the pretty
/// formatter.
fn setup_logging(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let is_production = std::env::var("ENVIRONMENT")
        .map(|env| env.eq_ignore_ascii_case("production"))
        .unwrap_or(false);

    let env_filter = EnvFilter::builder()
        .with_default_directive(config.log_level.inner().into())
        .from_env()?
        .add_directive("hyper=info".parse()?)
        .add_directive("tokio=info".parse()?)
        .add_directive("rustls=warn".parse()?)
        .add_directive("mio=warn".parse()?);

    if is_production {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_span_list(true)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .init();

        info!("Initialized structured JSON logging for production");
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_thread_names(true),
            )
            .init();

        info!("Initialized pretty-printed logging for development");
    }

    Ok(())
}

/// Completes on SIGINT or SIGTERM
///
/// A handler that cannot be installed never fires; the other one still does.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        },
        () = terminate => {
            info!("Received SIGTERM");
        },
    }
}

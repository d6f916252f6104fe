//! # Proposal Gateway Library
//!
//! A network-facing fee proposal calculator. Every request carries an HS256
//! bearer credential, is admitted by a per-client rate limiter, may travel
//! inside an AES-GCM envelope, and is computed on a dedicated worker pool
//! under a deadline before being persisted.
//!
//! ## Architecture
//!
//! - [`error`] - Error taxonomy mapping every failure to one HTTP status
//! - [`codec`] - Typed field extraction from flat JSON objects
//! - [`crypto`] - Token verification and payload envelopes
//! - [`limiter`] - Fixed-window per-key admission control
//! - [`engine`] - Fee computation on a separate runtime
//! - [`metrics`] - Lock-free request statistics
//! - [`store`] - Persistence seam and in-memory store
//! - [`server`] - Hyper-based HTTP server, configuration and TLS
//!
//! ## Request Pipeline
//!
//! 1. **Admission**: method, rate limit, endpoint mode, content type
//! 2. **Authentication**: `Authorization: Bearer <token>` present
//! 3. **Body**: size cap, optional envelope decryption, field parsing
//! 4. **Authorization**: token signature, claims and tier
//! 5. **Computation**: fee and net amount under the processing deadline
//! 6. **Persistence** and response, encrypted on the secure endpoint
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use proposal_gate::server::config::SecretValue;
//! use proposal_gate::{start_server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         bind_addr: "127.0.0.1:8080".parse()?,
//!         jwt_secret: Some(SecretValue::new("change-me")),
//!         ..ServerConfig::default()
//!     };
//!
//!     start_server(config).await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod codec;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod server;
pub mod store;

// Re-export commonly used types for convenience
pub use error::{ProposalError, Result};
pub use server::{start_server, ProposalServer, ServerConfig};

/// Version information for the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default server port
pub const DEFAULT_PORT: u16 = 8080;

/// Default maximum request body size in bytes
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Default processing deadline in milliseconds
pub const REQUEST_TIMEOUT_MS: u64 = 5_000;

/// Default requests admitted per client per window
pub const DEFAULT_RATE_LIMIT: i64 = 60;

/// Default rate limit window in milliseconds
pub const DEFAULT_RATE_WINDOW_MS: u64 = 60_000;

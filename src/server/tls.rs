//! TLS termination for the listener.
//!
//! PEM certificate chain and private key are loaded once at startup. A client
//! CA bundle turns on client-certificate verification, optional unless
//! client authentication is required.

use super::ServerConfig;
use crate::error::{ProposalError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// Build the acceptor described by `config`, or `None` for plain HTTP
///
/// ## Errors
/// - `ProposalError::ConfigError`: unreadable or invalid PEM material
pub fn build_acceptor(config: &ServerConfig) -> Result<Option<TlsAcceptor>> {
    let (Some(cert_path), Some(key_path)) = (&config.tls_cert_path, &config.tls_key_path) else {
        return Ok(None);
    };

    let chain = load_cert_chain(cert_path)?;
    let key = load_private_key(key_path)?;
    let builder = rustls::ServerConfig::builder();

    let server_config = match &config.tls_client_ca_path {
        Some(ca_path) => {
            let roots = load_root_store(ca_path)?;
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots));
            let verifier = if config.tls_require_client_auth {
                verifier.build()
            } else {
                verifier.allow_unauthenticated().build()
            }
            .map_err(|e| {
                ProposalError::config_error(
                    format!("failed to build client verifier from {}: {e}", ca_path.display()),
                    Some(Box::new(e)),
                )
            })?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    }
    .with_single_cert(chain, key)
    .map_err(|e| {
        ProposalError::config_error(
            format!("invalid TLS certificate/key configuration: {e}"),
            Some(Box::new(e)),
        )
    })?;

    info!(
        client_auth = config.tls_client_ca_path.is_some(),
        client_auth_required = config.tls_require_client_auth,
        "TLS enabled"
    );
    Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
}

fn open(path: &Path) -> Result<BufReader<File>> {
    File::open(path).map(BufReader::new).map_err(|e| {
        ProposalError::config_error(
            format!("failed to open {}: {e}", path.display()),
            Some(Box::new(e)),
        )
    })
}

fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open(path)?;
    let certificates = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            ProposalError::config_error(
                format!("failed to parse PEM certs from {}: {e}", path.display()),
                Some(Box::new(e)),
            )
        })?;
    if certificates.is_empty() {
        return Err(ProposalError::config_error(
            format!("no certificates found in {}", path.display()),
            None,
        ));
    }
    Ok(certificates)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| {
            ProposalError::config_error(
                format!("failed to parse private key {}: {e}", path.display()),
                Some(Box::new(e)),
            )
        })?
        .ok_or_else(|| {
            ProposalError::config_error(format!("no private key found in {}", path.display()), None)
        })
}

fn load_root_store(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    let (added, _ignored) = roots.add_parsable_certificates(load_cert_chain(path)?);
    if added == 0 {
        return Err(ProposalError::config_error(
            format!("no usable CA certificates in {}", path.display()),
            None,
        ));
    }
    Ok(roots)
}

//! # Cryptographic Operations Module
//!
//! Two stateless primitives guard the request pipeline:
//!
//! - [`token`] - HS256 bearer credentials verified locally against a shared secret
//! - [`envelope`] - AES-GCM envelopes shielding request and response bodies
//!
//! Neither keeps mutable state, so both are shared across tasks behind an
//! `Arc` without any synchronisation.

pub mod envelope;
pub mod token;

// Re-export commonly used types
pub use envelope::{Envelope, PayloadCipher};
pub use token::{Claims, Denial, TokenPolicy, TokenSigner, TokenVerifier, Verdict};

use crate::error::{ProposalError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;

/// Key lengths accepted for AES-128, AES-192 and AES-256
pub const VALID_KEY_LENGTHS: [usize; 3] = [16, 24, 32];

/// Raw AES key material
///
/// The length is checked once at construction; any other length is a fatal
/// configuration error. `Debug` never prints the key bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey(Vec<u8>);

impl SymmetricKey {
    /// Wrap raw key bytes
    ///
    /// ## Errors
    /// - `ProposalError::ConfigError`: length is not 16, 24 or 32
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if !VALID_KEY_LENGTHS.contains(&bytes.len()) {
            return Err(ProposalError::config_error(
                format!("invalid AES key length: {} bytes", bytes.len()),
                None,
            ));
        }
        Ok(Self(bytes.to_vec()))
    }

    /// Decode standard base64 key material
    ///
    /// ## Errors
    /// - `ProposalError::ConfigError`: not base64, or wrong decoded length
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let decoded = BASE64.decode(encoded.trim()).map_err(|e| {
            ProposalError::config_error("AES key is not valid base64", Some(Box::new(e)))
        })?;
        Self::from_bytes(&decoded)
    }

    /// Generate fresh random key material of the given length
    ///
    /// ## Errors
    /// - `ProposalError::ConfigError`: unsupported length
    pub fn generate(len: usize) -> Result<Self> {
        let mut bytes = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::from_bytes(&bytes)
    }

    /// Base64 form, for provisioning clients
    #[must_use]
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.0)
    }

    /// Raw key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Key length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; a constructed key is never empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SymmetricKey(<{} bytes redacted>)", self.0.len())
    }
}

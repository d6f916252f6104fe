//! # AES-GCM Payload Envelopes
//!
//! Request and response bodies on the secure endpoint travel as
//! `{"iv": "...", "data": "..."}`: a fresh 12-byte nonce and the ciphertext
//! with its 128-bit tag appended, both standard base64.
//!
//! ## Security Considerations
//!
//! - A nonce is drawn from the OS-seeded thread RNG for every encryption and
//!   never reused by this process.
//! - Every decryption failure (bad base64, wrong nonce length, tag mismatch)
//!   collapses into the same generic error, so a caller cannot tell which
//!   check failed.
//! - Nothing here logs key material or plaintext.

use super::SymmetricKey;
use crate::codec;
use crate::error::{ProposalError, Result};
use aes_gcm::{
    aead::{consts::U12, generic_array::GenericArray, Aead, AeadCore, KeyInit},
    aes::Aes192,
    Aes128Gcm, Aes256Gcm, AesGcm,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Nonce length in bytes
pub const NONCE_LEN: usize = 12;

/// Authentication tag length in bytes
pub const TAG_LEN: usize = 16;

type Aes192Gcm = AesGcm<Aes192, U12>;

const DECRYPT_FAILURE: &str = "decryption failed";

/// Wire form of an encrypted body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub iv: String,
    pub data: String,
}

impl Envelope {
    /// Read an envelope from a JSON body
    ///
    /// Malformed envelopes fail with the same generic crypto error as a bad
    /// tag.
    pub fn from_json(body: &str) -> Result<Self> {
        let object =
            codec::parse_object(body).map_err(|_| ProposalError::crypto_error(DECRYPT_FAILURE))?;
        match (codec::read_string(&object, "iv"), codec::read_string(&object, "data")) {
            (Some(iv), Some(data)) => Ok(Self {
                iv: iv.to_string(),
                data: data.to_string(),
            }),
            _ => Err(ProposalError::crypto_error(DECRYPT_FAILURE)),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            ProposalError::internal_error("failed to serialise envelope", Some(Box::new(e)))
        })
    }
}

/// Authenticated encryption for a single process-wide key
pub struct PayloadCipher {
    key: SymmetricKey,
    operation_count: AtomicU64,
}

impl PayloadCipher {
    pub fn new(key: SymmetricKey) -> Self {
        Self {
            key,
            operation_count: AtomicU64::new(0),
        }
    }

    /// Encrypt `plaintext` under a freshly generated nonce
    ///
    /// ## Errors
    /// - `ProposalError::CryptoError`: the AEAD rejected the input
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Envelope> {
        self.operation_count.fetch_add(1, Ordering::Relaxed);

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = match self.key.len() {
            16 => seal::<Aes128Gcm>(self.key.as_bytes(), &nonce, plaintext),
            24 => seal::<Aes192Gcm>(self.key.as_bytes(), &nonce, plaintext),
            32 => seal::<Aes256Gcm>(self.key.as_bytes(), &nonce, plaintext),
            _ => None,
        }
        .ok_or_else(|| ProposalError::crypto_error("encryption failed"))?;

        Ok(Envelope {
            iv: BASE64.encode(nonce),
            data: BASE64.encode(ciphertext),
        })
    }

    /// Decrypt and authenticate an envelope
    ///
    /// ## Errors
    /// - `ProposalError::CryptoError`: always the same message, whatever failed
    pub fn decrypt(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        self.operation_count.fetch_add(1, Ordering::Relaxed);

        let nonce = BASE64
            .decode(envelope.iv.trim())
            .ok()
            .filter(|nonce| nonce.len() == NONCE_LEN);
        let ciphertext = BASE64
            .decode(envelope.data.trim())
            .ok()
            .filter(|data| data.len() >= TAG_LEN);
        let (Some(nonce), Some(ciphertext)) = (nonce, ciphertext) else {
            return Err(ProposalError::crypto_error(DECRYPT_FAILURE));
        };

        match self.key.len() {
            16 => open::<Aes128Gcm>(self.key.as_bytes(), &nonce, &ciphertext),
            24 => open::<Aes192Gcm>(self.key.as_bytes(), &nonce, &ciphertext),
            32 => open::<Aes256Gcm>(self.key.as_bytes(), &nonce, &ciphertext),
            _ => None,
        }
        .ok_or_else(|| ProposalError::crypto_error(DECRYPT_FAILURE))
    }

    /// Number of encrypt and decrypt calls so far
    pub fn get_operation_count(&self) -> u64 {
        self.operation_count.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCipher")
            .field("key", &self.key)
            .field("operation_count", &self.get_operation_count())
            .finish()
    }
}

fn seal<C>(key: &[u8], nonce: &[u8], plaintext: &[u8]) -> Option<Vec<u8>>
where
    C: KeyInit + AeadCore<NonceSize = U12> + Aead,
{
    let cipher = C::new_from_slice(key).ok()?;
    cipher.encrypt(GenericArray::from_slice(nonce), plaintext).ok()
}

fn open<C>(key: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>>
where
    C: KeyInit + AeadCore<NonceSize = U12> + Aead,
{
    let cipher = C::new_from_slice(key).ok()?;
    cipher.decrypt(GenericArray::from_slice(nonce), ciphertext).ok()
}

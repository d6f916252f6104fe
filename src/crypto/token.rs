//! # Bearer Token Verification
//!
//! Compact three-segment HS256 credentials (`header.claims.signature`),
//! verified locally against a shared secret. No identity provider is
//! consulted and nothing is cached between calls.
//!
//! ## Verification Order
//!
//! 1. blank token, segment count
//! 2. base64url decoding of header and claims
//! 3. header algorithm (only `HS256`, case-insensitive)
//! 4. HMAC-SHA256 signature, compared in constant time
//! 5. expiry, issuer and audience claims
//! 6. the `plan` tier claim against the tier the request asks for
//!
//! An insufficient tier is reported as a distinct [`Denial`] so callers can
//! log it apart from a bad credential, while answering both the same way.

use crate::codec::{self, Object};
use crate::error::{ProposalError, Result};
use base64::{
    engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD},
    Engine,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// The only accepted signing algorithm
pub const ALGORITHM: &str = "HS256";

/// Default tolerance applied to the expiry claim
pub const DEFAULT_CLOCK_SKEW_SECS: i64 = 30;

const HEADER_JSON: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

/// Verification settings shared by every request
#[derive(Clone)]
pub struct TokenPolicy {
    secret: Vec<u8>,
    issuer: Option<String>,
    audience: Option<String>,
    require_expiry: bool,
    clock_skew_secs: i64,
}

impl TokenPolicy {
    /// Policy with expiry enforcement on and the default skew
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            issuer: None,
            audience: None,
            require_expiry: true,
            clock_skew_secs: DEFAULT_CLOCK_SKEW_SECS,
        }
    }

    /// Require an exact `iss` claim; blank means not configured
    #[must_use]
    pub fn with_issuer(mut self, issuer: Option<String>) -> Self {
        self.issuer = issuer.filter(|value| !value.trim().is_empty());
        self
    }

    /// Require an exact `aud` claim; blank means not configured
    #[must_use]
    pub fn with_audience(mut self, audience: Option<String>) -> Self {
        self.audience = audience.filter(|value| !value.trim().is_empty());
        self
    }

    #[must_use]
    pub fn with_require_expiry(mut self, require_expiry: bool) -> Self {
        self.require_expiry = require_expiry;
        self
    }

    #[must_use]
    pub fn with_clock_skew(mut self, clock_skew_secs: i64) -> Self {
        self.clock_skew_secs = clock_skew_secs.max(0);
        self
    }

    pub fn issuer(&self) -> Option<&str> {
        self.issuer.as_deref()
    }

    pub fn audience(&self) -> Option<&str> {
        self.audience.as_deref()
    }

    pub fn require_expiry(&self) -> bool {
        self.require_expiry
    }

    pub fn clock_skew_secs(&self) -> i64 {
        self.clock_skew_secs
    }
}

impl std::fmt::Debug for TokenPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPolicy")
            .field("secret", &"<redacted>")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("require_expiry", &self.require_expiry)
            .field("clock_skew_secs", &self.clock_skew_secs)
            .finish()
    }
}

/// Why a token was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    EmptyToken,
    Malformed,
    MalformedEncoding,
    UnsupportedAlgorithm,
    BadSignature,
    InvalidClaims,
    Expired,
    MissingTier,
    InsufficientTier,
}

impl Denial {
    /// Short reason for logs
    #[must_use]
    pub fn reason(self) -> &'static str {
        match self {
            Self::EmptyToken => "empty token",
            Self::Malformed => "malformed token",
            Self::MalformedEncoding => "malformed encoding",
            Self::UnsupportedAlgorithm => "unsupported algorithm",
            Self::BadSignature => "invalid signature",
            Self::InvalidClaims => "invalid claims",
            Self::Expired => "token expired",
            Self::MissingTier => "missing plan claim",
            Self::InsufficientTier => "insufficient tier",
        }
    }

    /// True when the credential itself is bad, false when it is merely
    /// under-privileged
    #[must_use]
    pub fn is_credential_failure(self) -> bool {
        !matches!(self, Self::InsufficientTier)
    }
}

impl std::fmt::Display for Denial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.reason())
    }
}

/// Outcome of a verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The token is authentic and grants the requested tier
    Granted {
        /// Tier claim as carried by the token
        tier: String,
    },
    Denied(Denial),
}

impl Verdict {
    #[must_use]
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted { .. })
    }

    /// `"ok"` when granted, otherwise the denial reason
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Granted { .. } => "ok",
            Self::Denied(denial) => denial.reason(),
        }
    }
}

/// Stateless HS256 verifier
#[derive(Debug, Clone)]
pub struct TokenVerifier {
    policy: TokenPolicy,
}

impl TokenVerifier {
    pub fn new(policy: TokenPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &TokenPolicy {
        &self.policy
    }

    /// Verify `token` against the current wall clock
    pub fn verify(&self, token: &str, required_tier: &str) -> Verdict {
        self.verify_at(token, required_tier, chrono::Utc::now().timestamp())
    }

    /// Verify `token` as if the current time were `now_secs` (epoch seconds)
    pub fn verify_at(&self, token: &str, required_tier: &str, now_secs: i64) -> Verdict {
        match self.check(token, required_tier, now_secs) {
            Ok(tier) => Verdict::Granted { tier },
            Err(denial) => Verdict::Denied(denial),
        }
    }

    fn check(
        &self,
        token: &str,
        required_tier: &str,
        now_secs: i64,
    ) -> std::result::Result<String, Denial> {
        let token = token.trim();
        if token.is_empty() {
            return Err(Denial::EmptyToken);
        }

        let segments: Vec<&str> = token.split('.').collect();
        let [header_b64, claims_b64, signature] = segments[..] else {
            return Err(Denial::Malformed);
        };

        let header_raw = decode_segment(header_b64).ok_or(Denial::MalformedEncoding)?;
        let claims_raw = decode_segment(claims_b64).ok_or(Denial::MalformedEncoding)?;

        let header = parse_segment(&header_raw).ok_or(Denial::Malformed)?;
        match codec::read_string(&header, "alg") {
            Some(alg) if alg.eq_ignore_ascii_case(ALGORITHM) => {}
            _ => return Err(Denial::UnsupportedAlgorithm),
        }

        let signing_input = format!("{header_b64}.{claims_b64}");
        let expected = sign_input(&self.policy.secret, &signing_input).ok_or(Denial::BadSignature)?;
        if !bool::from(expected.as_bytes().ct_eq(signature.as_bytes())) {
            return Err(Denial::BadSignature);
        }

        let claims = parse_segment(&claims_raw).ok_or(Denial::InvalidClaims)?;
        self.check_claims(&claims, now_secs)?;

        let tier = codec::read_string(&claims, "plan")
            .map(str::trim)
            .filter(|tier| !tier.is_empty())
            .ok_or(Denial::MissingTier)?;
        if !tier.eq_ignore_ascii_case(required_tier.trim()) {
            return Err(Denial::InsufficientTier);
        }
        Ok(tier.to_string())
    }

    fn check_claims(&self, claims: &Object, now_secs: i64) -> std::result::Result<(), Denial> {
        if self.policy.require_expiry {
            let exp = codec::read_optional_i64(claims, "exp")
                .map_err(|_| Denial::InvalidClaims)?
                .ok_or(Denial::InvalidClaims)?;
            if exp.saturating_add(self.policy.clock_skew_secs) <= now_secs {
                return Err(Denial::Expired);
            }
        }

        if let Some(issuer) = self.policy.issuer.as_deref() {
            if codec::read_string(claims, "iss") != Some(issuer) {
                return Err(Denial::InvalidClaims);
            }
        }
        if let Some(audience) = self.policy.audience.as_deref() {
            if codec::read_string(claims, "aud") != Some(audience) {
                return Err(Denial::InvalidClaims);
            }
        }
        Ok(())
    }
}

/// Claims carried by a token
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub plan: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
}

impl Claims {
    pub fn for_plan(plan: impl Into<String>) -> Self {
        Self {
            plan: plan.into(),
            ..Self::default()
        }
    }

    /// Expire `ttl_secs` seconds from now
    #[must_use]
    pub fn expiring_in(mut self, ttl_secs: i64) -> Self {
        self.exp = Some(chrono::Utc::now().timestamp().saturating_add(ttl_secs));
        self
    }
}

/// Issues HS256 tokens; used for provisioning and tests
pub struct TokenSigner {
    secret: Vec<u8>,
}

impl TokenSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// Sign `claims` into a compact token
    ///
    /// ## Errors
    /// - `ProposalError::InternalError`: claims could not be serialised
    pub fn sign(&self, claims: &Claims) -> Result<String> {
        let claims_json = serde_json::to_string(claims).map_err(|e| {
            ProposalError::internal_error("failed to serialise claims", Some(Box::new(e)))
        })?;
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(HEADER_JSON),
            URL_SAFE_NO_PAD.encode(claims_json)
        );
        let signature = sign_input(&self.secret, &signing_input)
            .ok_or_else(|| ProposalError::internal_error("failed to initialise HMAC", None))?;
        Ok(format!("{signing_input}.{signature}"))
    }
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenSigner(<redacted>)")
    }
}

fn sign_input(secret: &[u8], input: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(input.as_bytes());
    Some(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
}

fn decode_segment(segment: &str) -> Option<Vec<u8>> {
    if segment.is_empty() {
        return None;
    }
    let mut padded = segment.to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    URL_SAFE.decode(padded).ok()
}

fn parse_segment(raw: &[u8]) -> Option<Object> {
    let text = std::str::from_utf8(raw).ok()?;
    codec::parse_object(text).ok()
}

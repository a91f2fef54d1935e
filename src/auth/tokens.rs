//! Signed access tokens
//!
//! Tokens are compact JWTs (`header.payload.signature`, base64url without
//! padding) signed with a shared HMAC key. The payload carries:
//!
//! - `sub`: stringified integer subject id
//! - `username`
//! - `permissions`: capability names
//! - `iat` / `exp`: epoch seconds
//!
//! Decoding reports failures in a fixed order: signature, then structure,
//! then expiry.

use crate::auth::claims::{CapabilitySet, Claims};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha384, Sha512};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Why a token failed to decode. Never shown to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("token signature is invalid")]
    SignatureInvalid,

    #[error("token payload is malformed")]
    Malformed,

    #[error("token has expired")]
    Expired,
}

/// Errors raised while issuing a token
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token ttl must be at least one second")]
    InvalidTtl,

    #[error("token ttl is too large to express as an expiry timestamp")]
    TtlTooLarge,

    #[error("unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("token encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// HMAC signing algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    HS256,
    HS384,
    HS512,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::HS256 => "HS256",
            Algorithm::HS384 => "HS384",
            Algorithm::HS512 => "HS512",
        }
    }
}

impl FromStr for Algorithm {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HS256" => Ok(Algorithm::HS256),
            "HS384" => Ok(Algorithm::HS384),
            "HS512" => Ok(Algorithm::HS512),
            _ => Err(TokenError::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared signing secret
#[derive(Clone)]
pub struct SigningKey {
    key: Vec<u8>,
}

impl SigningKey {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }

    fn as_bytes(&self) -> &[u8] {
        &self.key
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigningKey([REDACTED])")
    }
}

/// Source of the current time in epoch seconds
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default()
    }
}

#[derive(Serialize, Deserialize)]
struct TokenHeader {
    alg: String,
    #[serde(default)]
    typ: Option<String>,
}

/// `sub` as issued by us (string) or by lenient issuers (number)
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum Subject {
    Text(String),
    Number(i64),
}

impl Subject {
    fn id(&self) -> Option<i64> {
        match self {
            Subject::Text(s) => s.trim().parse().ok(),
            Subject::Number(n) => Some(*n),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct TokenPayload {
    sub: Option<Subject>,
    username: Option<String>,
    #[serde(default)]
    permissions: Option<CapabilitySet>,
    #[serde(default)]
    iat: Option<i64>,
    exp: Option<i64>,
}

/// A verified token: claims plus their validity window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedToken {
    pub claims: Claims,
    pub issued_at: Option<i64>,
    pub expires_at: i64,
}

/// Encodes and verifies signed tokens with one key and algorithm
#[derive(Clone)]
pub struct TokenCodec {
    key: SigningKey,
    algorithm: Algorithm,
    clock: Arc<dyn Clock>,
}

impl TokenCodec {
    pub fn new(key: SigningKey, algorithm: Algorithm) -> Self {
        Self::with_clock(key, algorithm, Arc::new(SystemClock))
    }

    pub fn with_clock(key: SigningKey, algorithm: Algorithm, clock: Arc<dyn Clock>) -> Self {
        Self {
            key,
            algorithm,
            clock,
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Issue a token for `claims` valid for `ttl` from now
    pub fn encode(&self, claims: &Claims, ttl: Duration) -> Result<String, TokenError> {
        let ttl_secs = ttl.as_secs();
        if ttl_secs == 0 {
            return Err(TokenError::InvalidTtl);
        }

        let now = self.clock.now();
        let expires_at = i64::try_from(ttl_secs)
            .ok()
            .and_then(|ttl| now.checked_add(ttl))
            .ok_or(TokenError::TtlTooLarge)?;
        let header = TokenHeader {
            alg: self.algorithm.as_str().to_string(),
            typ: Some("JWT".to_string()),
        };
        let payload = TokenPayload {
            sub: Some(Subject::Text(claims.subject_id.to_string())),
            username: Some(claims.username.clone()),
            permissions: Some(claims.capabilities.clone()),
            iat: Some(now),
            exp: Some(expires_at),
        };

        let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
        let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload)?);
        let signing_input = format!("{}.{}", header_b64, payload_b64);
        let signature_b64 = URL_SAFE_NO_PAD.encode(self.sign(signing_input.as_bytes()));

        Ok(format!("{}.{}", signing_input, signature_b64))
    }

    /// Verify a token and return its claims
    pub fn decode(&self, token: &str) -> Result<Claims, AuthError> {
        self.decode_token(token).map(|decoded| decoded.claims)
    }

    /// Verify a token and return its claims with the validity window
    pub fn decode_token(&self, token: &str) -> Result<DecodedToken, AuthError> {
        let mut parts = token.split('.');
        let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::SignatureInvalid);
        };

        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| AuthError::SignatureInvalid)?;
        let signing_input = &token[..header_b64.len() + 1 + payload_b64.len()];

        if !self.verify(signing_input.as_bytes(), &signature) {
            return Err(AuthError::SignatureInvalid);
        }

        // A header naming another algorithm was not signed the way we sign
        let header: TokenHeader =
            decode_segment(header_b64).ok_or(AuthError::SignatureInvalid)?;
        if header.alg != self.algorithm.as_str() {
            return Err(AuthError::SignatureInvalid);
        }

        let payload: TokenPayload = decode_segment(payload_b64).ok_or(AuthError::Malformed)?;
        let subject_id = payload
            .sub
            .as_ref()
            .and_then(Subject::id)
            .ok_or(AuthError::Malformed)?;
        let username = payload.username.ok_or(AuthError::Malformed)?;
        let expires_at = payload.exp.ok_or(AuthError::Malformed)?;

        if expires_at <= self.clock.now() {
            return Err(AuthError::Expired);
        }

        Ok(DecodedToken {
            claims: Claims {
                subject_id,
                username,
                capabilities: payload.permissions.unwrap_or_default(),
            },
            issued_at: payload.iat,
            expires_at,
        })
    }

    fn sign(&self, input: &[u8]) -> Vec<u8> {
        let key = self.key.as_bytes();
        match self.algorithm {
            Algorithm::HS256 => mac_bytes::<Hmac<Sha256>>(key, input),
            Algorithm::HS384 => mac_bytes::<Hmac<Sha384>>(key, input),
            Algorithm::HS512 => mac_bytes::<Hmac<Sha512>>(key, input),
        }
    }

    fn verify(&self, input: &[u8], signature: &[u8]) -> bool {
        let key = self.key.as_bytes();
        match self.algorithm {
            Algorithm::HS256 => mac_verify::<Hmac<Sha256>>(key, input, signature),
            Algorithm::HS384 => mac_verify::<Hmac<Sha384>>(key, input, signature),
            Algorithm::HS512 => mac_verify::<Hmac<Sha512>>(key, input, signature),
        }
    }
}

impl fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCodec")
            .field("key", &self.key)
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

fn mac_bytes<M: Mac + KeyInit>(key: &[u8], input: &[u8]) -> Vec<u8> {
    let mut mac = <M as Mac>::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(input);
    mac.finalize().into_bytes().to_vec()
}

fn mac_verify<M: Mac + KeyInit>(key: &[u8], input: &[u8], signature: &[u8]) -> bool {
    let mut mac = <M as Mac>::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(input);
    // Constant-time comparison
    mac.verify_slice(signature).is_ok()
}

fn decode_segment<T: DeserializeOwned>(segment: &str) -> Option<T> {
    let bytes = URL_SAFE_NO_PAD.decode(segment).ok()?;
    serde_json::from_slice(&bytes).ok()
}

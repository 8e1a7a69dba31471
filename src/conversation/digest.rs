//! Digest Service
//!
//! Keyed HMAC-SHA-512 over canonicalized payloads. Both peers must produce
//! the same bytes for the same payload, so structured values are serialized
//! with the RFC 8785 JSON Canonicalization Scheme before hashing:
//! - object keys sorted, recursively
//! - no insignificant whitespace
//! - UTF-8 strings with minimal escaping
//!
//! Raw strings are hashed as-is.

use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::Sha512;
use subtle::ConstantTimeEq;

use super::types::ProtocolError;

type HmacSha512 = Hmac<Sha512>;

/// Name of the only supported digest algorithm
pub const DIGEST_METHOD: &str = "sha512";

/// Default shared salt known to both peers
pub const DEFAULT_SHARED_SALT: &str = "RPTools.net";

/// Default salt for deriving conversation tokens from public keys
pub const DEFAULT_TOKEN_SALT: &str = "RPTools.net/upload-token";

/// Input to a digest computation
#[derive(Debug, Clone, Copy)]
pub enum Payload<'a> {
    /// Hashed byte-for-byte
    Text(&'a str),
    /// Canonicalized first
    Value(&'a Value),
    /// Canonicalized as a JSON object
    Body(&'a Map<String, Value>),
}

impl<'a> From<&'a str> for Payload<'a> {
    fn from(s: &'a str) -> Self {
        Payload::Text(s)
    }
}

impl<'a> From<&'a Value> for Payload<'a> {
    fn from(v: &'a Value) -> Self {
        Payload::Value(v)
    }
}

impl<'a> From<&'a Map<String, Value>> for Payload<'a> {
    fn from(m: &'a Map<String, Value>) -> Self {
        Payload::Body(m)
    }
}

#[derive(Debug, Clone)]
pub struct DigestService {
    shared_salt: String,
}

impl DigestService {
    /// Create a digest service for the named algorithm.
    ///
    /// Fails with `UnsupportedAlgorithm` for anything but `sha512`.
    pub fn new(algorithm: &str, shared_salt: impl Into<String>) -> Result<Self, ProtocolError> {
        if !algorithm.eq_ignore_ascii_case(DIGEST_METHOD) {
            return Err(ProtocolError::UnsupportedAlgorithm(algorithm.to_string()));
        }

        Ok(Self {
            shared_salt: shared_salt.into(),
        })
    }

    /// Digest with the shared salt
    pub fn digest<'a>(&self, payload: impl Into<Payload<'a>>) -> Result<String, ProtocolError> {
        self.digest_with_salt(payload, &self.shared_salt)
    }

    /// Digest with an explicit salt (used for token derivation)
    pub fn digest_with_salt<'a>(
        &self,
        payload: impl Into<Payload<'a>>,
        salt: &str,
    ) -> Result<String, ProtocolError> {
        let bytes = canonicalize(payload.into())?;

        let mut mac = HmacSha512::new_from_slice(salt.as_bytes())
            .map_err(|e| ProtocolError::UnsupportedAlgorithm(e.to_string()))?;
        mac.update(&bytes);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Digest of an envelope body with the shared salt
    pub fn digest_body(&self, body: &Map<String, Value>) -> Result<String, ProtocolError> {
        self.digest(body)
    }

    /// Checksum of stack-trace text, as promised by clients in phase 1
    pub fn checksum(&self, stack_trace: &str) -> Result<String, ProtocolError> {
        self.digest(stack_trace)
    }

    /// Constant-time comparison of two hex digests
    pub fn digests_match(expected: &str, actual: &str) -> bool {
        let expected = expected.as_bytes();
        let actual = actual.as_bytes();
        if expected.len() != actual.len() {
            return false;
        }
        expected.ct_eq(actual).into()
    }
}

/// Byte string that gets hashed for `payload`
pub fn canonicalize(payload: Payload<'_>) -> Result<Vec<u8>, ProtocolError> {
    match payload {
        Payload::Text(s) => Ok(s.as_bytes().to_vec()),
        Payload::Value(v) => serde_jcs::to_vec(v)
            .map_err(|e| ProtocolError::ProtocolFormat(format!("cannot canonicalize payload: {}", e))),
        Payload::Body(m) => serde_jcs::to_vec(m)
            .map_err(|e| ProtocolError::ProtocolFormat(format!("cannot canonicalize payload: {}", e))),
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Recovery tokens
//!
//! A recovery token lets a restarted client ask the server to re-attach to a
//! previous session. Callers treat the encoded form as opaque. Internally it is
//! URL-safe base64 over a versioned JSON document, so the format can evolve
//! without breaking tokens already persisted by applications.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Current token format version
pub const RECOVERY_TOKEN_VERSION: u8 = 1;

/// Errors produced while decoding a recovery token
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecoveryTokenError {
    /// Not valid base64
    #[error("recovery token is not valid base64: {0}")]
    Encoding(String),
    /// Decoded bytes are not a token document
    #[error("recovery token is malformed: {0}")]
    Malformed(String),
    /// Token written by a newer or unknown format
    #[error("unsupported recovery token version {0}")]
    UnsupportedVersion(u8),
}

/// Continuity data exported from a live connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryToken {
    /// Format version
    #[serde(rename = "v")]
    pub version: u8,
    /// Session key to recover
    pub connection_key: String,
    /// Serial the next outbound message should take
    pub msg_serial: u64,
    /// Last inbound serial applied before export
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_serial: Option<u64>,
    /// Wall-clock issue time in milliseconds
    pub issued_at: u64,
}

impl RecoveryToken {
    /// Build a token at the current format version
    pub fn new(
        connection_key: impl Into<String>,
        msg_serial: u64,
        connection_serial: Option<u64>,
        issued_at: u64,
    ) -> Self {
        Self {
            version: RECOVERY_TOKEN_VERSION,
            connection_key: connection_key.into(),
            msg_serial,
            connection_serial,
            issued_at,
        }
    }

    /// Opaque string form
    pub fn encode(&self) -> String {
        // Serializing a struct of strings and integers cannot fail
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    /// Parse an opaque string produced by [`RecoveryToken::encode`]
    pub fn decode(encoded: &str) -> Result<Self, RecoveryTokenError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| RecoveryTokenError::Encoding(e.to_string()))?;
        let token: RecoveryToken = serde_json::from_slice(&bytes)
            .map_err(|e| RecoveryTokenError::Malformed(e.to_string()))?;
        if token.version != RECOVERY_TOKEN_VERSION {
            return Err(RecoveryTokenError::UnsupportedVersion(token.version));
        }
        Ok(token)
    }

    /// Whether the token is older than `validity` at `now_ms`
    pub fn is_expired(&self, now_ms: u64, validity: Duration) -> bool {
        let validity_ms = u64::try_from(validity.as_millis()).unwrap_or(u64::MAX);
        now_ms.saturating_sub(self.issued_at) > validity_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_encode_decode() {
        let token = RecoveryToken::new("key-7", 12, Some(40), 1_000);
        let encoded = token.encode();
        assert!(!encoded.contains("key-7"));
        assert_eq!(RecoveryToken::decode(&encoded).unwrap(), token);
    }

    #[test]
    fn test_rejects_garbage() {
        assert_matches!(
            RecoveryToken::decode("not base64!"),
            Err(RecoveryTokenError::Encoding(_))
        );
        let not_json = URL_SAFE_NO_PAD.encode(b"hello");
        assert_matches!(
            RecoveryToken::decode(&not_json),
            Err(RecoveryTokenError::Malformed(_))
        );
    }

    #[test]
    fn test_rejects_future_version() {
        let mut token = RecoveryToken::new("k", 0, None, 0);
        token.version = 9;
        assert_eq!(
            RecoveryToken::decode(&token.encode()),
            Err(RecoveryTokenError::UnsupportedVersion(9))
        );
    }

    #[test]
    fn test_expiry_boundary() {
        let token = RecoveryToken::new("k", 0, None, 10_000);
        let validity = Duration::from_secs(5);
        assert!(!token.is_expired(15_000, validity));
        assert!(token.is_expired(15_001, validity));
        // Clock skew backwards never expires a token
        assert!(!token.is_expired(0, validity));
    }
}

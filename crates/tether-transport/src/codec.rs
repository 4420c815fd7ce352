//! Wire codec
//!
//! Transports move bytes; the codec maps them to and from
//! [`ProtocolMessage`]. The engine never looks inside payloads, so any codec
//! that preserves the connection-level fields is acceptable.

use tether_core::ProtocolMessage;
use thiserror::Error;

/// Codec failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Message could not be serialized
    #[error("failed to encode protocol message: {0}")]
    Encode(String),
    /// Bytes are not a protocol message
    #[error("failed to decode protocol message: {0}")]
    Decode(String),
}

/// Encoder/decoder for protocol messages
pub trait ProtocolCodec: Send + Sync + std::fmt::Debug {
    /// Encode one message
    fn encode(&self, message: &ProtocolMessage) -> Result<Vec<u8>, CodecError>;

    /// Decode one message
    fn decode(&self, bytes: &[u8]) -> Result<ProtocolMessage, CodecError>;

    /// Size of the encoded message, used for size limits
    fn encoded_len(&self, message: &ProtocolMessage) -> Result<usize, CodecError> {
        self.encode(message).map(|bytes| bytes.len())
    }
}

/// JSON text codec
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl ProtocolCodec for JsonCodec {
    fn encode(&self, message: &ProtocolMessage) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(message).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<ProtocolMessage, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

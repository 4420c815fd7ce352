//! Transport errors
//!
//! Transport failures stay typed inside this crate and are flattened to an
//! [`ErrorInfo`] at the engine boundary so they classify like server errors.

use crate::codec::CodecError;
use tether_core::{ErrorInfo, TransportKind};
use thiserror::Error;

/// Result alias for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Failure reported by a transport or its factory
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Kind cannot run in this environment
    #[error("transport {0} is not available")]
    Unavailable(TransportKind),
    /// Low-level connection to a host failed
    #[error("connection to {host} failed: {error}")]
    ConnectFailed {
        /// Host that was attempted
        host: String,
        /// Classified cause
        error: ErrorInfo,
    },
    /// Operation on a transport that has been closed
    #[error("transport is closed")]
    Closed,
    /// Message could not be encoded or decoded
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl TransportError {
    /// Connection to `host` failed with `error`
    pub fn connect_failed(host: impl Into<String>, error: ErrorInfo) -> Self {
        Self::ConnectFailed {
            host: host.into(),
            error,
        }
    }

    /// Host could not be reached
    pub fn unreachable(host: impl Into<String>) -> Self {
        let host = host.into();
        let error = ErrorInfo::disconnected(format!("host {host} unreachable"));
        Self::ConnectFailed { host, error }
    }

    /// Flatten into the error value the engine classifies
    pub fn to_error_info(&self) -> ErrorInfo {
        match self {
            TransportError::Unavailable(kind) => {
                ErrorInfo::transport_unavailable(format!("transport {kind} is not available"))
            }
            TransportError::ConnectFailed { error, .. } => error.clone(),
            TransportError::Closed => ErrorInfo::disconnected("transport is closed"),
            TransportError::Codec(err) => ErrorInfo::protocol(err.to_string()),
        }
    }
}

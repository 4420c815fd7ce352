//! Connection states and state-change notifications

use crate::error::ErrorInfo;
use crate::transport_kind::TransportKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Engine created, no connect requested yet
    Initialized,
    /// Attempting to establish a transport
    Connecting,
    /// A transport is active and the server accepted the session
    Connected,
    /// Transport lost, retrying within the state TTL
    Disconnected,
    /// Disconnected for longer than the state TTL
    Suspended,
    /// Close requested, waiting for confirmation
    Closing,
    /// Closed by the application
    Closed,
    /// Failed with a non-retryable error
    Failed,
}

impl ConnectionState {
    /// Whether the state is `closed` or `failed`
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }

    /// Whether submissions may be accepted into the pending queue
    pub fn accepts_submissions(self) -> bool {
        !matches!(
            self,
            ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Failed
        )
    }

    /// Error used to reject work while in this state
    pub fn rejection_error(self) -> ErrorInfo {
        match self {
            ConnectionState::Failed => ErrorInfo::failed("connection failed"),
            ConnectionState::Suspended => ErrorInfo::suspended("connection suspended"),
            ConnectionState::Closing | ConnectionState::Closed => {
                ErrorInfo::closed("connection closed")
            }
            _ => ErrorInfo::disconnected(format!("connection is {self}")),
        }
    }

    /// Stable lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Initialized => "initialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Suspended => "suspended",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emitted on every state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    /// State before the transition
    pub previous: ConnectionState,
    /// State after the transition
    pub current: ConnectionState,
    /// Cause, when the transition was driven by an error or a degradation
    pub reason: Option<ErrorInfo>,
    /// Delay before the next automatic attempt, for retrying states
    pub retry_in: Option<Duration>,
}

/// Point-in-time view of the engine, published after every event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    /// Current state
    pub state: ConnectionState,
    /// Server connection id
    pub connection_id: Option<String>,
    /// Opaque session key
    pub connection_key: Option<String>,
    /// Last applied inbound serial
    pub serial: Option<u64>,
    /// Serial the next submission will take
    pub next_msg_serial: u64,
    /// Messages awaiting acknowledgement
    pub pending: usize,
    /// Last error reason
    pub error_reason: Option<ErrorInfo>,
    /// Kind and host of the authoritative transport
    pub active_transport: Option<(TransportKind, String)>,
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Initialized,
            connection_id: None,
            connection_key: None,
            serial: None,
            next_msg_serial: 0,
            pending: 0,
            error_reason: None,
            active_transport: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_terminal_states() {
        assert!(ConnectionState::Closed.is_terminal());
        assert!(ConnectionState::Failed.is_terminal());
        assert!(!ConnectionState::Suspended.is_terminal());
    }

    #[test]
    fn test_rejection_errors_match_state() {
        assert_eq!(
            ConnectionState::Closed.rejection_error().kind(),
            ErrorKind::Closed
        );
        assert_eq!(
            ConnectionState::Failed.rejection_error().kind(),
            ErrorKind::Failed
        );
        assert!(ConnectionState::Disconnected
            .rejection_error()
            .is_retryable());
    }

    #[test]
    fn test_submissions_stop_at_closing() {
        assert!(ConnectionState::Disconnected.accepts_submissions());
        assert!(ConnectionState::Initialized.accepts_submissions());
        assert!(!ConnectionState::Closing.accepts_submissions());
    }
}

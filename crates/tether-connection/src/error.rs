//! Errors returned by the connection handle

use crate::state_machine::InvalidTransition;
use tether_core::{codes, ConnectionState, ErrorInfo};
use thiserror::Error;

/// Failure of a [`crate::Connection`] call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The engine task has exited
    #[error("connection engine has stopped")]
    EngineStopped,
    /// Request not permitted in the current state
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    /// Recovery token offered after a session was already established
    #[error("cannot recover while {state}; a session is already established")]
    SessionActive {
        /// State when the token was offered
        state: ConnectionState,
    },
}

impl ConnectionError {
    /// Equivalent error value for completions and state changes
    pub fn to_error_info(&self) -> ErrorInfo {
        match self {
            ConnectionError::EngineStopped => ErrorInfo::closed(self.to_string()),
            ConnectionError::InvalidTransition(invalid) => invalid.state.rejection_error(),
            ConnectionError::SessionActive { .. } => {
                ErrorInfo::new(codes::BAD_REQUEST, Some(400), self.to_string())
            }
        }
    }
}

//! Connection state machine
//!
//! Owns the authoritative [`ConnectionState`] together with the session
//! identity (connection id, key, last inbound serial) and applies triggers
//! according to a fixed transition table. Anything not in the table is
//! rejected, so the engine can never emit an out-of-order state change.

use tether_core::{ConnectionState, ErrorInfo, StateChange};
use thiserror::Error;

/// Event that may move the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Application called `connect()`
    Connect,
    /// A transport reached protocol-level `CONNECTED`
    Connected,
    /// Every candidate failed with a recoverable error
    AttemptsExhausted,
    /// Non-retryable error
    Fatal,
    /// Active transport lost or heartbeat timed out
    TransportLost,
    /// Retry timer elapsed
    RetryElapsed,
    /// Host environment reported connectivity again
    ConnectivityRestored,
    /// Time spent disconnected reached the state TTL
    StateTtlElapsed,
    /// Application called `close()`
    Close,
    /// Close confirmed by the server or timed out
    CloseConfirmed,
}

/// Trigger not permitted in the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("trigger {trigger:?} is not valid in state {state}")]
pub struct InvalidTransition {
    /// State at the time of the trigger
    pub state: ConnectionState,
    /// Rejected trigger
    pub trigger: Trigger,
}

/// Authoritative connection lifecycle
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    connection_id: Option<String>,
    connection_key: Option<String>,
    serial: Option<u64>,
    error_reason: Option<ErrorInfo>,
    escalated: bool,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    /// Machine in the `initialized` state
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Initialized,
            connection_id: None,
            connection_key: None,
            serial: None,
            error_reason: None,
            escalated: false,
        }
    }

    /// Next state for `trigger`, if the table permits it
    pub fn next_state(&self, trigger: Trigger) -> Option<ConnectionState> {
        use tether_core::ConnectionState::*;
        use Trigger as T;

        let next = match (self.state, trigger) {
            (Initialized | Failed | Disconnected | Suspended, T::Connect) => Connecting,
            (Disconnected | Suspended, T::RetryElapsed | T::ConnectivityRestored) => Connecting,
            (Connecting, T::Connected) => Connected,
            (Connecting, T::AttemptsExhausted) if self.escalated => Suspended,
            (Connecting, T::AttemptsExhausted) => Disconnected,
            (Connecting | Connected | Disconnected | Suspended, T::Fatal) => Failed,
            (Connected, T::TransportLost) => Disconnected,
            (Connecting | Disconnected, T::StateTtlElapsed) => Suspended,
            (Connecting | Connected | Disconnected | Suspended, T::Close) => Closing,
            (Initialized | Failed, T::Close) => Closed,
            (Closing, T::CloseConfirmed) => Closed,
            _ => return None,
        };
        Some(next)
    }

    /// Apply `trigger`, recording `reason` as the current error
    pub fn apply(
        &mut self,
        trigger: Trigger,
        reason: Option<ErrorInfo>,
    ) -> Result<StateChange, InvalidTransition> {
        let next = self.next_state(trigger).ok_or(InvalidTransition {
            state: self.state,
            trigger,
        })?;
        let previous = self.state;
        self.state = next;

        match next {
            ConnectionState::Connected => self.escalated = false,
            ConnectionState::Suspended => {
                self.escalated = true;
                // A suspended session cannot be resumed
                self.connection_id = None;
                self.connection_key = None;
                self.serial = None;
            }
            ConnectionState::Closed | ConnectionState::Failed => {
                self.escalated = false;
                self.connection_id = None;
                self.connection_key = None;
                self.serial = None;
            }
            _ => {}
        }
        self.error_reason = reason.clone();

        Ok(StateChange {
            previous,
            current: next,
            reason,
            retry_in: None,
        })
    }

    /// Record the session identity after `CONNECTED`
    ///
    /// Returns true when this is a different connection than before.
    pub fn set_connection(&mut self, connection_id: &str, connection_key: &str) -> bool {
        let changed = self.connection_id.as_deref() != Some(connection_id);
        if changed {
            self.serial = None;
        }
        self.connection_id = Some(connection_id.to_string());
        self.connection_key = Some(connection_key.to_string());
        changed
    }

    /// Seed the inbound serial, e.g. from a recovery token
    pub fn seed_serial(&mut self, serial: Option<u64>) {
        self.serial = serial;
    }

    /// Record an inbound serial; false if it was already applied
    pub fn apply_inbound_serial(&mut self, serial: u64) -> bool {
        match self.serial {
            Some(last) if serial <= last => false,
            _ => {
                self.serial = Some(serial);
                true
            }
        }
    }

    /// Set the error reason without a transition
    pub fn set_error_reason(&mut self, reason: Option<ErrorInfo>) {
        self.error_reason = reason;
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Server connection id
    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    /// Session key
    pub fn connection_key(&self) -> Option<&str> {
        self.connection_key.as_deref()
    }

    /// Last applied inbound serial
    pub fn serial(&self) -> Option<u64> {
        self.serial
    }

    /// Last error reason
    pub fn error_reason(&self) -> Option<&ErrorInfo> {
        self.error_reason.as_ref()
    }

    /// Whether the state TTL elapsed since the last successful connection
    pub fn is_escalated(&self) -> bool {
        self.escalated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tether_core::ConnectionState::*;

    fn machine_in(path: &[Trigger]) -> ConnectionStateMachine {
        let mut machine = ConnectionStateMachine::new();
        for trigger in path {
            machine.apply(*trigger, None).unwrap();
        }
        machine
    }

    #[test]
    fn test_happy_path() {
        let mut machine = ConnectionStateMachine::new();
        let change = machine.apply(Trigger::Connect, None).unwrap();
        assert_eq!((change.previous, change.current), (Initialized, Connecting));
        machine.apply(Trigger::Connected, None).unwrap();
        machine.apply(Trigger::Close, None).unwrap();
        let change = machine.apply(Trigger::CloseConfirmed, None).unwrap();
        assert_eq!((change.previous, change.current), (Closing, Closed));
    }

    #[test]
    fn test_retry_cycle_escalates_to_suspended() {
        let mut machine = machine_in(&[Trigger::Connect, Trigger::AttemptsExhausted]);
        assert_eq!(machine.state(), Disconnected);

        machine.apply(Trigger::RetryElapsed, None).unwrap();
        machine
            .apply(Trigger::StateTtlElapsed, Some(ErrorInfo::suspended("ttl")))
            .unwrap();
        assert_eq!(machine.state(), Suspended);
        assert!(machine.is_escalated());

        // Further exhaustion stays suspended until a connection succeeds
        machine.apply(Trigger::RetryElapsed, None).unwrap();
        machine.apply(Trigger::AttemptsExhausted, None).unwrap();
        assert_eq!(machine.state(), Suspended);

        machine.apply(Trigger::ConnectivityRestored, None).unwrap();
        machine.apply(Trigger::Connected, None).unwrap();
        assert!(!machine.is_escalated());
    }

    #[test]
    fn test_closed_is_terminal_but_failed_can_reconnect() {
        let mut closed = machine_in(&[Trigger::Close]);
        assert_eq!(closed.state(), Closed);
        assert_matches!(
            closed.apply(Trigger::Connect, None),
            Err(InvalidTransition { state: Closed, trigger: Trigger::Connect })
        );
        assert_eq!(closed.next_state(Trigger::Close), None);

        let mut failed = machine_in(&[Trigger::Connect, Trigger::Fatal]);
        assert_eq!(failed.state(), Failed);
        assert_eq!(failed.apply(Trigger::Connect, None).unwrap().current, Connecting);
    }

    #[test]
    fn test_invalid_triggers_leave_state_untouched() {
        let mut machine = machine_in(&[Trigger::Connect, Trigger::Connected]);
        assert!(machine.apply(Trigger::RetryElapsed, None).is_err());
        assert!(machine.apply(Trigger::StateTtlElapsed, None).is_err());
        assert!(machine.apply(Trigger::Connect, None).is_err());
        assert_eq!(machine.state(), Connected);
    }

    #[test]
    fn test_session_identity() {
        let mut machine = machine_in(&[Trigger::Connect, Trigger::Connected]);
        assert!(machine.set_connection("c1", "k1"));
        assert!(machine.apply_inbound_serial(0));
        assert!(machine.apply_inbound_serial(1));
        assert!(!machine.apply_inbound_serial(1));
        assert!(!machine.apply_inbound_serial(0));

        // Resume onto the same connection keeps the serial
        assert!(!machine.set_connection("c1", "k1"));
        assert_eq!(machine.serial(), Some(1));

        // A new connection starts sequencing again
        assert!(machine.set_connection("c2", "k2"));
        assert_eq!(machine.serial(), None);

        machine.apply(Trigger::TransportLost, None).unwrap();
        machine.apply(Trigger::StateTtlElapsed, None).unwrap();
        assert_eq!(machine.connection_key(), None);
        assert_eq!(machine.connection_id(), None);
    }

    #[test]
    fn test_reason_tracks_last_transition() {
        let mut machine = ConnectionStateMachine::new();
        machine.apply(Trigger::Connect, None).unwrap();
        let err = ErrorInfo::timeout("slow");
        let change = machine
            .apply(Trigger::AttemptsExhausted, Some(err.clone()))
            .unwrap();
        assert_eq!(change.reason.as_ref(), Some(&err));
        assert_eq!(machine.error_reason(), Some(&err));
        machine.apply(Trigger::RetryElapsed, None).unwrap();
        assert_eq!(machine.error_reason(), None);
    }
}

//! Connection handle
//!
//! Cloneable front end to a running engine. Commands are forwarded over an
//! unbounded channel; state is read from the snapshot the engine publishes
//! after every event, so reads never wait on the event loop.

use crate::error::ConnectionError;
use crate::manager::Command;
use crate::queue::MessageCompletion;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tether_core::{
    ConnectionSnapshot, ConnectionState, ErrorInfo, ProtocolMessage, RecoveryToken, StateChange,
    TransportKind, WallClock,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

/// Notification published by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection moved to a new state
    StateChange(StateChange),
    /// The server re-sent `CONNECTED` without a state change
    Update(StateChange),
    /// A transport became authoritative, after connecting or upgrading
    TransportActive {
        /// Kind of the new transport
        kind: TransportKind,
        /// Host it is connected to
        host: String,
    },
}

impl ConnectionEvent {
    /// The state change carried by this event, if any
    pub fn state_change(&self) -> Option<&StateChange> {
        match self {
            ConnectionEvent::StateChange(change) | ConnectionEvent::Update(change) => Some(change),
            ConnectionEvent::TransportActive { .. } => None,
        }
    }
}

/// Handle to a running connection engine
#[derive(Clone)]
pub struct Connection {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<ConnectionSnapshot>,
    events: broadcast::Sender<ConnectionEvent>,
    inbound: broadcast::Sender<ProtocolMessage>,
    clock: Arc<dyn WallClock>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("snapshot", &*self.snapshot.borrow())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<Command>,
        snapshot: watch::Receiver<ConnectionSnapshot>,
        events: broadcast::Sender<ConnectionEvent>,
        inbound: broadcast::Sender<ProtocolMessage>,
        clock: Arc<dyn WallClock>,
    ) -> Self {
        Self {
            commands,
            snapshot,
            events,
            inbound,
            clock,
        }
    }

    fn command(&self, command: Command) -> Result<(), ConnectionError> {
        self.commands
            .send(command)
            .map_err(|_| ConnectionError::EngineStopped)
    }

    /// Start connecting
    ///
    /// A no-op while already connecting or connected. Fails once the
    /// connection is closing or closed.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.connect_with(None).await
    }

    /// Start connecting, resuming the session described by `token`
    ///
    /// Only valid on a cold start. Returns [`ConnectionError::SessionActive`]
    /// while connecting or connected, or while a session could still be
    /// resumed; the token is discarded.
    pub async fn recover(&self, token: impl Into<String>) -> Result<(), ConnectionError> {
        self.connect_with(Some(token.into())).await
    }

    async fn connect_with(&self, recover: Option<String>) -> Result<(), ConnectionError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Connect { recover, reply })?;
        rx.await.map_err(|_| ConnectionError::EngineStopped)??;
        Ok(())
    }

    /// Close the connection and fail everything still pending
    ///
    /// Returns once the close has been started. Calling it again is a no-op.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Close { reply })?;
        rx.await.map_err(|_| ConnectionError::EngineStopped)
    }

    /// Submit a message; the returned future resolves on ACK or NACK
    ///
    /// Rejections are reported through the completion, never by panicking.
    pub fn send(&self, message: ProtocolMessage) -> MessageCompletion {
        let (completion, result) = MessageCompletion::channel();
        if self
            .commands
            .send(Command::Send {
                message,
                completion,
            })
            .is_err()
        {
            return MessageCompletion::ready(Err(ErrorInfo::closed(
                "connection engine stopped",
            )));
        }
        result
    }

    /// Round-trip a heartbeat on the active transport
    pub async fn ping(&self) -> Result<Duration, ErrorInfo> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Ping { reply })
            .map_err(|err| err.to_error_info())?;
        rx.await
            .map_err(|_| ConnectionError::EngineStopped.to_error_info())?
    }

    /// Report a change in host network reachability
    pub fn connectivity_changed(&self, online: bool) -> Result<(), ConnectionError> {
        self.command(Command::ConnectivityChanged { online })
    }

    /// Wait until the connection reaches `state`
    pub async fn wait_for_state(
        &self,
        state: ConnectionState,
    ) -> Result<ConnectionSnapshot, ConnectionError> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(|snapshot| snapshot.state == state)
            .await
            .map_err(|_| ConnectionError::EngineStopped)?;
        Ok(snapshot.clone())
    }

    /// Token that lets a later engine recover this session
    ///
    /// `None` until a session key has been assigned.
    pub fn recovery_token(&self) -> Option<String> {
        let snapshot = self.snapshot.borrow();
        let key = snapshot.connection_key.clone()?;
        Some(
            RecoveryToken::new(
                key,
                snapshot.next_msg_serial,
                snapshot.serial,
                self.clock.now_ms(),
            )
            .encode(),
        )
    }

    /// Subscribe to state changes and transport notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Subscribe to application messages from the server
    pub fn inbound(&self) -> broadcast::Receiver<ProtocolMessage> {
        self.inbound.subscribe()
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    /// Server connection id, while a session is held
    pub fn connection_id(&self) -> Option<String> {
        self.snapshot.borrow().connection_id.clone()
    }

    /// Session key, while a session is held
    pub fn connection_key(&self) -> Option<String> {
        self.snapshot.borrow().connection_key.clone()
    }

    /// Most recent error reason
    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.snapshot.borrow().error_reason.clone()
    }

    /// Kind and host of the authoritative transport
    pub fn active_transport(&self) -> Option<(TransportKind, String)> {
        self.snapshot.borrow().active_transport.clone()
    }
}

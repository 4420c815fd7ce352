//! Core transport trait definitions
//!
//! A factory opens a transport and hands back the transport together with its
//! event stream. The stream yields inbound protocol messages in order and ends
//! with at most one [`TransportEvent::Closed`]. After [`Transport::close`] the
//! stream yields nothing further.

use crate::error::TransportResult;
use crate::params::TransportParams;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tether_core::{ErrorInfo, ProtocolMessage, TransportKind};
use tokio::sync::mpsc;

/// Why a transport stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed locally or by an orderly handshake
    Clean,
    /// Server ended the transport, optionally with a reason
    ServerInitiated(Option<ErrorInfo>),
    /// Link failed underneath the transport
    NetworkFailure(ErrorInfo),
}

impl CloseReason {
    /// Error describing the closure, for the engine to classify
    pub fn to_error_info(&self) -> ErrorInfo {
        match self {
            CloseReason::Clean => ErrorInfo::disconnected("transport closed"),
            CloseReason::ServerInitiated(Some(error)) => error.clone(),
            CloseReason::ServerInitiated(None) => ErrorInfo::disconnected("closed by server"),
            CloseReason::NetworkFailure(error) => error.clone(),
        }
    }
}

/// Event emitted by an open transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Inbound protocol message
    Message(ProtocolMessage),
    /// Transport has stopped; no further events follow
    Closed(CloseReason),
}

/// One open channel to one host
pub trait Transport: Send + Sync + fmt::Debug {
    /// Kind of this transport
    fn kind(&self) -> TransportKind;

    /// Host this transport is connected to
    fn host(&self) -> &str;

    /// Queue messages for sending, preserving order across calls
    fn send(&self, messages: Vec<ProtocolMessage>) -> TransportResult<()>;

    /// Close the transport; calling this more than once has no further effect
    fn close(&self);

    /// Whether [`Transport::close`] has been called or the link has gone
    fn is_closed(&self) -> bool;
}

/// An open transport and the stream of its events
#[derive(Debug)]
pub struct TransportConnection {
    /// Handle used to send and close
    pub transport: Arc<dyn Transport>,
    /// Inbound events in arrival order
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Creates transports of one kind
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Kind produced by this factory
    fn kind(&self) -> TransportKind;

    /// Whether this kind can run in the current environment
    fn is_available(&self) -> bool {
        true
    }

    /// Open a transport to `params.host`
    ///
    /// Resolves once the link is open. Protocol-level readiness arrives later
    /// as a `CONNECTED` message on the event stream.
    async fn connect(&self, params: TransportParams) -> TransportResult<TransportConnection>;
}

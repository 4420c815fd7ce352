//! Protocol message model
//!
//! [`ProtocolMessage`] is the unit exchanged over every transport. The engine
//! only inspects the connection-level fields; `payload` stays opaque.

use crate::error::ErrorInfo;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Protocol message action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    /// Liveness probe or response
    Heartbeat,
    /// Positive acknowledgement of a serial range
    Ack,
    /// Negative acknowledgement of a serial range
    Nack,
    /// Client connect request
    Connect,
    /// Server accepted the connection
    Connected,
    /// Client requests a disconnect
    Disconnect,
    /// Server dropped the connection
    Disconnected,
    /// Client requests a clean close
    Close,
    /// Server confirmed close
    Closed,
    /// Connection or channel error
    Error,
    /// Channel attach request
    Attach,
    /// Channel attached
    Attached,
    /// Channel detach request
    Detach,
    /// Channel detached
    Detached,
    /// Presence update
    Presence,
    /// Channel message
    Message,
    /// Channel state synchronisation
    Sync,
}

impl Action {
    /// Actions that belong to the connection layer and are never submitted by
    /// the application
    pub fn is_connection_control(self) -> bool {
        matches!(
            self,
            Action::Heartbeat
                | Action::Ack
                | Action::Nack
                | Action::Connect
                | Action::Connected
                | Action::Disconnect
                | Action::Disconnected
                | Action::Close
                | Action::Closed
                | Action::Error
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Heartbeat => "HEARTBEAT",
            Action::Ack => "ACK",
            Action::Nack => "NACK",
            Action::Connect => "CONNECT",
            Action::Connected => "CONNECTED",
            Action::Disconnect => "DISCONNECT",
            Action::Disconnected => "DISCONNECTED",
            Action::Close => "CLOSE",
            Action::Closed => "CLOSED",
            Action::Error => "ERROR",
            Action::Attach => "ATTACH",
            Action::Attached => "ATTACHED",
            Action::Detach => "DETACH",
            Action::Detached => "DETACHED",
            Action::Presence => "PRESENCE",
            Action::Message => "MESSAGE",
            Action::Sync => "SYNC",
        };
        f.write_str(name)
    }
}

/// Session parameters returned by the server with `CONNECTED`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetails {
    /// Opaque key identifying a resumable session
    pub connection_key: String,
    /// Client identity bound to the connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Longest gap between server transmissions, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_idle_interval: Option<u64>,
    /// How long the server keeps a disconnected session, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_state_ttl: Option<u64>,
    /// Largest accepted message, in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_message_size: Option<usize>,
}

impl ConnectionDetails {
    /// Details carrying only a connection key
    pub fn new(connection_key: impl Into<String>) -> Self {
        Self {
            connection_key: connection_key.into(),
            ..Self::default()
        }
    }

    /// Idle interval as a duration
    pub fn max_idle_interval(&self) -> Option<Duration> {
        self.max_idle_interval.map(Duration::from_millis)
    }

    /// Server supplied state TTL as a duration
    pub fn connection_state_ttl(&self) -> Option<Duration> {
        self.connection_state_ttl.map(Duration::from_millis)
    }
}

/// Unit exchanged between client and server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolMessage {
    /// What this message means
    pub action: Action,
    /// Correlation id, used by heartbeats
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Channel the message belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Outbound sequence number, or first serial of an ACK/NACK range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_serial: Option<u64>,
    /// Number of serials covered by an ACK/NACK
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    /// Server connection id, set on `CONNECTED`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    /// Inbound sequence number assigned by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_serial: Option<u64>,
    /// Session parameters, set on `CONNECTED`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_details: Option<ConnectionDetails>,
    /// Opaque application payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Error detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl ProtocolMessage {
    /// Message with only an action set
    pub fn new(action: Action) -> Self {
        Self {
            action,
            id: None,
            channel: None,
            msg_serial: None,
            count: None,
            connection_id: None,
            connection_serial: None,
            connection_details: None,
            payload: None,
            error: None,
        }
    }

    /// Channel message with a payload
    pub fn message(channel: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(Action::Message)
            .with_channel(channel)
            .with_payload(payload)
    }

    /// Heartbeat carrying a correlation id
    pub fn heartbeat(id: impl Into<String>) -> Self {
        Self::new(Action::Heartbeat).with_id(id)
    }

    /// ACK for `count` serials starting at `msg_serial`
    pub fn ack(msg_serial: u64, count: u32) -> Self {
        let mut message = Self::new(Action::Ack);
        message.msg_serial = Some(msg_serial);
        message.count = Some(count);
        message
    }

    /// NACK for `count` serials starting at `msg_serial`
    pub fn nack(msg_serial: u64, count: u32, error: ErrorInfo) -> Self {
        Self::ack(msg_serial, count)
            .with_action(Action::Nack)
            .with_error(error)
    }

    /// Server acceptance of a connection
    pub fn connected(connection_id: impl Into<String>, details: ConnectionDetails) -> Self {
        let mut message = Self::new(Action::Connected);
        message.connection_id = Some(connection_id.into());
        message.connection_details = Some(details);
        message
    }

    /// Connection-level error
    pub fn error(error: ErrorInfo) -> Self {
        Self::new(Action::Error).with_error(error)
    }

    /// Replace the action
    pub fn with_action(mut self, action: Action) -> Self {
        self.action = action;
        self
    }

    /// Set the correlation id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the channel
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Set the payload
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Set the error
    pub fn with_error(mut self, error: ErrorInfo) -> Self {
        self.error = Some(error);
        self
    }

    /// Set the inbound connection serial
    pub fn with_connection_serial(mut self, serial: u64) -> Self {
        self.connection_serial = Some(serial);
        self
    }

    /// Serial range `[from, from + count)` carried by an ACK/NACK
    pub fn ack_range(&self) -> Option<(u64, u32)> {
        match (self.action, self.msg_serial) {
            (Action::Ack | Action::Nack, Some(serial)) => Some((serial, self.count.unwrap_or(1))),
            _ => None,
        }
    }
}

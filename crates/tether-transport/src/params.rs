//! Parameters for one transport attempt

use tether_core::RecoveryToken;

/// How the server should treat the new transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectMode {
    /// Start a fresh session
    New,
    /// Re-attach to a live session after a brief drop
    Resume {
        /// Key of the session being resumed
        connection_key: String,
        /// Last inbound serial the client applied
        connection_serial: Option<u64>,
    },
    /// Re-establish a session from an exported token
    Recover {
        /// Opaque token as handed over by the application
        recovery_key: String,
        /// Decoded token contents
        token: RecoveryToken,
    },
}

impl ConnectMode {
    /// Short name for logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectMode::New => "new",
            ConnectMode::Resume { .. } => "resume",
            ConnectMode::Recover { .. } => "recover",
        }
    }

    /// Session key the server is asked to continue, if any
    pub fn connection_key(&self) -> Option<&str> {
        match self {
            ConnectMode::New => None,
            ConnectMode::Resume { connection_key, .. } => Some(connection_key),
            ConnectMode::Recover { token, .. } => Some(&token.connection_key),
        }
    }
}

/// Everything a factory needs to open one transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParams {
    /// Host to connect to
    pub host: String,
    /// Session handling requested from the server
    pub mode: ConnectMode,
    /// Whether the server should send heartbeats on this transport
    pub heartbeats: bool,
}

impl TransportParams {
    /// Parameters for a fresh session on `host`
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            mode: ConnectMode::New,
            heartbeats: false,
        }
    }

    /// Set the connect mode
    pub fn with_mode(mut self, mode: ConnectMode) -> Self {
        self.mode = mode;
        self
    }

    /// Request server heartbeats
    pub fn with_heartbeats(mut self, heartbeats: bool) -> Self {
        self.heartbeats = heartbeats;
        self
    }
}

//! Transport kinds known to the engine

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of transport kinds, highest default priority first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Full-duplex socket
    WebSocket,
    /// HTTP streaming with a separate send leg
    XhrStreaming,
    /// HTTP long-poll with a separate send leg
    XhrPolling,
}

impl TransportKind {
    /// Default priority order
    pub const DEFAULT_ORDER: [TransportKind; 3] = [
        TransportKind::WebSocket,
        TransportKind::XhrStreaming,
        TransportKind::XhrPolling,
    ];

    /// Whether the transport reports liveness on its own
    pub fn has_native_liveness(self) -> bool {
        matches!(self, TransportKind::WebSocket)
    }

    /// Whether sends and receives travel on separate legs
    pub fn is_half_duplex(self) -> bool {
        !matches!(self, TransportKind::WebSocket)
    }

    /// Stable name used in logs and config
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::WebSocket => "web_socket",
            TransportKind::XhrStreaming => "xhr_streaming",
            TransportKind::XhrPolling => "xhr_polling",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

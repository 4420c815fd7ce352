//! Tether Core - Connection Vocabulary
//!
//! Types shared by the transport layer and the connection engine: the protocol
//! message model, error classification, connection states, recovery tokens and
//! the configuration consumed by the engine.
//!
//! Nothing in this crate performs I/O. Time is reached through [`WallClock`] so
//! callers can substitute a controllable source in tests.

pub mod config;
pub mod error;
pub mod protocol;
pub mod recovery;
pub mod state;
pub mod time;
pub mod transport_kind;

pub use config::{ConfigError, ConnectionConfig};
pub use error::{codes, ErrorInfo, ErrorKind};
pub use protocol::{Action, ConnectionDetails, ProtocolMessage};
pub use recovery::{RecoveryToken, RecoveryTokenError};
pub use state::{ConnectionSnapshot, ConnectionState, StateChange};
pub use time::{SystemClock, WallClock};
pub use transport_kind::TransportKind;

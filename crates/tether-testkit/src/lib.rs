//! Tether Testing Infrastructure
//!
//! Shared fixtures for exercising the connection engine end to end without a
//! network: a scriptable [`MockServer`] that hands out in-memory transports, a
//! [`ManualClock`] for recovery-token timestamps, a switchable
//! [`ManualConnectivity`] check and a tracing initializer.
//!
//! ```rust,no_run
//! use tether_testkit::{HostBehavior, MockServer};
//! use tether_core::{ErrorInfo, TransportKind};
//!
//! let server = MockServer::new();
//! server.set_host("primary.test", HostBehavior::Refuse(ErrorInfo::timeout("down")));
//! let registry = server.registry(&[TransportKind::WebSocket]);
//! ```

pub mod clock;
pub mod connectivity;
pub mod logging;
pub mod mock_server;

pub use clock::ManualClock;
pub use connectivity::ManualConnectivity;
pub use logging::init_test_tracing;
pub use mock_server::{AttemptRecord, HostBehavior, MockServer, ServerConnection};

use std::time::Duration;

/// Let spawned tasks run until they are idle
///
/// Under a paused runtime this also advances time by one millisecond.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

//! Tether Connection - Connection Lifecycle Engine
//!
//! Keeps one logical realtime session alive over a sequence of physical
//! transports. A [`ConnectionManager`] spawns a single-task engine and hands
//! back a [`Connection`] handle; everything that can change connection state
//! is serialized through that engine.
//!
//! The engine is composed from small synchronous parts that are tested on
//! their own:
//! - [`state_machine`]: the lifecycle table and session identity
//! - [`queue`]: serial assignment and ACK/NACK resolution for submissions
//! - [`fallback`]: host ordering with a cached working fallback
//! - [`retry`]: reconnect delays
//! - [`heartbeat`]: transport liveness
//! - [`timers`]: engine deadlines
//!
//! # Example
//!
//! ```ignore
//! let manager = ConnectionManager::new(config, registry, Arc::new(SystemClock))?;
//! let connection = manager.spawn();
//! connection.connect().await?;
//! connection
//!     .send(ProtocolMessage::message("chat", json!({"text": "hi"})))
//!     .await?;
//! ```

pub mod attempt;
pub mod error;
pub mod fallback;
pub mod handle;
pub mod heartbeat;
pub mod manager;
pub mod queue;
pub mod retry;
pub mod state_machine;
pub mod timers;

pub use error::ConnectionError;
pub use fallback::{FallbackHostEntry, HostFallbackPolicy, HostPlan};
pub use handle::{Connection, ConnectionEvent};
pub use heartbeat::{HeartbeatAction, HeartbeatMonitor, LivenessMode};
pub use manager::{ConnectionManager, EVENT_CAPACITY};
pub use queue::{AckOutcome, CompletionResult, MessageCompletion, PendingMessage, PendingMessageQueue};
pub use retry::RetryPolicy;
pub use state_machine::{ConnectionStateMachine, InvalidTransition, Trigger};
pub use timers::{TimerKind, Timers};

pub use tether_core::{ConnectionSnapshot, ConnectionState, ErrorInfo, StateChange};

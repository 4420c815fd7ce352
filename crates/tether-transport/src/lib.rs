//! Tether Transport - Pluggable Transport Contract
//!
//! A transport is one bidirectional channel to one host. The connection engine
//! only ever sees the [`Transport`] and [`TransportFactory`] traits; concrete
//! socket, streaming and polling implementations live outside this workspace
//! and register themselves through a [`TransportRegistry`] in priority order.
//!
//! Two adapters ship here:
//! - [`memory`]: an in-process duplex transport used by tests and simulations
//! - [`paired`]: turns a separate send leg and receive leg into one ordered
//!   transport, for half-duplex kinds such as long-polling

pub mod codec;
pub mod connectivity;
pub mod error;
pub mod memory;
pub mod paired;
pub mod params;
pub mod registry;
mod sink;
pub mod traits;

pub use codec::{CodecError, JsonCodec, ProtocolCodec};
pub use connectivity::ConnectivityCheck;
pub use error::{TransportError, TransportResult};
pub use memory::{
    memory_duplex, memory_half_duplex, MemoryPeer, MemoryPeerReceiver, PeerFrame, PeerSender,
};
pub use paired::{PairedTransport, PollBatch, ReceiveLeg, SendLeg};
pub use params::{ConnectMode, TransportParams};
pub use registry::TransportRegistry;
pub use traits::{CloseReason, Transport, TransportConnection, TransportEvent, TransportFactory};

pub use tether_core::TransportKind;

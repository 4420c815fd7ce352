//! Internet connectivity check
//!
//! Before walking the fallback hosts the engine asks a [`ConnectivityCheck`]
//! whether the network is reachable at all. When it is not, the attempt ends
//! as `disconnected` without trying the fallbacks.

use async_trait::async_trait;
use std::fmt;

/// Reports whether the host environment can reach the internet
#[async_trait]
pub trait ConnectivityCheck: Send + Sync + fmt::Debug {
    /// `true` when a well-known endpoint answered
    async fn is_online(&self) -> bool;
}

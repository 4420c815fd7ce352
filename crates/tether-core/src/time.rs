//! Wall-clock access
//!
//! Timers inside the engine run on the async runtime's monotonic clock. Values
//! that must survive a process restart, such as the issue time of a recovery
//! token, are stamped from a [`WallClock`] instead.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock time in milliseconds since the Unix epoch
pub trait WallClock: Send + Sync + fmt::Debug {
    /// Current time in milliseconds
    fn now_ms(&self) -> u64;
}

/// Wall clock backed by the operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now_ms(&self) -> u64 {
        // A clock set before the epoch reads as zero
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

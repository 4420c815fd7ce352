//! Switchable internet connectivity

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tether_transport::ConnectivityCheck;

/// Connectivity check answered from a flag the test controls
#[derive(Debug, Clone)]
pub struct ManualConnectivity {
    online: Arc<AtomicBool>,
    checks: Arc<AtomicUsize>,
}

impl ManualConnectivity {
    /// Check reporting `online` until changed
    pub fn new(online: bool) -> Self {
        Self {
            online: Arc::new(AtomicBool::new(online)),
            checks: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Change what later checks report
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Number of checks made so far
    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectivityCheck for ManualConnectivity {
    async fn is_online(&self) -> bool {
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.online.load(Ordering::SeqCst)
    }
}

//! Shared event sink for transports backed by background tasks

use crate::traits::{CloseReason, TransportEvent};
use parking_lot::Mutex;
use std::sync::Arc;
use tether_core::ProtocolMessage;
use tokio::sync::mpsc;

/// Emits transport events until finished or shut down
///
/// Guarantees at most one `Closed` event and nothing after it, even when
/// several tasks race to report the end of the transport.
#[derive(Debug)]
pub(crate) struct EventSink {
    tx: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
}

impl EventSink {
    pub(crate) fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
        });
        (sink, rx)
    }

    /// Forward an inbound message; false once the sink is closed
    pub(crate) fn message(&self, message: ProtocolMessage) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(TransportEvent::Message(message)).is_ok(),
            None => false,
        }
    }

    /// Emit the terminal event
    pub(crate) fn finish(&self, reason: CloseReason) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(TransportEvent::Closed(reason));
        }
    }

    /// Stop emitting without a terminal event
    pub(crate) fn shutdown(&self) {
        self.tx.lock().take();
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.tx.lock().is_none()
    }
}

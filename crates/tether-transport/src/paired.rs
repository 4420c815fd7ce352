//! Half-duplex transport pairing
//!
//! Polling and streaming kinds send on one leg and receive on another. The
//! [`PairedTransport`] drives both legs from background tasks and presents
//! them as one [`Transport`] with a single ordered event stream.

use crate::error::{TransportError, TransportResult};
use crate::sink::EventSink;
use crate::traits::{CloseReason, Transport, TransportConnection};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tether_core::{ProtocolMessage, TransportKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Messages returned by one receive-leg poll
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollBatch {
    /// Inbound messages in arrival order
    pub messages: Vec<ProtocolMessage>,
    /// Set when the server ended the receive leg after these messages
    pub end: Option<CloseReason>,
}

/// Outbound leg of a half-duplex transport
#[async_trait]
pub trait SendLeg: Send + Sync + 'static {
    /// Deliver a batch of messages in order
    async fn send(&self, batch: Vec<ProtocolMessage>) -> TransportResult<()>;
}

/// Inbound leg of a half-duplex transport
#[async_trait]
pub trait ReceiveLeg: Send + 'static {
    /// Wait for the next batch of inbound messages
    async fn poll(&mut self) -> TransportResult<PollBatch>;
}

/// Two legs presented as one transport
pub struct PairedTransport {
    kind: TransportKind,
    host: String,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<ProtocolMessage>>>>,
    sink: Arc<EventSink>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PairedTransport {
    /// Start both legs and return the combined transport
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open<S: SendLeg, R: ReceiveLeg>(
        kind: TransportKind,
        host: impl Into<String>,
        send_leg: S,
        receive_leg: R,
    ) -> TransportConnection {
        let host = host.into();
        let (sink, events) = EventSink::channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let send_task = tokio::spawn(send_loop(send_leg, outbound_rx, Arc::clone(&sink)));
        let poll_task = tokio::spawn(poll_loop(receive_leg, Arc::clone(&sink), host.clone()));

        let transport = PairedTransport {
            kind,
            host,
            outbound: Mutex::new(Some(outbound_tx)),
            sink,
            tasks: Mutex::new(vec![send_task, poll_task]),
            closed: AtomicBool::new(false),
        };
        TransportConnection {
            transport: Arc::new(transport),
            events,
        }
    }
}

impl fmt::Debug for PairedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairedTransport")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Transport for PairedTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn send(&self, messages: Vec<ProtocolMessage>) -> TransportResult<()> {
        if messages.is_empty() {
            return Ok(());
        }
        self.outbound
            .lock()
            .as_ref()
            .ok_or(TransportError::Closed)?
            .send(messages)
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(kind = %self.kind, host = %self.host, "closing paired transport");
        self.sink.shutdown();
        self.outbound.lock().take();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.sink.is_finished()
    }
}

/// Forward queued batches to the send leg, coalescing whatever is waiting
async fn send_loop<S: SendLeg>(
    leg: S,
    mut outbound: mpsc::UnboundedReceiver<Vec<ProtocolMessage>>,
    sink: Arc<EventSink>,
) {
    while let Some(mut batch) = outbound.recv().await {
        while let Ok(more) = outbound.try_recv() {
            batch.extend(more);
        }
        let count = batch.len();
        if let Err(err) = leg.send(batch).await {
            warn!(error = %err, count, "send leg failed");
            sink.finish(CloseReason::NetworkFailure(err.to_error_info()));
            return;
        }
    }
}

/// Poll the receive leg until it ends or fails
async fn poll_loop<R: ReceiveLeg>(mut leg: R, sink: Arc<EventSink>, host: String) {
    info!(host = %host, "starting poll loop");
    loop {
        match leg.poll().await {
            Ok(batch) => {
                for message in batch.messages {
                    if !sink.message(message) {
                        debug!(host = %host, "poll loop: transport closed, exiting");
                        return;
                    }
                }
                if let Some(reason) = batch.end {
                    info!(host = %host, reason = ?reason, "poll loop: receive leg ended");
                    sink.finish(reason);
                    return;
                }
            }
            Err(err) => {
                warn!(host = %host, error = %err, "poll error");
                sink.finish(CloseReason::NetworkFailure(err.to_error_info()));
                return;
            }
        }
    }
}

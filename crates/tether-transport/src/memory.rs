//! In-memory transport implementation
//!
//! [`memory_duplex`] and [`memory_half_duplex`] return the client end as an
//! ordinary [`TransportConnection`] and the server end as a [`MemoryPeer`].
//! Every message crosses the link encoded by a [`ProtocolCodec`], so the same
//! bytes a network transport would carry are exercised in tests.

use crate::codec::ProtocolCodec;
use crate::error::{TransportError, TransportResult};
use crate::paired::{PairedTransport, PollBatch, ReceiveLeg, SendLeg};
use crate::sink::EventSink;
use crate::traits::{CloseReason, Transport, TransportConnection};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tether_core::{ErrorInfo, ProtocolMessage, TransportKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Frame travelling from the server end to the client end
#[derive(Debug, Clone, PartialEq)]
pub enum PeerFrame {
    /// Encoded protocol message
    Data(Vec<u8>),
    /// Server ends the transport
    Close(CloseReason),
}

/// Server end of an in-memory link
pub struct MemoryPeer {
    to_client: PeerSender,
    from_client: MemoryPeerReceiver,
}

/// Cloneable sending half of a [`MemoryPeer`]
#[derive(Clone)]
pub struct PeerSender {
    tx: mpsc::UnboundedSender<PeerFrame>,
    codec: Arc<dyn ProtocolCodec>,
}

impl PeerSender {
    /// Send a message to the client; false if the client end is gone
    pub fn send(&self, message: &ProtocolMessage) -> bool {
        match self.codec.encode(message) {
            Ok(bytes) => self.tx.send(PeerFrame::Data(bytes)).is_ok(),
            Err(err) => {
                warn!(error = %err, "memory peer failed to encode message");
                false
            }
        }
    }

    /// Send raw bytes, bypassing the codec
    pub fn send_raw(&self, bytes: Vec<u8>) -> bool {
        self.tx.send(PeerFrame::Data(bytes)).is_ok()
    }

    /// End the transport from the server side
    pub fn close(&self, reason: CloseReason) {
        let _ = self.tx.send(PeerFrame::Close(reason));
    }

    /// Whether the client end has stopped listening
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl fmt::Debug for PeerSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSender")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl MemoryPeer {
    fn new(
        to_client: mpsc::UnboundedSender<PeerFrame>,
        from_client: mpsc::UnboundedReceiver<Vec<u8>>,
        codec: Arc<dyn ProtocolCodec>,
    ) -> Self {
        Self {
            to_client: PeerSender {
                tx: to_client,
                codec: Arc::clone(&codec),
            },
            from_client: MemoryPeerReceiver { from_client, codec },
        }
    }

    /// Cloneable handle for sending to the client
    pub fn sender(&self) -> PeerSender {
        self.to_client.clone()
    }

    /// Send a message to the client
    pub fn send(&self, message: &ProtocolMessage) -> bool {
        self.to_client.send(message)
    }

    /// End the transport from the server side
    pub fn close(&self, reason: CloseReason) {
        self.to_client.close(reason);
    }

    /// Next message from the client, or `None` once the client closed
    pub async fn recv(&mut self) -> Option<ProtocolMessage> {
        self.from_client.recv().await
    }

    /// Split into the sending and receiving halves
    pub fn split(self) -> (PeerSender, MemoryPeerReceiver) {
        (self.to_client, self.from_client)
    }
}

impl fmt::Debug for MemoryPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPeer")
            .field("to_client", &self.to_client)
            .finish_non_exhaustive()
    }
}

/// Receiving half of a split [`MemoryPeer`]
pub struct MemoryPeerReceiver {
    from_client: mpsc::UnboundedReceiver<Vec<u8>>,
    codec: Arc<dyn ProtocolCodec>,
}

impl MemoryPeerReceiver {
    /// Next message from the client, or `None` once the client closed
    ///
    /// Undecodable frames are logged and skipped.
    pub async fn recv(&mut self) -> Option<ProtocolMessage> {
        loop {
            let bytes = self.from_client.recv().await?;
            match self.codec.decode(&bytes) {
                Ok(message) => return Some(message),
                Err(err) => warn!(error = %err, "memory peer dropped undecodable frame"),
            }
        }
    }
}

/// Client end of a full-duplex in-memory link
pub struct MemoryTransport {
    kind: TransportKind,
    host: String,
    codec: Arc<dyn ProtocolCodec>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    sink: Arc<EventSink>,
    pump: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Transport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn send(&self, messages: Vec<ProtocolMessage>) -> TransportResult<()> {
        let outbound = self.outbound.lock();
        let tx = outbound.as_ref().ok_or(TransportError::Closed)?;
        for message in &messages {
            let bytes = self.codec.encode(message)?;
            tx.send(bytes).map_err(|_| TransportError::Closed)?;
        }
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(kind = %self.kind, host = %self.host, "closing memory transport");
        self.sink.shutdown();
        self.outbound.lock().take();
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
            || self.sink.is_finished()
            || self
                .outbound
                .lock()
                .as_ref()
                .map_or(true, mpsc::UnboundedSender::is_closed)
    }
}

async fn pump(
    mut frames: mpsc::UnboundedReceiver<PeerFrame>,
    sink: Arc<EventSink>,
    codec: Arc<dyn ProtocolCodec>,
) {
    while let Some(frame) = frames.recv().await {
        match frame {
            PeerFrame::Data(bytes) => match codec.decode(&bytes) {
                Ok(message) => {
                    if !sink.message(message) {
                        return;
                    }
                }
                Err(err) => {
                    sink.finish(CloseReason::NetworkFailure(ErrorInfo::protocol(
                        err.to_string(),
                    )));
                    return;
                }
            },
            PeerFrame::Close(reason) => {
                sink.finish(reason);
                return;
            }
        }
    }
    sink.finish(CloseReason::NetworkFailure(ErrorInfo::disconnected(
        "connection reset by peer",
    )));
}

/// Open a full-duplex in-memory link
///
/// Must be called from within a Tokio runtime.
pub fn memory_duplex(
    kind: TransportKind,
    host: impl Into<String>,
    codec: Arc<dyn ProtocolCodec>,
) -> (TransportConnection, MemoryPeer) {
    let host = host.into();
    let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
    let (to_server_tx, to_server_rx) = mpsc::unbounded_channel();
    let (sink, events) = EventSink::channel();

    let pump_task = tokio::spawn(pump(to_client_rx, Arc::clone(&sink), Arc::clone(&codec)));
    let transport = MemoryTransport {
        kind,
        host,
        codec: Arc::clone(&codec),
        outbound: Mutex::new(Some(to_server_tx)),
        sink,
        pump: Mutex::new(Some(pump_task)),
        closed: AtomicBool::new(false),
    };

    let peer = MemoryPeer::new(to_client_tx, to_server_rx, codec);
    (
        TransportConnection {
            transport: Arc::new(transport),
            events,
        },
        peer,
    )
}

struct MemorySendLeg {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    codec: Arc<dyn ProtocolCodec>,
}

#[async_trait]
impl SendLeg for MemorySendLeg {
    async fn send(&self, batch: Vec<ProtocolMessage>) -> TransportResult<()> {
        for message in &batch {
            let bytes = self.codec.encode(message)?;
            self.outbound
                .send(bytes)
                .map_err(|_| TransportError::Closed)?;
        }
        Ok(())
    }
}

struct MemoryReceiveLeg {
    frames: mpsc::UnboundedReceiver<PeerFrame>,
    codec: Arc<dyn ProtocolCodec>,
}

#[async_trait]
impl ReceiveLeg for MemoryReceiveLeg {
    async fn poll(&mut self) -> TransportResult<PollBatch> {
        let mut next = Some(self.frames.recv().await.ok_or(TransportError::Closed)?);
        let mut batch = PollBatch::default();
        while let Some(frame) = next {
            match frame {
                PeerFrame::Data(bytes) => batch.messages.push(self.codec.decode(&bytes)?),
                PeerFrame::Close(reason) => {
                    batch.end = Some(reason);
                    break;
                }
            }
            next = self.frames.try_recv().ok();
        }
        Ok(batch)
    }
}

/// Open a half-duplex in-memory link with separate send and receive legs
///
/// Must be called from within a Tokio runtime.
pub fn memory_half_duplex(
    kind: TransportKind,
    host: impl Into<String>,
    codec: Arc<dyn ProtocolCodec>,
) -> (TransportConnection, MemoryPeer) {
    let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
    let (to_server_tx, to_server_rx) = mpsc::unbounded_channel();

    let connection = PairedTransport::open(
        kind,
        host,
        MemorySendLeg {
            outbound: to_server_tx,
            codec: Arc::clone(&codec),
        },
        MemoryReceiveLeg {
            frames: to_client_rx,
            codec: Arc::clone(&codec),
        },
    );
    let peer = MemoryPeer::new(to_client_tx, to_server_rx, codec);
    (connection, peer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::traits::TransportEvent;
    use assert_matches::assert_matches;
    use tether_core::Action;

    fn codec() -> Arc<dyn ProtocolCodec> {
        Arc::new(JsonCodec)
    }

    #[tokio::test]
    async fn test_duplex_exchange() {
        let (mut client, mut peer) = memory_duplex(TransportKind::WebSocket, "a.test", codec());
        assert_eq!(client.transport.host(), "a.test");

        client
            .transport
            .send(vec![ProtocolMessage::heartbeat("1"), ProtocolMessage::ack(0, 1)])
            .unwrap();
        assert_eq!(peer.recv().await.unwrap().action, Action::Heartbeat);
        assert_eq!(peer.recv().await.unwrap().action, Action::Ack);

        assert!(peer.send(&ProtocolMessage::heartbeat("2")));
        assert_matches!(
            client.events.recv().await,
            Some(TransportEvent::Message(m)) if m.id.as_deref() == Some("2")
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_silences_events() {
        let (mut client, mut peer) = memory_duplex(TransportKind::WebSocket, "a.test", codec());
        client.transport.close();
        client.transport.close();
        assert!(client.transport.is_closed());

        peer.send(&ProtocolMessage::heartbeat("late"));
        assert_eq!(client.events.recv().await, None);
        assert_eq!(peer.recv().await, None);
        assert_matches!(
            client.transport.send(vec![ProtocolMessage::heartbeat("x")]),
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn test_peer_drop_reports_network_failure() {
        let (mut client, peer) = memory_duplex(TransportKind::WebSocket, "a.test", codec());
        drop(peer);
        assert_matches!(
            client.events.recv().await,
            Some(TransportEvent::Closed(CloseReason::NetworkFailure(_)))
        );
        assert_eq!(client.events.recv().await, None);
    }

    #[tokio::test]
    async fn test_server_close_and_bad_frames() {
        let (mut client, peer) = memory_duplex(TransportKind::WebSocket, "a.test", codec());
        let error = ErrorInfo::forbidden("revoked");
        peer.close(CloseReason::ServerInitiated(Some(error.clone())));
        assert_eq!(
            client.events.recv().await,
            Some(TransportEvent::Closed(CloseReason::ServerInitiated(Some(error))))
        );

        let (mut client, peer) = memory_duplex(TransportKind::WebSocket, "a.test", codec());
        peer.sender().send_raw(b"garbage".to_vec());
        assert_matches!(
            client.events.recv().await,
            Some(TransportEvent::Closed(CloseReason::NetworkFailure(e))) if e.is_fatal()
        );
    }

    #[tokio::test]
    async fn test_half_duplex_presents_one_stream() {
        let (mut client, mut peer) =
            memory_half_duplex(TransportKind::XhrPolling, "b.test", codec());
        assert_eq!(client.transport.kind(), TransportKind::XhrPolling);

        for i in 0..3 {
            peer.send(&ProtocolMessage::heartbeat(i.to_string()));
        }
        for i in 0..3 {
            assert_matches!(
                client.events.recv().await,
                Some(TransportEvent::Message(m)) if m.id == Some(i.to_string())
            );
        }

        client
            .transport
            .send(vec![ProtocolMessage::ack(0, 1), ProtocolMessage::ack(1, 1)])
            .unwrap();
        assert_eq!(peer.recv().await.unwrap().msg_serial, Some(0));
        assert_eq!(peer.recv().await.unwrap().msg_serial, Some(1));

        peer.close(CloseReason::Clean);
        assert_eq!(
            client.events.recv().await,
            Some(TransportEvent::Closed(CloseReason::Clean))
        );
    }
}

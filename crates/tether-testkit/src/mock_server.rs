//! Scriptable realtime server
//!
//! [`MockServer`] plays the server side of every transport the engine opens.
//! Each host (optionally per transport kind) is scripted with a
//! [`HostBehavior`]; accepted links answer with `CONNECTED`, acknowledge
//! submitted messages, echo heartbeats and complete the close handshake.
//! Sessions are tracked by connection key so resume and recover behave like
//! the real service until [`MockServer::expire_sessions`] is called.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_core::{Action, ConnectionDetails, ErrorInfo, ProtocolMessage, TransportKind};
use tether_transport::{
    memory_duplex, memory_half_duplex, CloseReason, ConnectMode, JsonCodec, MemoryPeer,
    MemoryPeerReceiver, PeerSender, TransportConnection, TransportError, TransportFactory,
    TransportParams, TransportRegistry, TransportResult,
};
use tracing::debug;

/// How a host responds to a connection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostBehavior {
    /// Open the link and send `CONNECTED`
    Accept,
    /// Open the link and send `CONNECTED` carrying this error
    Degraded(ErrorInfo),
    /// Fail the low-level connect with this error
    Refuse(ErrorInfo),
    /// Never complete the low-level connect
    Hang,
    /// Open the link, then send `ERROR` with this error
    Reject(ErrorInfo),
    /// Open the link and never answer
    Silent,
}

/// One attempt seen by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    /// Transport kind used
    pub kind: TransportKind,
    /// Host attempted
    pub host: String,
    /// `new`, `resume` or `recover`
    pub mode: &'static str,
    /// Session key the client asked to continue
    pub connection_key: Option<String>,
}

#[derive(Debug)]
struct ServerState {
    hosts: HashMap<String, HostBehavior>,
    kind_hosts: HashMap<(TransportKind, String), HostBehavior>,
    scripted: HashMap<(TransportKind, String), VecDeque<HostBehavior>>,
    unavailable: HashSet<TransportKind>,
    attempts: Vec<AttemptRecord>,
    sessions: HashMap<String, String>,
    next_session: u64,
    auto_ack: bool,
    echo_heartbeats: bool,
    answer_close: bool,
    nacks: HashMap<u64, ErrorInfo>,
    details: ConnectionDetails,
    links: Vec<ServerConnection>,
}

impl ServerState {
    fn behavior(&mut self, kind: TransportKind, host: &str) -> HostBehavior {
        let key = (kind, host.to_string());
        if let Some(next) = self.scripted.get_mut(&key).and_then(VecDeque::pop_front) {
            return next;
        }
        self.kind_hosts
            .get(&key)
            .or_else(|| self.hosts.get(host))
            .cloned()
            .unwrap_or(HostBehavior::Accept)
    }

    fn new_session(&mut self) -> (String, String) {
        self.next_session += 1;
        let id = format!("conn-{}", self.next_session);
        let key = format!("key-{}", self.next_session);
        self.sessions.insert(key.clone(), id.clone());
        (id, key)
    }

    /// `CONNECTED` for the session requested by `mode`
    fn connected_for(&mut self, mode: &ConnectMode) -> ProtocolMessage {
        let requested = mode.connection_key().map(str::to_string);
        let existing = requested
            .as_ref()
            .and_then(|key| self.sessions.get(key).cloned().map(|id| (id, key.clone())));

        let (id, key, error) = match (existing, requested) {
            (Some((id, key)), _) => (id, key, None),
            (None, Some(key)) => {
                let (id, new_key) = self.new_session();
                let error = ErrorInfo::recovery_expired(format!("session {key} is no longer available"));
                (id, new_key, Some(error))
            }
            (None, None) => {
                let (id, key) = self.new_session();
                (id, key, None)
            }
        };

        let mut details = self.details.clone();
        details.connection_key = key;
        let connected = ProtocolMessage::connected(id, details);
        match error {
            Some(error) => connected.with_error(error),
            None => connected,
        }
    }
}

/// In-process stand-in for the realtime service
#[derive(Debug, Clone)]
pub struct MockServer {
    state: Arc<Mutex<ServerState>>,
}

impl Default for MockServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockServer {
    /// Server that accepts every host, acknowledges and echoes heartbeats
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState {
                hosts: HashMap::new(),
                kind_hosts: HashMap::new(),
                scripted: HashMap::new(),
                unavailable: HashSet::new(),
                attempts: Vec::new(),
                sessions: HashMap::new(),
                next_session: 0,
                auto_ack: true,
                echo_heartbeats: true,
                answer_close: true,
                nacks: HashMap::new(),
                details: ConnectionDetails::new(""),
                links: Vec::new(),
            })),
        }
    }

    /// Factory producing transports of `kind` against this server
    pub fn factory(&self, kind: TransportKind) -> Arc<dyn TransportFactory> {
        Arc::new(MockFactory {
            kind,
            server: self.clone(),
        })
    }

    /// Registry with one factory per kind, in the given order
    pub fn registry(&self, kinds: &[TransportKind]) -> TransportRegistry {
        kinds
            .iter()
            .fold(TransportRegistry::new(), |registry, kind| {
                registry.with(self.factory(*kind))
            })
    }

    /// Script `host` for every transport kind
    pub fn set_host(&self, host: &str, behavior: HostBehavior) {
        self.state.lock().hosts.insert(host.to_string(), behavior);
    }

    /// Script `host` for one transport kind, overriding [`MockServer::set_host`]
    pub fn set_kind_host(&self, kind: TransportKind, host: &str, behavior: HostBehavior) {
        self.state
            .lock()
            .kind_hosts
            .insert((kind, host.to_string()), behavior);
    }

    /// Answer the next attempts of `kind` on `host` with `behaviors`, in order
    ///
    /// Once the script is used up the standing behavior applies again.
    pub fn script(
        &self,
        kind: TransportKind,
        host: &str,
        behaviors: impl IntoIterator<Item = HostBehavior>,
    ) {
        self.state
            .lock()
            .scripted
            .entry((kind, host.to_string()))
            .or_default()
            .extend(behaviors);
    }

    /// Mark a transport kind as unusable in this environment
    pub fn set_available(&self, kind: TransportKind, available: bool) {
        let mut state = self.state.lock();
        if available {
            state.unavailable.remove(&kind);
        } else {
            state.unavailable.insert(kind);
        }
    }

    /// Acknowledge submitted messages automatically
    pub fn set_auto_ack(&self, auto_ack: bool) {
        self.state.lock().auto_ack = auto_ack;
    }

    /// Echo client heartbeats
    pub fn set_echo_heartbeats(&self, echo: bool) {
        self.state.lock().echo_heartbeats = echo;
    }

    /// Complete the close handshake when the client sends `CLOSE`
    pub fn set_answer_close(&self, answer: bool) {
        self.state.lock().answer_close = answer;
    }

    /// Refuse the message with `serial` instead of acknowledging it
    pub fn nack_serial(&self, serial: u64, error: ErrorInfo) {
        self.state.lock().nacks.insert(serial, error);
    }

    /// Idle interval advertised in `CONNECTED`
    pub fn set_max_idle_interval(&self, interval: Option<Duration>) {
        self.state.lock().details.max_idle_interval = interval.map(duration_ms);
    }

    /// State TTL advertised in `CONNECTED`
    pub fn set_connection_state_ttl(&self, ttl: Option<Duration>) {
        self.state.lock().details.connection_state_ttl = ttl.map(duration_ms);
    }

    /// Message size limit advertised in `CONNECTED`
    pub fn set_max_message_size(&self, limit: Option<usize>) {
        self.state.lock().details.max_message_size = limit;
    }

    /// Forget every session so resume and recover start fresh ones
    pub fn expire_sessions(&self) {
        self.state.lock().sessions.clear();
    }

    /// Attempts seen so far, in order
    pub fn attempts(&self) -> Vec<AttemptRecord> {
        self.state.lock().attempts.clone()
    }

    /// Hosts attempted so far, in order
    pub fn attempted_hosts(&self) -> Vec<String> {
        self.attempts().into_iter().map(|a| a.host).collect()
    }

    /// Forget recorded attempts
    pub fn clear_attempts(&self) {
        self.state.lock().attempts.clear();
    }

    /// Every link opened so far, oldest first
    pub fn connections(&self) -> Vec<ServerConnection> {
        self.state.lock().links.clone()
    }

    /// Most recently opened link
    pub fn latest(&self) -> Option<ServerConnection> {
        self.state.lock().links.last().cloned()
    }

    /// Links whose client end is still open
    pub fn live_connections(&self) -> usize {
        self.state
            .lock()
            .links
            .iter()
            .filter(|link| link.is_open())
            .count()
    }

    /// Serials of submitted messages received on any link, in arrival order
    pub fn received_serials(&self) -> Vec<u64> {
        self.connections()
            .iter()
            .flat_map(ServerConnection::received_serials)
            .collect()
    }

    fn open_link(
        &self,
        kind: TransportKind,
        host: &str,
        behavior: &HostBehavior,
        mode: &ConnectMode,
        peer: MemoryPeer,
    ) {
        let (sender, receiver) = peer.split();
        let greeting = match behavior {
            HostBehavior::Accept => Some(self.state.lock().connected_for(mode)),
            HostBehavior::Degraded(error) => Some(
                self.state
                    .lock()
                    .connected_for(mode)
                    .with_error(error.clone()),
            ),
            HostBehavior::Reject(error) => Some(ProtocolMessage::error(error.clone())),
            _ => None,
        };

        let link = ServerConnection {
            inner: Arc::new(LinkInner {
                kind,
                host: host.to_string(),
                connection_id: greeting.as_ref().and_then(|m| m.connection_id.clone()),
                sender,
                received: Mutex::new(Vec::new()),
                open: AtomicBool::new(true),
            }),
        };
        self.state.lock().links.push(link.clone());

        if let Some(greeting) = greeting {
            link.send(&greeting);
        }
        tokio::spawn(serve(self.clone(), link, receiver));
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Answer client traffic on one link until the client goes away
async fn serve(server: MockServer, link: ServerConnection, mut receiver: MemoryPeerReceiver) {
    while let Some(message) = receiver.recv().await {
        link.inner.received.lock().push(message.clone());
        match message.action {
            Action::Heartbeat => {
                if server.state.lock().echo_heartbeats {
                    link.send(&message);
                }
            }
            Action::Close => {
                if !server.state.lock().answer_close {
                    continue;
                }
                link.send(&ProtocolMessage::new(Action::Closed));
                link.close_with(CloseReason::Clean);
            }
            _ => {
                if let Some(serial) = message.msg_serial {
                    let reply = {
                        let mut state = server.state.lock();
                        if !state.auto_ack {
                            None
                        } else if let Some(error) = state.nacks.remove(&serial) {
                            Some(ProtocolMessage::nack(serial, 1, error))
                        } else {
                            Some(ProtocolMessage::ack(serial, 1))
                        }
                    };
                    if let Some(reply) = reply {
                        link.send(&reply);
                    }
                }
            }
        }
    }
    debug!(host = %link.host(), kind = %link.kind(), "mock link closed by client");
    link.inner.open.store(false, Ordering::SeqCst);
}

#[derive(Debug)]
struct LinkInner {
    kind: TransportKind,
    host: String,
    connection_id: Option<String>,
    sender: PeerSender,
    received: Mutex<Vec<ProtocolMessage>>,
    open: AtomicBool,
}

/// Server end of one opened link
#[derive(Debug, Clone)]
pub struct ServerConnection {
    inner: Arc<LinkInner>,
}

impl ServerConnection {
    /// Transport kind of the link
    pub fn kind(&self) -> TransportKind {
        self.inner.kind
    }

    /// Host the link was opened against
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// Connection id announced on this link
    pub fn connection_id(&self) -> Option<&str> {
        self.inner.connection_id.as_deref()
    }

    /// Push a message to the client
    pub fn send(&self, message: &ProtocolMessage) -> bool {
        self.inner.sender.send(message)
    }

    /// End the link with `reason`
    pub fn close_with(&self, reason: CloseReason) {
        self.inner.sender.close(reason);
    }

    /// Simulate the network dropping the link
    pub fn drop_link(&self) {
        self.close_with(CloseReason::NetworkFailure(ErrorInfo::disconnected(
            "link dropped",
        )));
    }

    /// Everything the client sent on this link
    pub fn received(&self) -> Vec<ProtocolMessage> {
        self.inner.received.lock().clone()
    }

    /// Serials of submitted messages received on this link
    pub fn received_serials(&self) -> Vec<u64> {
        self.inner
            .received
            .lock()
            .iter()
            .filter(|m| !m.action.is_connection_control())
            .filter_map(|m| m.msg_serial)
            .collect()
    }

    /// Whether the client end is still open
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }
}

struct MockFactory {
    kind: TransportKind,
    server: MockServer,
}

#[async_trait]
impl TransportFactory for MockFactory {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn is_available(&self) -> bool {
        !self.server.state.lock().unavailable.contains(&self.kind)
    }

    async fn connect(&self, params: TransportParams) -> TransportResult<TransportConnection> {
        let behavior = {
            let mut state = self.server.state.lock();
            state.attempts.push(AttemptRecord {
                kind: self.kind,
                host: params.host.clone(),
                mode: params.mode.as_str(),
                connection_key: params.mode.connection_key().map(str::to_string),
            });
            if state.unavailable.contains(&self.kind) {
                return Err(TransportError::Unavailable(self.kind));
            }
            state.behavior(self.kind, &params.host)
        };

        match &behavior {
            HostBehavior::Refuse(error) => {
                return Err(TransportError::connect_failed(&params.host, error.clone()))
            }
            HostBehavior::Hang => std::future::pending::<()>().await,
            _ => {}
        }

        let codec = Arc::new(JsonCodec);
        let (connection, peer) = if self.kind.is_half_duplex() {
            memory_half_duplex(self.kind, &params.host, codec)
        } else {
            memory_duplex(self.kind, &params.host, codec)
        };
        self.server
            .open_link(self.kind, &params.host, &behavior, &params.mode, peer);
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tether_core::RecoveryToken;
    use tether_transport::TransportEvent;

    async fn connected(server: &MockServer, mode: ConnectMode) -> (TransportConnection, ProtocolMessage) {
        let mut connection = server
            .factory(TransportKind::WebSocket)
            .connect(TransportParams::new("primary.test").with_mode(mode))
            .await
            .unwrap();
        let message = match connection.events.recv().await {
            Some(TransportEvent::Message(message)) => message,
            other => panic!("expected CONNECTED, got {other:?}"),
        };
        (connection, message)
    }

    #[tokio::test]
    async fn test_sessions_resume_until_expired() {
        let server = MockServer::new();
        let (_first, hello) = connected(&server, ConnectMode::New).await;
        let key = hello.connection_details.as_ref().unwrap().connection_key.clone();
        assert_eq!(hello.connection_id.as_deref(), Some("conn-1"));

        let resume = ConnectMode::Resume {
            connection_key: key.clone(),
            connection_serial: None,
        };
        let (_second, again) = connected(&server, resume.clone()).await;
        assert_eq!(again.connection_id.as_deref(), Some("conn-1"));
        assert!(again.error.is_none());

        server.expire_sessions();
        let (_third, fresh) = connected(&server, resume).await;
        assert_eq!(fresh.connection_id.as_deref(), Some("conn-2"));
        assert_matches!(fresh.error, Some(e) if e.code == 80008);

        let token = RecoveryToken::new(key, 0, None, 0);
        let (_fourth, recovered) = connected(
            &server,
            ConnectMode::Recover {
                recovery_key: token.encode(),
                token,
            },
        )
        .await;
        assert_eq!(recovered.connection_id.as_deref(), Some("conn-3"));
        assert_eq!(server.attempts().len(), 4);
        assert_eq!(server.attempts()[1].mode, "resume");
    }

    #[tokio::test]
    async fn test_degraded_host_keeps_session_but_reports_error() {
        let server = MockServer::new();
        let (_first, hello) = connected(&server, ConnectMode::New).await;
        let key = hello.connection_details.as_ref().unwrap().connection_key.clone();

        server.script(
            TransportKind::WebSocket,
            "primary.test",
            [HostBehavior::Degraded(ErrorInfo::disconnected("continuity interrupted"))],
        );
        let (_second, degraded) = connected(
            &server,
            ConnectMode::Resume {
                connection_key: key,
                connection_serial: None,
            },
        )
        .await;
        assert_eq!(degraded.connection_id.as_deref(), Some("conn-1"));
        assert_matches!(degraded.error, Some(e) if e.message == "continuity interrupted");
    }

    #[tokio::test]
    async fn test_acks_nacks_and_heartbeats() {
        let server = MockServer::new();
        server.nack_serial(1, ErrorInfo::message_rejected("nope"));
        let (mut connection, _) = connected(&server, ConnectMode::New).await;

        let mut first = ProtocolMessage::message("c", serde_json::Value::Null);
        first.msg_serial = Some(0);
        let mut second = first.clone();
        second.msg_serial = Some(1);
        connection
            .transport
            .send(vec![first, second, ProtocolMessage::heartbeat("hb")])
            .unwrap();

        let mut replies = Vec::new();
        for _ in 0..3 {
            match connection.events.recv().await {
                Some(TransportEvent::Message(m)) => replies.push(m.action),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(replies, vec![Action::Ack, Action::Nack, Action::Heartbeat]);
        assert_eq!(server.received_serials(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_scripted_hosts() {
        let server = MockServer::new();
        server.set_host("primary.test", HostBehavior::Refuse(ErrorInfo::timeout("slow")));
        server.set_kind_host(TransportKind::WebSocket, "primary.test", HostBehavior::Accept);

        let polling = server
            .factory(TransportKind::XhrPolling)
            .connect(TransportParams::new("primary.test"))
            .await;
        assert_matches!(polling, Err(TransportError::ConnectFailed { .. }));
        assert!(server
            .factory(TransportKind::WebSocket)
            .connect(TransportParams::new("primary.test"))
            .await
            .is_ok());

        server.set_available(TransportKind::XhrStreaming, false);
        let streaming = server.factory(TransportKind::XhrStreaming);
        assert!(!streaming.is_available());
        assert_matches!(
            streaming.connect(TransportParams::new("primary.test")).await,
            Err(TransportError::Unavailable(TransportKind::XhrStreaming))
        );
    }

    #[tokio::test]
    async fn test_script_overrides_once() {
        let server = MockServer::new();
        server.script(
            TransportKind::WebSocket,
            "primary.test",
            [HostBehavior::Refuse(ErrorInfo::transport_unavailable("blocked"))],
        );
        let factory = server.factory(TransportKind::WebSocket);

        assert!(factory
            .connect(TransportParams::new("primary.test"))
            .await
            .is_err());
        assert!(factory
            .connect(TransportParams::new("primary.test"))
            .await
            .is_ok());
        assert_eq!(server.attempts().len(), 2);
    }

    #[tokio::test]
    async fn test_close_handshake_and_link_tracking() {
        let server = MockServer::new();
        let (mut connection, _) = connected(&server, ConnectMode::New).await;
        assert_eq!(server.live_connections(), 1);

        connection
            .transport
            .send(vec![ProtocolMessage::new(Action::Close)])
            .unwrap();
        assert_matches!(
            connection.events.recv().await,
            Some(TransportEvent::Message(m)) if m.action == Action::Closed
        );
        assert_eq!(
            connection.events.recv().await,
            Some(TransportEvent::Closed(CloseReason::Clean))
        );

        connection.transport.close();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(server.live_connections(), 0);
    }
}

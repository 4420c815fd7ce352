//! Connection manager
//!
//! The single actor that owns the state machine, the pending queue, the host
//! policy and the active transport. Application calls, transport events,
//! attempt results and timer expiries are all serialized onto one event loop
//! and handled to completion one at a time.
//!
//! Transport attempts and upgrade probes run as separate tasks and report back
//! through the internal channel tagged with an id. Results carrying an id the
//! engine no longer tracks are stale: their transports are closed and the
//! result is ignored.

use crate::attempt::{run_attempt, AttemptOutcome};
use crate::error::ConnectionError;
use crate::fallback::{HostFallbackPolicy, HostPlan};
use crate::handle::{Connection, ConnectionEvent};
use crate::heartbeat::{HeartbeatAction, HeartbeatMonitor, LivenessMode};
use crate::queue::{AckOutcome, CompletionResult, PendingMessageQueue};
use crate::retry::RetryPolicy;
use crate::state_machine::{ConnectionStateMachine, Trigger};
use crate::timers::{TimerKind, Timers};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tether_core::{
    Action, ConfigError, ConnectionConfig, ConnectionDetails, ConnectionSnapshot, ConnectionState,
    ErrorInfo, ErrorKind, ProtocolMessage, RecoveryToken, StateChange, TransportKind, WallClock,
};
use tether_transport::{
    ConnectMode, ConnectivityCheck, JsonCodec, ProtocolCodec, Transport, TransportConnection,
    TransportEvent, TransportParams, TransportRegistry,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Capacity of the state-change and inbound broadcast channels
pub const EVENT_CAPACITY: usize = 64;

/// Minimum spacing between automatic reconnects after losing a transport
const IMMEDIATE_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Request from a [`Connection`] handle
#[derive(Debug)]
pub(crate) enum Command {
    Connect {
        recover: Option<String>,
        reply: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
    Send {
        message: ProtocolMessage,
        completion: oneshot::Sender<CompletionResult>,
    },
    Ping {
        reply: oneshot::Sender<Result<Duration, ErrorInfo>>,
    },
    ConnectivityChanged {
        online: bool,
    },
}

/// Event produced by a task the engine spawned
#[derive(Debug)]
enum Internal {
    AttemptFinished { id: u64, outcome: AttemptOutcome },
    UpgradeFinished { id: u64, outcome: AttemptOutcome },
    ConnectivityChecked { id: u64, online: bool },
    Transport { id: u64, event: TransportEvent },
}

/// Builds and starts the connection engine
pub struct ConnectionManager {
    config: ConnectionConfig,
    registry: TransportRegistry,
    clock: Arc<dyn WallClock>,
    hosts: Option<HostFallbackPolicy>,
    connectivity: Option<Arc<dyn ConnectivityCheck>>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("connectivity", &self.connectivity)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Validate `config` and prepare an engine over `registry`
    pub fn new(
        config: ConnectionConfig,
        registry: TransportRegistry,
        clock: Arc<dyn WallClock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            registry,
            clock,
            hosts: None,
            connectivity: None,
        })
    }

    /// Use `policy` instead of one built from the configured hosts
    pub fn with_host_policy(mut self, policy: HostFallbackPolicy) -> Self {
        self.hosts = Some(policy);
        self
    }

    /// Check internet reachability with `check` before trying fallback hosts
    pub fn with_connectivity_check(mut self, check: Arc<dyn ConnectivityCheck>) -> Self {
        self.connectivity = Some(check);
        self
    }

    /// Start the event loop and return a handle to it
    ///
    /// Must be called from within a Tokio runtime. The engine stops once every
    /// handle has been dropped.
    pub fn spawn(self) -> Connection {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (inbound_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(ConnectionSnapshot::default());

        let config = self.config;
        let hosts = self.hosts.unwrap_or_else(|| {
            HostFallbackPolicy::new(
                config.primary_host.clone(),
                config.fallback_hosts.clone(),
                config.fallback_cache_ttl,
            )
        });
        let engine = Engine {
            retry: RetryPolicy::from_config(&config),
            state_ttl: config.connection_state_ttl,
            max_message_size: config.max_message_size,
            recover: config.recover.clone(),
            registry: self.registry,
            clock: Arc::clone(&self.clock),
            connectivity: self.connectivity,
            codec: JsonCodec,
            machine: ConnectionStateMachine::new(),
            queue: PendingMessageQueue::new(),
            hosts,
            timers: Timers::new(),
            active: None,
            sequence: None,
            upgrade: None,
            upgrade_blocked_for: None,
            preferred_kind: None,
            force_fallback: false,
            retry_count: 0,
            last_auto_attempt: None,
            pings: Vec::new(),
            next_task_id: 0,
            internal_tx,
            events: events_tx.clone(),
            inbound: inbound_tx.clone(),
            snapshot: snapshot_tx,
            config,
        };
        tokio::spawn(engine.run(command_rx, internal_rx));

        Connection::new(command_tx, snapshot_rx, events_tx, inbound_tx, self.clock)
    }
}

/// Transport currently authoritative for the connection
struct ActiveTransport {
    id: u64,
    transport: Arc<dyn Transport>,
    forwarder: JoinHandle<()>,
    heartbeat: HeartbeatMonitor,
}

/// Attempt task in flight
struct InFlight {
    id: u64,
    kind: TransportKind,
    host: String,
    cached: bool,
    task: JoinHandle<()>,
}

/// Walk over transport kinds and hosts for one `connecting` episode
struct AttemptSequence {
    kinds: VecDeque<TransportKind>,
    current: Option<(TransportKind, HostPlan)>,
    mode: ConnectMode,
    degraded: Option<ErrorInfo>,
    shortcut: bool,
    fresh_retry_used: bool,
    connectivity_checked: bool,
    last_error: Option<ErrorInfo>,
    inflight: Option<InFlight>,
    check: Option<PendingCheck>,
}

impl AttemptSequence {
    fn cancel(&mut self) {
        if let Some(inflight) = self.inflight.take() {
            debug!(kind = %inflight.kind, host = %inflight.host, "abandoning transport attempt");
            inflight.task.abort();
        }
        if let Some(check) = self.check.take() {
            check.task.abort();
        }
    }
}

/// Internet connectivity check in flight
struct PendingCheck {
    id: u64,
    task: JoinHandle<()>,
}

/// Background probe of a higher-priority transport
struct UpgradeAttempt {
    id: u64,
    kind: TransportKind,
    task: JoinHandle<()>,
}

struct PendingPing {
    id: String,
    sent_at: Instant,
    deadline: Instant,
    reply: oneshot::Sender<Result<Duration, ErrorInfo>>,
}

struct Engine {
    config: ConnectionConfig,
    registry: TransportRegistry,
    clock: Arc<dyn WallClock>,
    connectivity: Option<Arc<dyn ConnectivityCheck>>,
    codec: JsonCodec,
    machine: ConnectionStateMachine,
    queue: PendingMessageQueue,
    hosts: HostFallbackPolicy,
    retry: RetryPolicy,
    timers: Timers,
    state_ttl: Duration,
    max_message_size: usize,
    active: Option<ActiveTransport>,
    sequence: Option<AttemptSequence>,
    upgrade: Option<UpgradeAttempt>,
    upgrade_blocked_for: Option<String>,
    preferred_kind: Option<TransportKind>,
    force_fallback: bool,
    recover: Option<String>,
    retry_count: u32,
    last_auto_attempt: Option<Instant>,
    pings: Vec<PendingPing>,
    next_task_id: u64,
    internal_tx: mpsc::UnboundedSender<Internal>,
    events: broadcast::Sender<ConnectionEvent>,
    inbound: broadcast::Sender<ProtocolMessage>,
    snapshot: watch::Sender<ConnectionSnapshot>,
}

impl Engine {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        info!(primary = %self.config.primary_host, "connection engine started");
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },

                Some(event) = internal.recv() => self.handle_internal(event),

                () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_deadline(Instant::now());
                }
            }
            self.publish_snapshot();
        }
        self.dispose();
    }

    // -- dispatch ---------------------------------------------------------

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { recover, reply } => {
                let _ = reply.send(self.on_connect(recover));
            }
            Command::Close { reply } => {
                self.on_close();
                let _ = reply.send(());
            }
            Command::Send {
                message,
                completion,
            } => self.on_send(message, completion),
            Command::Ping { reply } => self.on_ping(reply),
            Command::ConnectivityChanged { online } => self.on_connectivity(online),
        }
    }

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::AttemptFinished { id, outcome } => self.on_attempt_finished(id, outcome),
            Internal::UpgradeFinished { id, outcome } => self.on_upgrade_finished(id, outcome),
            Internal::ConnectivityChecked { id, online } => self.on_connectivity_checked(id, online),
            Internal::Transport { id, event } => self.on_transport_event(id, event),
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.timers.next_deadline(),
            self.active
                .as_ref()
                .and_then(|active| active.heartbeat.next_wakeup()),
            self.pings.iter().map(|ping| ping.deadline).min(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn on_deadline(&mut self, now: Instant) {
        let mut expired = self.timers.take_expired(now);
        // Escalation wins over a retry due at the same instant
        expired.sort_by_key(|timer| *timer != TimerKind::StateTtl);
        for timer in expired {
            if self.timers.is_armed(timer) {
                // Re-armed by an earlier handler in this pass
                continue;
            }
            match timer {
                TimerKind::Retry => self.on_retry_elapsed(),
                TimerKind::StateTtl => self.on_state_ttl_elapsed(),
                TimerKind::CloseTimeout => {
                    if self.machine.state() == ConnectionState::Closing {
                        debug!("close handshake timed out");
                        self.finish_close();
                    }
                }
            }
        }
        self.expire_pings(now);
        self.poll_heartbeat(now);
    }

    // -- state changes ----------------------------------------------------

    fn apply(&mut self, trigger: Trigger, reason: Option<ErrorInfo>) -> Option<StateChange> {
        match self.machine.apply(trigger, reason) {
            Ok(change) => Some(change),
            Err(invalid) => {
                warn!(error = %invalid, "ignoring invalid transition");
                None
            }
        }
    }

    fn emit(&self, change: StateChange) {
        match &change.reason {
            Some(reason) => info!(
                previous = %change.previous,
                current = %change.current,
                code = reason.code,
                reason = %reason,
                "connection state changed"
            ),
            None => info!(
                previous = %change.previous,
                current = %change.current,
                "connection state changed"
            ),
        }
        let _ = self.events.send(ConnectionEvent::StateChange(change));
    }

    fn advance(&mut self, trigger: Trigger, reason: Option<ErrorInfo>) -> bool {
        match self.apply(trigger, reason) {
            Some(change) => {
                self.emit(change);
                true
            }
            None => false,
        }
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(ConnectionSnapshot {
            state: self.machine.state(),
            connection_id: self.machine.connection_id().map(str::to_string),
            connection_key: self.machine.connection_key().map(str::to_string),
            serial: self.machine.serial(),
            next_msg_serial: self.queue.next_serial(),
            pending: self.queue.len(),
            error_reason: self.machine.error_reason().cloned(),
            active_transport: self.active.as_ref().map(|active| {
                (
                    active.transport.kind(),
                    active.transport.host().to_string(),
                )
            }),
        });
    }

    fn next_id(&mut self) -> u64 {
        self.next_task_id += 1;
        self.next_task_id
    }

    // -- application commands ---------------------------------------------

    fn on_connect(&mut self, recover: Option<String>) -> Result<(), ConnectionError> {
        let state = self.machine.state();
        if recover.is_some()
            && (matches!(state, ConnectionState::Connecting | ConnectionState::Connected)
                || self.machine.connection_key().is_some())
        {
            warn!(%state, "recovery token refused; a session is already established");
            return Err(ConnectionError::SessionActive { state });
        }
        match state {
            ConnectionState::Connecting | ConnectionState::Connected => Ok(()),
            _ => {
                let change = self.machine.apply(Trigger::Connect, None)?;
                if recover.is_some() {
                    self.recover = recover;
                }
                self.timers.cancel(TimerKind::Retry);
                self.emit(change);
                self.start_sequence();
                Ok(())
            }
        }
    }

    fn on_close(&mut self) {
        match self.machine.state() {
            ConnectionState::Closing | ConnectionState::Closed => {
                debug!("close already requested");
            }
            ConnectionState::Initialized | ConnectionState::Failed => {
                self.timers.cancel_all();
                self.advance(Trigger::Close, None);
                self.queue.fail_all(&ErrorInfo::closed("connection closed"));
            }
            ConnectionState::Connected => {
                self.cancel_sequence();
                self.cancel_upgrade();
                let cancelled = self.timers.cancel_all();
                debug!(cancelled, "closing connection");
                self.advance(Trigger::Close, None);
                self.fail_pings(&ErrorInfo::closed("connection closing"));

                let sent = self.active.as_ref().is_some_and(|active| {
                    active
                        .transport
                        .send(vec![ProtocolMessage::new(Action::Close)])
                        .is_ok()
                });
                if sent {
                    self.timers.arm(
                        TimerKind::CloseTimeout,
                        Instant::now() + self.config.request_timeout,
                    );
                } else {
                    self.finish_close();
                }
            }
            ConnectionState::Connecting
            | ConnectionState::Disconnected
            | ConnectionState::Suspended => {
                self.advance(Trigger::Close, None);
                self.finish_close();
            }
        }
    }

    fn finish_close(&mut self) {
        self.cancel_sequence();
        self.cancel_upgrade();
        self.deactivate();
        let cancelled = self.timers.cancel_all();
        trace!(cancelled, "timers cancelled on close");
        let closed = ErrorInfo::closed("connection closed");
        self.fail_pings(&closed);
        self.advance(Trigger::CloseConfirmed, None);
        self.queue.fail_all(&closed);
    }

    fn on_send(&mut self, message: ProtocolMessage, completion: oneshot::Sender<CompletionResult>) {
        let state = self.machine.state();
        if let Some(error) = self.submission_error(state, &message) {
            debug!(action = %message.action, error = %error, "rejecting submission");
            let _ = completion.send(Err(error));
            return;
        }

        let serial = self.queue.enqueue_with(message, completion);
        if state != ConnectionState::Connected {
            trace!(serial, %state, "queued while not connected");
            return;
        }
        if let (Some(active), Some(wire)) = (&self.active, self.queue.get(serial)) {
            if let Err(err) = active.transport.send(vec![wire.clone()]) {
                warn!(serial, error = %err, "send on active transport failed; message stays queued");
            }
        }
    }

    fn submission_error(&self, state: ConnectionState, message: &ProtocolMessage) -> Option<ErrorInfo> {
        if !state.accepts_submissions() {
            return Some(state.rejection_error());
        }
        if message.action.is_connection_control() {
            return Some(ErrorInfo::message_rejected(format!(
                "{} is a connection control action",
                message.action
            )));
        }
        match self.codec.encoded_len(message) {
            Err(err) => return Some(ErrorInfo::message_rejected(err.to_string())),
            Ok(size) if size > self.max_message_size => {
                return Some(ErrorInfo::message_too_large(size, self.max_message_size))
            }
            Ok(_) => {}
        }
        if !self.config.queue_messages && state != ConnectionState::Connected {
            return Some(ErrorInfo::disconnected(format!(
                "connection is {state} and queueing is disabled"
            )));
        }
        None
    }

    fn on_ping(&mut self, reply: oneshot::Sender<Result<Duration, ErrorInfo>>) {
        let state = self.machine.state();
        let Some(active) = self
            .active
            .as_ref()
            .filter(|_| state == ConnectionState::Connected)
        else {
            let _ = reply.send(Err(state.rejection_error()));
            return;
        };

        let id = Uuid::new_v4().to_string();
        if let Err(err) = active
            .transport
            .send(vec![ProtocolMessage::heartbeat(id.clone())])
        {
            let _ = reply.send(Err(err.to_error_info()));
            return;
        }
        let now = Instant::now();
        self.pings.push(PendingPing {
            id,
            sent_at: now,
            deadline: now + self.config.request_timeout,
            reply,
        });
    }

    fn on_connectivity(&mut self, online: bool) {
        let state = self.machine.state();
        info!(online, %state, "connectivity changed");
        match (online, state) {
            (true, ConnectionState::Disconnected | ConnectionState::Suspended) => {
                self.timers.cancel(TimerKind::Retry);
                if self.advance(Trigger::ConnectivityRestored, None) {
                    self.start_sequence();
                }
            }
            (true, ConnectionState::Connecting) => self.restart_sequence(),
            (false, ConnectionState::Connected) => {
                self.on_transport_lost(ErrorInfo::disconnected("host environment went offline"));
            }
            _ => {}
        }
    }

    // -- pings --------------------------------------------------------------

    fn resolve_ping(&mut self, id: Option<&str>, now: Instant) {
        let Some(id) = id else { return };
        if let Some(position) = self.pings.iter().position(|ping| ping.id == id) {
            let ping = self.pings.swap_remove(position);
            let _ = ping.reply.send(Ok(now.saturating_duration_since(ping.sent_at)));
        }
    }

    fn expire_pings(&mut self, now: Instant) {
        let (expired, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pings)
            .into_iter()
            .partition(|ping| ping.deadline <= now);
        self.pings = pending;
        for ping in expired {
            let _ = ping
                .reply
                .send(Err(ErrorInfo::timeout("no heartbeat response to ping")));
        }
    }

    fn fail_pings(&mut self, error: &ErrorInfo) {
        for ping in self.pings.drain(..) {
            let _ = ping.reply.send(Err(error.clone()));
        }
    }

    // -- attempt sequence ---------------------------------------------------

    /// Mode for a new sequence, plus a degradation to report on success
    fn connect_mode(&mut self) -> (ConnectMode, Option<ErrorInfo>) {
        if let Some(connection_key) = self.machine.connection_key() {
            return (
                ConnectMode::Resume {
                    connection_key: connection_key.to_string(),
                    connection_serial: self.machine.serial(),
                },
                None,
            );
        }
        let Some(recovery_key) = self.recover.take() else {
            return (ConnectMode::New, None);
        };
        match RecoveryToken::decode(&recovery_key) {
            Ok(token) if !token.is_expired(self.clock.now_ms(), self.config.recovery_token_ttl) => {
                debug!(msg_serial = token.msg_serial, "recovering previous session");
                (
                    ConnectMode::Recover {
                        recovery_key,
                        token,
                    },
                    None,
                )
            }
            Ok(token) => {
                warn!(issued_at = token.issued_at, "recovery token expired; starting a new connection");
                (
                    ConnectMode::New,
                    Some(ErrorInfo::recovery_expired("recovery token has expired")),
                )
            }
            Err(err) => {
                warn!(error = %err, "recovery token rejected; starting a new connection");
                (
                    ConnectMode::New,
                    Some(ErrorInfo::recovery_expired(format!(
                        "recovery token rejected: {err}"
                    ))),
                )
            }
        }
    }

    fn start_sequence(&mut self) {
        self.cancel_sequence();
        let (mode, degraded) = self.connect_mode();
        self.begin_sequence(mode, degraded);
    }

    /// Start over with the current sequence's mode, e.g. after connectivity returns
    fn restart_sequence(&mut self) {
        match self.sequence.take() {
            Some(mut sequence) => {
                sequence.cancel();
                self.begin_sequence(sequence.mode, sequence.degraded);
            }
            None => self.start_sequence(),
        }
    }

    fn begin_sequence(&mut self, mode: ConnectMode, degraded: Option<ErrorInfo>) {
        self.last_auto_attempt = Some(Instant::now());
        let viable = self.registry.viable(&self.config.transports);
        if viable.is_empty() {
            self.fail(ErrorInfo::transport_unavailable(
                "no configured transport is available",
            ));
            return;
        }

        let shortcut = self.preferred_kind.filter(|kind| viable.contains(kind));
        let kinds: VecDeque<TransportKind> = match shortcut {
            Some(kind) => VecDeque::from([kind]),
            None => viable.into(),
        };
        debug!(mode = mode.as_str(), kinds = ?kinds, shortcut = shortcut.is_some(), "starting attempt sequence");

        self.sequence = Some(AttemptSequence {
            kinds,
            current: None,
            mode,
            degraded,
            shortcut: shortcut.is_some(),
            fresh_retry_used: false,
            connectivity_checked: false,
            last_error: None,
            inflight: None,
            check: None,
        });
        self.launch_next();
    }

    fn cancel_sequence(&mut self) {
        if let Some(mut sequence) = self.sequence.take() {
            sequence.cancel();
        }
    }

    /// Launch the next (kind, host) pair, or give up when none remain
    fn launch_next(&mut self) {
        loop {
            let Some(sequence) = self.sequence.as_mut() else {
                return;
            };
            if let Some((kind, plan)) = sequence.current.as_mut() {
                if let Some(host) = plan.next_host() {
                    let cached = plan.is_cached(&host);
                    let kind = *kind;
                    self.launch(kind, host, cached);
                    return;
                }
            }
            match sequence.kinds.pop_front() {
                Some(kind) => {
                    let plan = self.hosts.plan(Instant::now(), self.force_fallback);
                    if let Some(sequence) = self.sequence.as_mut() {
                        sequence.current = Some((kind, plan));
                    }
                }
                None => {
                    self.attempts_exhausted();
                    return;
                }
            }
        }
    }

    fn launch(&mut self, kind: TransportKind, host: String, cached: bool) {
        let Some(factory) = self.registry.get(kind) else {
            self.on_attempt_failed(
                kind,
                host,
                cached,
                ErrorInfo::transport_unavailable(format!("no factory registered for {kind}")),
            );
            return;
        };
        let Some(sequence) = self.sequence.as_ref() else {
            return;
        };
        let timeout = if sequence.shortcut {
            self.config.preference_connect_timeout
        } else {
            self.config.connect_timeout
        };
        let params = TransportParams::new(host.clone())
            .with_mode(sequence.mode.clone())
            .with_heartbeats(!kind.has_native_liveness());

        info!(kind = %kind, host = %host, mode = sequence.mode.as_str(), cached, "connecting");
        let id = self.next_id();
        let tx = self.internal_tx.clone();
        let task = tokio::spawn(async move {
            let outcome = run_attempt(factory, params, timeout).await;
            let _ = tx.send(Internal::AttemptFinished { id, outcome });
        });
        if let Some(sequence) = self.sequence.as_mut() {
            sequence.inflight = Some(InFlight {
                id,
                kind,
                host,
                cached,
                task,
            });
        }
    }

    fn on_attempt_finished(&mut self, id: u64, outcome: AttemptOutcome) {
        let inflight = match self.sequence.as_mut() {
            Some(sequence) if sequence.inflight.as_ref().map(|inflight| inflight.id) == Some(id) => {
                sequence.inflight.take()
            }
            _ => None,
        };
        let Some(inflight) = inflight else {
            if let AttemptOutcome::Ready { connection, .. } = outcome {
                trace!(id, "closing transport from a stale attempt");
                connection.transport.close();
            }
            return;
        };

        match outcome {
            AttemptOutcome::Ready {
                connection,
                connected,
            } => self.on_attempt_ready(inflight, connection, connected),
            AttemptOutcome::Failed(error) => {
                self.on_attempt_failed(inflight.kind, inflight.host, inflight.cached, error);
            }
        }
    }

    fn on_attempt_failed(&mut self, kind: TransportKind, host: String, cached: bool, error: ErrorInfo) {
        let Some(sequence) = self.sequence.as_mut() else {
            return;
        };

        let host_failed = match error.kind() {
            ErrorKind::TransportUnavailable => {
                debug!(kind = %kind, "transport unavailable; skipping kind");
                sequence.current = None;
                false
            }
            _ if error.is_fatal() => {
                self.fail(error);
                return;
            }
            ErrorKind::RecoveryExpired if !sequence.fresh_retry_used => {
                warn!(kind = %kind, host = %host, error = %error, "session not resumable; retrying as a new connection");
                sequence.fresh_retry_used = true;
                sequence.mode = ConnectMode::New;
                sequence.degraded = Some(error);
                self.launch(kind, host, cached);
                return;
            }
            _ if error.is_retryable() => {
                warn!(kind = %kind, host = %host, error = %error, "attempt failed; trying next candidate");
                if cached && self.hosts.discard(&host) {
                    debug!(host = %host, "cached fallback failed");
                }
                sequence.last_error = Some(error);
                true
            }
            _ => {
                warn!(kind = %kind, host = %host, error = %error, "attempt failed");
                sequence.last_error = Some(error);
                self.attempts_exhausted();
                return;
            }
        };

        let verify = host_failed
            && self.connectivity.is_some()
            && self.sequence.as_ref().is_some_and(|sequence| {
                !sequence.connectivity_checked
                    && sequence
                        .current
                        .as_ref()
                        .is_some_and(|(_, plan)| plan.remaining() > 0)
            });
        if let Some(sequence) = self.sequence.as_mut() {
            if sequence.shortcut {
                debug!(kind = %kind, "preferred transport failed; using default order");
                sequence.shortcut = false;
                sequence.current = None;
                sequence.kinds = self.registry.viable(&self.config.transports).into();
                self.preferred_kind = None;
            }
        }
        if verify {
            self.start_connectivity_check();
        } else {
            self.launch_next();
        }
    }

    fn start_connectivity_check(&mut self) {
        let Some(check) = self.connectivity.clone() else {
            self.launch_next();
            return;
        };
        debug!("checking internet connectivity before trying fallback hosts");
        let id = self.next_id();
        let timeout = self.config.request_timeout;
        let tx = self.internal_tx.clone();
        let task = tokio::spawn(async move {
            let online = tokio::time::timeout(timeout, check.is_online())
                .await
                .unwrap_or(false);
            let _ = tx.send(Internal::ConnectivityChecked { id, online });
        });
        if let Some(sequence) = self.sequence.as_mut() {
            sequence.check = Some(PendingCheck { id, task });
        }
    }

    fn on_connectivity_checked(&mut self, id: u64, online: bool) {
        let Some(sequence) = self.sequence.as_mut() else {
            return;
        };
        match sequence.check.take() {
            Some(check) if check.id == id => {}
            other => {
                sequence.check = other;
                return;
            }
        }
        sequence.connectivity_checked = true;
        if online {
            debug!("internet reachable; trying fallback hosts");
            self.launch_next();
        } else {
            warn!("internet unreachable; skipping fallback hosts");
            sequence.last_error = Some(ErrorInfo::disconnected(
                "unable to connect: internet connectivity check failed",
            ));
            self.attempts_exhausted();
        }
    }

    fn attempts_exhausted(&mut self) {
        let reason = self
            .sequence
            .take()
            .and_then(|mut sequence| {
                sequence.cancel();
                sequence.last_error
            })
            .unwrap_or_else(|| ErrorInfo::disconnected("no transport could be established"));
        let Some(mut change) = self.apply(Trigger::AttemptsExhausted, Some(reason)) else {
            return;
        };

        let now = Instant::now();
        let delay = match change.current {
            ConnectionState::Suspended => {
                self.timers.cancel(TimerKind::StateTtl);
                self.retry_count = 0;
                self.retry.suspended_delay()
            }
            _ => {
                self.retry_count += 1;
                if !self.timers.is_armed(TimerKind::StateTtl) {
                    self.timers.arm(TimerKind::StateTtl, now + self.state_ttl);
                }
                self.retry.disconnected_delay(self.retry_count)
            }
        };
        self.timers.arm(TimerKind::Retry, now + delay);
        change.retry_in = Some(delay);
        self.emit(change);
    }

    fn on_retry_elapsed(&mut self) {
        if matches!(
            self.machine.state(),
            ConnectionState::Disconnected | ConnectionState::Suspended
        ) && self.advance(Trigger::RetryElapsed, None)
        {
            self.start_sequence();
        }
    }

    fn on_state_ttl_elapsed(&mut self) {
        if !matches!(
            self.machine.state(),
            ConnectionState::Disconnected | ConnectionState::Connecting
        ) {
            return;
        }
        self.cancel_sequence();
        let reason = ErrorInfo::suspended(format!(
            "disconnected for longer than {}ms",
            self.state_ttl.as_millis()
        ));
        let Some(mut change) = self.apply(Trigger::StateTtlElapsed, Some(reason)) else {
            return;
        };
        self.retry_count = 0;
        let delay = self.retry.suspended_delay();
        self.timers
            .arm(TimerKind::Retry, Instant::now() + delay);
        change.retry_in = Some(delay);
        self.emit(change);
    }

    fn on_attempt_ready(
        &mut self,
        inflight: InFlight,
        connection: TransportConnection,
        connected: ProtocolMessage,
    ) {
        let Some(sequence) = self.sequence.take() else {
            connection.transport.close();
            return;
        };
        let (Some(connection_id), Some(details)) = (
            connected.connection_id.clone(),
            connected.connection_details.clone(),
        ) else {
            connection.transport.close();
            self.fail(ErrorInfo::protocol("CONNECTED without connection id or details"));
            return;
        };

        let changed = self
            .machine
            .set_connection(&connection_id, &details.connection_key);
        let server_degraded = connected.error.is_some();
        match &sequence.mode {
            ConnectMode::New => self.queue.renumber(),
            // Same connection id keeps its serials even when CONNECTED carries an error
            ConnectMode::Resume { .. } if changed => self.queue.renumber(),
            ConnectMode::Resume { .. } => {}
            ConnectMode::Recover { .. } if server_degraded => self.queue.renumber(),
            ConnectMode::Recover { token, .. } => {
                self.queue.restart_at(token.msg_serial);
                self.machine.seed_serial(token.connection_serial);
            }
        }

        let now = Instant::now();
        self.apply_details(&details);
        self.activate(connection, &details);
        self.hosts.persist_success(&inflight.host, now);
        self.preferred_kind = Some(inflight.kind);
        self.force_fallback = false;
        self.retry_count = 0;
        self.timers.cancel(TimerKind::Retry);
        self.timers.cancel(TimerKind::StateTtl);

        let reason = connected.error.or(sequence.degraded);
        info!(
            connection_id = %connection_id,
            kind = %inflight.kind,
            host = %inflight.host,
            mode = sequence.mode.as_str(),
            degraded = reason.is_some(),
            "connected"
        );
        self.advance(Trigger::Connected, reason);
        let _ = self.events.send(ConnectionEvent::TransportActive {
            kind: inflight.kind,
            host: inflight.host,
        });
        self.flush_pending();
        self.maybe_upgrade();
    }

    fn apply_details(&mut self, details: &ConnectionDetails) {
        self.state_ttl = details
            .connection_state_ttl()
            .unwrap_or(self.config.connection_state_ttl);
        self.max_message_size = details
            .max_message_size
            .unwrap_or(self.config.max_message_size);
    }

    // -- active transport ---------------------------------------------------

    fn activate(&mut self, connection: TransportConnection, details: &ConnectionDetails) {
        let id = self.next_id();
        let TransportConnection {
            transport,
            mut events,
        } = connection;
        let tx = self.internal_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send(Internal::Transport { id, event }).is_err() {
                    break;
                }
            }
        });

        let mode = LivenessMode::for_transport(
            transport.kind(),
            self.config.heartbeat_interval,
            self.config.request_timeout,
            details.max_idle_interval(),
        );
        debug!(kind = %transport.kind(), host = %transport.host(), liveness = ?mode, "transport active");
        self.active = Some(ActiveTransport {
            id,
            transport,
            forwarder,
            heartbeat: HeartbeatMonitor::new(mode, Instant::now()),
        });
    }

    fn deactivate(&mut self) {
        if let Some(active) = self.active.take() {
            debug!(kind = %active.transport.kind(), host = %active.transport.host(), "deactivating transport");
            active.transport.close();
            active.forwarder.abort();
        }
    }

    /// Replay every unacknowledged message on the active transport
    fn flush_pending(&self) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let batch = self.queue.drain_for_resend();
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        match active.transport.send(batch) {
            Ok(()) => debug!(count, "flushed pending messages"),
            Err(err) => warn!(count, error = %err, "flush of pending messages failed"),
        }
    }

    fn on_transport_event(&mut self, id: u64, event: TransportEvent) {
        if self.active.as_ref().map(|active| active.id) != Some(id) {
            trace!(id, "dropping event from inactive transport");
            return;
        }
        match event {
            TransportEvent::Message(message) => self.on_message(message),
            TransportEvent::Closed(reason) => {
                debug!(reason = ?reason, "active transport closed");
                self.on_transport_lost(reason.to_error_info());
            }
        }
    }

    fn on_message(&mut self, message: ProtocolMessage) {
        let now = Instant::now();
        if let Some(active) = self.active.as_mut() {
            if message.action == Action::Heartbeat {
                active.heartbeat.on_heartbeat(message.id.as_deref(), now);
            } else {
                active.heartbeat.on_activity(now);
            }
        }

        match message.action {
            Action::Heartbeat => self.resolve_ping(message.id.as_deref(), now),
            Action::Ack => {
                if let Some((from, count)) = message.ack_range() {
                    self.queue.resolve(from, count, AckOutcome::Ack);
                }
            }
            Action::Nack => {
                let error = message
                    .error
                    .clone()
                    .unwrap_or_else(|| ErrorInfo::message_rejected("message refused by server"));
                if let Some((from, count)) = message.ack_range() {
                    self.queue
                        .resolve(from, count, AckOutcome::Nack(error.clone()));
                }
                if error.kind() == ErrorKind::ProtocolViolation {
                    self.fail(error);
                }
            }
            Action::Connected => self.on_connected_update(message),
            Action::Disconnected => {
                let error = message
                    .error
                    .unwrap_or_else(|| ErrorInfo::disconnected("server disconnected the transport"));
                self.on_transport_lost(error);
            }
            Action::Closed => {
                if self.machine.state() == ConnectionState::Closing {
                    self.finish_close();
                } else {
                    let error = message
                        .error
                        .unwrap_or_else(|| ErrorInfo::disconnected("server closed the transport"));
                    self.on_transport_lost(error);
                }
            }
            Action::Error if message.channel.is_none() => {
                let error = message
                    .error
                    .unwrap_or_else(|| ErrorInfo::protocol("ERROR without error details"));
                if error.is_fatal() {
                    self.fail(error);
                } else {
                    self.on_transport_lost(error);
                }
            }
            Action::Connect | Action::Disconnect | Action::Close => {
                debug!(action = %message.action, "ignoring client-only action from server");
            }
            _ => self.deliver_inbound(message),
        }
    }

    /// `CONNECTED` on an already active transport
    fn on_connected_update(&mut self, message: ProtocolMessage) {
        if self.machine.state() != ConnectionState::Connected {
            return;
        }
        if let (Some(connection_id), Some(details)) =
            (message.connection_id.as_deref(), message.connection_details.as_ref())
        {
            if self
                .machine
                .set_connection(connection_id, &details.connection_key)
            {
                info!(connection_id, "server assigned a new connection");
                self.queue.renumber();
                self.flush_pending();
            }
            self.apply_details(details);
        }
        self.machine.set_error_reason(message.error.clone());
        let _ = self.events.send(ConnectionEvent::Update(StateChange {
            previous: ConnectionState::Connected,
            current: ConnectionState::Connected,
            reason: message.error,
            retry_in: None,
        }));
    }

    fn deliver_inbound(&mut self, message: ProtocolMessage) {
        if let Some(serial) = message.connection_serial {
            if !self.machine.apply_inbound_serial(serial) {
                trace!(serial, "dropping duplicate inbound message");
                return;
            }
        }
        let _ = self.inbound.send(message);
    }

    fn poll_heartbeat(&mut self, now: Instant) {
        let action = match self.active.as_mut() {
            Some(active) => active.heartbeat.poll(now),
            None => return,
        };
        match action {
            HeartbeatAction::Idle => {}
            HeartbeatAction::SendProbe(probe) => {
                if let Some(active) = self.active.as_ref() {
                    if let Err(err) = active.transport.send(vec![probe]) {
                        warn!(error = %err, "heartbeat probe could not be sent");
                    }
                }
            }
            HeartbeatAction::TimedOut => {
                warn!("no activity on transport within the liveness window");
                self.on_transport_lost(ErrorInfo::timeout("transport liveness timed out"));
            }
        }
    }

    fn on_transport_lost(&mut self, error: ErrorInfo) {
        match self.machine.state() {
            ConnectionState::Connected => {}
            ConnectionState::Closing => {
                self.finish_close();
                return;
            }
            _ => {
                self.deactivate();
                return;
            }
        }

        warn!(code = error.code, error = %error, "active transport lost");
        self.deactivate();
        self.cancel_upgrade();
        self.fail_pings(&ErrorInfo::disconnected("transport lost"));
        if error.is_fatal() {
            self.fail(error);
            return;
        }
        if error.is_server_error() {
            debug!("server error on active transport; next attempt starts with fallback hosts");
            self.force_fallback = true;
        }

        let Some(mut change) = self.apply(Trigger::TransportLost, Some(error)) else {
            return;
        };
        let now = Instant::now();
        if !self.timers.is_armed(TimerKind::StateTtl) {
            self.timers.arm(TimerKind::StateTtl, now + self.state_ttl);
        }
        let delay = self
            .last_auto_attempt
            .map(|last| (last + IMMEDIATE_RETRY_INTERVAL).saturating_duration_since(now))
            .unwrap_or_default();
        self.retry_count = 0;
        self.timers.arm(TimerKind::Retry, now + delay);
        change.retry_in = Some(delay);
        self.emit(change);
    }

    fn fail(&mut self, error: ErrorInfo) {
        error!(code = error.code, error = %error, "connection failed");
        self.cancel_sequence();
        self.cancel_upgrade();
        self.deactivate();
        self.timers.cancel_all();
        self.fail_pings(&error);
        self.advance(Trigger::Fatal, Some(error.clone()));
        self.queue.fail_all(&error);
    }

    // -- upgrade ------------------------------------------------------------

    fn maybe_upgrade(&mut self) {
        if !self.config.upgrade
            || self.upgrade.is_some()
            || self.machine.state() != ConnectionState::Connected
        {
            return;
        }
        let (Some(active), Some(connection_id), Some(connection_key)) = (
            self.active.as_ref(),
            self.machine.connection_id(),
            self.machine.connection_key(),
        ) else {
            return;
        };
        if self.upgrade_blocked_for.as_deref() == Some(connection_id) {
            return;
        }

        let current = active.transport.kind();
        let viable = self.registry.viable(&self.config.transports);
        let Some(target) = viable
            .iter()
            .position(|kind| *kind == current)
            .and_then(|position| viable[..position].first().copied())
        else {
            return;
        };
        let Some(factory) = self.registry.get(target) else {
            return;
        };

        let params = TransportParams::new(active.transport.host())
            .with_mode(ConnectMode::Resume {
                connection_key: connection_key.to_string(),
                connection_serial: self.machine.serial(),
            })
            .with_heartbeats(!target.has_native_liveness());
        info!(from = %current, to = %target, "attempting transport upgrade");

        let timeout = self.config.connect_timeout;
        let id = self.next_id();
        let tx = self.internal_tx.clone();
        let task = tokio::spawn(async move {
            let outcome = run_attempt(factory, params, timeout).await;
            let _ = tx.send(Internal::UpgradeFinished { id, outcome });
        });
        self.upgrade = Some(UpgradeAttempt {
            id,
            kind: target,
            task,
        });
    }

    fn cancel_upgrade(&mut self) {
        if let Some(upgrade) = self.upgrade.take() {
            debug!(kind = %upgrade.kind, "abandoning upgrade");
            upgrade.task.abort();
        }
    }

    fn block_upgrades(&mut self) {
        self.upgrade_blocked_for = self.machine.connection_id().map(str::to_string);
    }

    fn on_upgrade_finished(&mut self, id: u64, outcome: AttemptOutcome) {
        let upgrade = match self.upgrade.take() {
            Some(upgrade) if upgrade.id == id => upgrade,
            other => {
                self.upgrade = other;
                if let AttemptOutcome::Ready { connection, .. } = outcome {
                    trace!(id, "closing transport from a stale upgrade");
                    connection.transport.close();
                }
                return;
            }
        };

        let (connection, connected) = match outcome {
            AttemptOutcome::Ready {
                connection,
                connected,
            } => (connection, connected),
            AttemptOutcome::Failed(error) => {
                info!(kind = %upgrade.kind, error = %error, "upgrade failed; keeping current transport");
                self.block_upgrades();
                return;
            }
        };

        let same_session = self.machine.state() == ConnectionState::Connected
            && connected.error.is_none()
            && connected.connection_id.as_deref() == self.machine.connection_id();
        let details = connected.connection_details.clone();
        let Some(details) = details.filter(|_| same_session) else {
            info!(kind = %upgrade.kind, "upgrade landed on a different session; discarding it");
            connection.transport.close();
            self.block_upgrades();
            return;
        };

        let host = connection.transport.host().to_string();
        self.deactivate();
        self.apply_details(&details);
        if let Some(connection_id) = connected.connection_id.as_deref() {
            self.machine
                .set_connection(connection_id, &details.connection_key);
        }
        self.activate(connection, &details);
        self.preferred_kind = Some(upgrade.kind);
        info!(kind = %upgrade.kind, host = %host, "upgraded transport");
        let _ = self.events.send(ConnectionEvent::TransportActive {
            kind: upgrade.kind,
            host,
        });
        self.flush_pending();
        self.maybe_upgrade();
    }

    // -- shutdown -----------------------------------------------------------

    fn dispose(&mut self) {
        info!(state = %self.machine.state(), "connection engine disposed");
        self.cancel_sequence();
        self.cancel_upgrade();
        self.deactivate();
        self.timers.cancel_all();
        let closed = ErrorInfo::closed("connection engine disposed");
        self.fail_pings(&closed);
        self.queue.fail_all(&closed);
        self.publish_snapshot();
    }
}

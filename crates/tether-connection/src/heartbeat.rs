//! Liveness monitoring for the active transport
//!
//! Transports without an intrinsic keep-alive are probed: every `interval` a
//! HEARTBEAT with a fresh id is sent and the monitor times out if neither the
//! echo nor any other inbound traffic arrives within `timeout`. Transports that
//! do report liveness are watched passively and time out after a full idle
//! window with no inbound activity.
//!
//! The monitor holds no timers of its own. The engine asks for
//! [`HeartbeatMonitor::next_wakeup`] and calls [`HeartbeatMonitor::poll`] when
//! that instant passes.

use std::time::Duration;
use tether_core::{ProtocolMessage, TransportKind};
use tokio::time::Instant;
use tracing::trace;
use uuid::Uuid;

/// How liveness is established
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessMode {
    /// Send HEARTBEAT probes and wait for a response
    Probing {
        /// Quiet time before the next probe
        interval: Duration,
        /// Time allowed for a probe response
        timeout: Duration,
    },
    /// Only watch for inbound traffic
    Passive {
        /// Silence after which the transport is considered dead
        idle_timeout: Duration,
    },
}

impl LivenessMode {
    /// Mode for a transport of `kind`
    ///
    /// `max_idle_interval` is the server's promised maximum silence; when
    /// present, a transport with native liveness is watched passively for that
    /// long plus `request_timeout`.
    pub fn for_transport(
        kind: TransportKind,
        heartbeat_interval: Duration,
        request_timeout: Duration,
        max_idle_interval: Option<Duration>,
    ) -> Self {
        if kind.has_native_liveness() {
            let idle = max_idle_interval.unwrap_or(heartbeat_interval);
            LivenessMode::Passive {
                idle_timeout: idle + request_timeout,
            }
        } else {
            LivenessMode::Probing {
                interval: heartbeat_interval,
                timeout: request_timeout,
            }
        }
    }
}

/// What the engine should do after a poll
#[derive(Debug, Clone, PartialEq)]
pub enum HeartbeatAction {
    /// Nothing due yet
    Idle,
    /// Send this probe on the active transport
    SendProbe(ProtocolMessage),
    /// Transport is considered dead
    TimedOut,
}

#[derive(Debug, Clone)]
struct OutstandingProbe {
    id: String,
    deadline: Instant,
}

/// Tracks liveness of one transport
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    mode: LivenessMode,
    last_activity: Instant,
    next_probe: Instant,
    outstanding: Option<OutstandingProbe>,
    timed_out: bool,
}

impl HeartbeatMonitor {
    /// Start monitoring at `now`
    pub fn new(mode: LivenessMode, now: Instant) -> Self {
        let next_probe = match mode {
            LivenessMode::Probing { interval, .. } => now + interval,
            LivenessMode::Passive { .. } => now,
        };
        Self {
            mode,
            last_activity: now,
            next_probe,
            outstanding: None,
            timed_out: false,
        }
    }

    /// Current mode
    pub fn mode(&self) -> LivenessMode {
        self.mode
    }

    /// Any inbound traffic proves the transport is alive
    pub fn on_activity(&mut self, now: Instant) {
        if self.timed_out {
            return;
        }
        self.last_activity = now;
        if let LivenessMode::Probing { interval, .. } = self.mode {
            self.outstanding = None;
            self.next_probe = now + interval;
        }
    }

    /// Inbound HEARTBEAT; true if it answered the outstanding probe
    pub fn on_heartbeat(&mut self, id: Option<&str>, now: Instant) -> bool {
        let answered = matches!(
            (&self.outstanding, id),
            (Some(probe), Some(id)) if probe.id == id
        );
        self.on_activity(now);
        answered
    }

    /// Instant at which [`HeartbeatMonitor::poll`] next has work
    pub fn next_wakeup(&self) -> Option<Instant> {
        if self.timed_out {
            return None;
        }
        Some(match (self.mode, &self.outstanding) {
            (LivenessMode::Passive { idle_timeout }, _) => self.last_activity + idle_timeout,
            (LivenessMode::Probing { .. }, Some(probe)) => probe.deadline,
            (LivenessMode::Probing { .. }, None) => self.next_probe,
        })
    }

    /// Advance to `now`
    pub fn poll(&mut self, now: Instant) -> HeartbeatAction {
        if self.timed_out {
            return HeartbeatAction::TimedOut;
        }
        match self.mode {
            LivenessMode::Passive { idle_timeout } => {
                if now >= self.last_activity + idle_timeout {
                    self.timed_out = true;
                    return HeartbeatAction::TimedOut;
                }
                HeartbeatAction::Idle
            }
            LivenessMode::Probing { timeout, .. } => match &self.outstanding {
                Some(probe) if now >= probe.deadline => {
                    self.timed_out = true;
                    HeartbeatAction::TimedOut
                }
                Some(_) => HeartbeatAction::Idle,
                None if now >= self.next_probe => {
                    let id = Uuid::new_v4().to_string();
                    trace!(probe = %id, "sending heartbeat probe");
                    self.outstanding = Some(OutstandingProbe {
                        id: id.clone(),
                        deadline: now + timeout,
                    });
                    HeartbeatAction::SendProbe(ProtocolMessage::heartbeat(id))
                }
                None => HeartbeatAction::Idle,
            },
        }
    }
}

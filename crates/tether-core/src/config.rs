//! Connection configuration
//!
//! Every option the engine recognises, with defaults suited to production and
//! a [`ConnectionConfig::for_testing`] profile with short timers and no jitter.
//! Durations serialize as integer milliseconds.

use crate::transport_kind::TransportKind;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

/// Invalid configuration
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// No transport kinds configured
    #[error("at least one transport kind must be configured")]
    NoTransports,
    /// Same transport kind listed twice
    #[error("transport kind {0} is listed more than once")]
    DuplicateTransport(TransportKind),
    /// Primary host is blank
    #[error("primary host must not be empty")]
    EmptyPrimaryHost,
    /// Same host listed twice across primary and fallbacks
    #[error("host {0} is listed more than once")]
    DuplicateHost(String),
    /// A timer that must be positive is zero
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    /// Jitter fraction outside `[0, 1)`
    #[error("retry jitter must be within [0, 1), got {0}")]
    InvalidJitter(f64),
}

/// Options consumed by the connection engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Allowed transport kinds, highest priority first
    pub transports: Vec<TransportKind>,
    /// Host tried first
    pub primary_host: String,
    /// Alternate hosts, tried in a stable shuffled order
    pub fallback_hosts: Vec<String>,
    /// Deadline for one transport attempt to reach `CONNECTED`
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Shorter deadline used when retrying the remembered transport kind
    #[serde(with = "duration_ms")]
    pub preference_connect_timeout: Duration,
    /// Deadline for heartbeat responses, pings and the close handshake
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    /// Base delay between attempts while disconnected
    #[serde(with = "duration_ms")]
    pub disconnected_retry_delay: Duration,
    /// Delay between attempts while suspended
    #[serde(with = "duration_ms")]
    pub suspended_retry_delay: Duration,
    /// Time spent disconnected before escalating to suspended
    #[serde(with = "duration_ms")]
    pub connection_state_ttl: Duration,
    /// How long a successful fallback host stays preferred
    #[serde(with = "duration_ms")]
    pub fallback_cache_ttl: Duration,
    /// Interval between liveness probes on transports without native liveness
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// How long an exported recovery token stays usable
    #[serde(with = "duration_ms")]
    pub recovery_token_ttl: Duration,
    /// Fraction of the retry delay removed at random, in `[0, 1)`
    pub retry_jitter: f64,
    /// Whether submissions are queued while not connected
    pub queue_messages: bool,
    /// Whether to attempt transport upgrades after connecting
    pub upgrade: bool,
    /// Largest encoded message accepted before the server says otherwise
    pub max_message_size: usize,
    /// Recovery token to attempt on first connect
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recover: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            transports: TransportKind::DEFAULT_ORDER.to_vec(),
            primary_host: "realtime.tether.dev".to_string(),
            fallback_hosts: (b'a'..=b'e')
                .map(|c| format!("{}.fallback.tether.dev", c as char))
                .collect(),
            connect_timeout: Duration::from_secs(10),
            preference_connect_timeout: Duration::from_secs(6),
            request_timeout: Duration::from_secs(10),
            disconnected_retry_delay: Duration::from_secs(15),
            suspended_retry_delay: Duration::from_secs(30),
            connection_state_ttl: Duration::from_secs(120),
            fallback_cache_ttl: Duration::from_secs(600),
            heartbeat_interval: Duration::from_secs(15),
            recovery_token_ttl: Duration::from_secs(120),
            retry_jitter: 0.2,
            queue_messages: true,
            upgrade: true,
            max_message_size: 65_536,
            recover: None,
        }
    }
}

impl ConnectionConfig {
    /// Short timers, local hosts and deterministic retry delays
    pub fn for_testing() -> Self {
        Self {
            primary_host: "primary.test".to_string(),
            fallback_hosts: vec![
                "fallback-a.test".to_string(),
                "fallback-b.test".to_string(),
                "fallback-c.test".to_string(),
            ],
            connect_timeout: Duration::from_secs(2),
            preference_connect_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(1),
            disconnected_retry_delay: Duration::from_secs(5),
            suspended_retry_delay: Duration::from_secs(10),
            connection_state_ttl: Duration::from_secs(30),
            fallback_cache_ttl: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(5),
            recovery_token_ttl: Duration::from_secs(30),
            retry_jitter: 0.0,
            ..Self::default()
        }
    }

    /// Replace the transport priority list
    pub fn with_transports(mut self, transports: impl Into<Vec<TransportKind>>) -> Self {
        self.transports = transports.into();
        self
    }

    /// Replace primary and fallback hosts
    pub fn with_hosts(
        mut self,
        primary: impl Into<String>,
        fallbacks: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.primary_host = primary.into();
        self.fallback_hosts = fallbacks.into_iter().map(Into::into).collect();
        self
    }

    /// Set the recovery token attempted on first connect
    pub fn with_recover(mut self, token: impl Into<String>) -> Self {
        self.recover = Some(token.into());
        self
    }

    /// Enable or disable queueing while not connected
    pub fn with_queue_messages(mut self, queue: bool) -> Self {
        self.queue_messages = queue;
        self
    }

    /// Enable or disable background transport upgrades
    pub fn with_upgrade(mut self, upgrade: bool) -> Self {
        self.upgrade = upgrade;
        self
    }

    /// Check invariants the engine relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transports.is_empty() {
            return Err(ConfigError::NoTransports);
        }
        let mut kinds = HashSet::new();
        for kind in &self.transports {
            if !kinds.insert(*kind) {
                return Err(ConfigError::DuplicateTransport(*kind));
            }
        }

        if self.primary_host.trim().is_empty() {
            return Err(ConfigError::EmptyPrimaryHost);
        }
        let mut hosts = HashSet::new();
        for host in std::iter::once(&self.primary_host).chain(&self.fallback_hosts) {
            if !hosts.insert(host.as_str()) {
                return Err(ConfigError::DuplicateHost(host.clone()));
            }
        }

        let timers = [
            ("connect_timeout", self.connect_timeout),
            ("preference_connect_timeout", self.preference_connect_timeout),
            ("request_timeout", self.request_timeout),
            ("disconnected_retry_delay", self.disconnected_retry_delay),
            ("suspended_retry_delay", self.suspended_retry_delay),
            ("connection_state_ttl", self.connection_state_ttl),
            ("heartbeat_interval", self.heartbeat_interval),
        ];
        if let Some((name, _)) = timers.iter().find(|(_, value)| value.is_zero()) {
            return Err(ConfigError::ZeroDuration(*name));
        }

        if !(0.0..1.0).contains(&self.retry_jitter) {
            return Err(ConfigError::InvalidJitter(self.retry_jitter));
        }
        Ok(())
    }
}

/// Serde helper storing a [`Duration`] as integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize as milliseconds
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    /// Deserialize from milliseconds
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

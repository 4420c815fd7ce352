//! Shared harness for connection engine tests
#![allow(dead_code, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use tether_connection::{Connection, ConnectionEvent, ConnectionManager};
use tether_core::{
    ConnectionConfig, ConnectionState, ErrorInfo, StateChange, SystemClock, TransportKind,
    WallClock,
};
use tether_testkit::{init_test_tracing, HostBehavior, ManualConnectivity, MockServer};
use tokio::sync::broadcast;

/// Primary and fallback hosts used by [`ConnectionConfig::for_testing`]
pub const HOSTS: [&str; 4] = [
    "primary.test",
    "fallback-a.test",
    "fallback-b.test",
    "fallback-c.test",
];

pub struct Harness {
    pub server: MockServer,
    pub connection: Connection,
    pub events: broadcast::Receiver<ConnectionEvent>,
}

/// Test config restricted to `kinds`, upgrades off
pub fn config(kinds: &[TransportKind]) -> ConnectionConfig {
    ConnectionConfig::for_testing()
        .with_transports(kinds.to_vec())
        .with_upgrade(false)
}

pub fn start(server: &MockServer, config: ConnectionConfig) -> Harness {
    start_with_clock(server, config, Arc::new(SystemClock))
}

pub fn start_with_clock(
    server: &MockServer,
    config: ConnectionConfig,
    clock: Arc<dyn WallClock>,
) -> Harness {
    init_test_tracing();
    let registry = server.registry(&config.transports);
    let manager = ConnectionManager::new(config, registry, clock).expect("valid test config");
    launch(server, manager)
}

/// Harness whose engine consults `connectivity` before trying fallback hosts
pub fn start_with_connectivity(
    server: &MockServer,
    config: ConnectionConfig,
    connectivity: &ManualConnectivity,
) -> Harness {
    init_test_tracing();
    let registry = server.registry(&config.transports);
    let manager = ConnectionManager::new(config, registry, Arc::new(SystemClock))
        .expect("valid test config")
        .with_connectivity_check(Arc::new(connectivity.clone()));
    launch(server, manager)
}

fn launch(server: &MockServer, manager: ConnectionManager) -> Harness {
    let connection = manager.spawn();
    let events = connection.subscribe();
    Harness {
        server: server.clone(),
        connection,
        events,
    }
}

/// Harness over a single WebSocket transport, already connected
pub async fn connected() -> Harness {
    let server = MockServer::new();
    let harness = start(&server, config(&[TransportKind::WebSocket]));
    harness.connection.connect().await.expect("connect");
    harness
        .connection
        .wait_for_state(ConnectionState::Connected)
        .await
        .expect("connected");
    harness
}

/// Script every configured host with `behavior`
pub fn set_all_hosts(server: &MockServer, behavior: HostBehavior) {
    for host in HOSTS {
        server.set_host(host, behavior.clone());
    }
}

pub fn refuse_all_hosts(server: &MockServer) {
    set_all_hosts(server, HostBehavior::Refuse(ErrorInfo::disconnected("host down")));
}

impl Harness {
    /// Next state change, skipping other notifications
    pub async fn next_state(&mut self) -> StateChange {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(600), self.events.recv())
                .await
                .expect("state change within timeout")
                .expect("event stream open");
            if let ConnectionEvent::StateChange(change) = event {
                return change;
            }
        }
    }

    /// Skip state changes until one lands in `state`
    pub async fn until_state(&mut self, state: ConnectionState) -> StateChange {
        loop {
            let change = self.next_state().await;
            if change.current == state {
                return change;
            }
        }
    }

    /// Next `TransportActive` notification
    pub async fn next_active(&mut self) -> (TransportKind, String) {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(600), self.events.recv())
                .await
                .expect("transport notification within timeout")
                .expect("event stream open");
            if let ConnectionEvent::TransportActive { kind, host } = event {
                return (kind, host);
            }
        }
    }

    /// Events already buffered, without waiting
    pub fn drain(&mut self) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

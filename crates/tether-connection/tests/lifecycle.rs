//! Connect, close and failure paths of the connection engine
#![allow(missing_docs, clippy::expect_used, clippy::unwrap_used)]

mod common;

use assert_matches::assert_matches;
use std::time::Duration;
use common::{config, connected, start};
use tether_connection::{ConnectionError, ConnectionEvent};
use tether_core::{
    codes, Action, ConnectionState, ErrorInfo, ErrorKind, ProtocolMessage, TransportKind,
};
use tether_testkit::{settle, HostBehavior, MockServer};

fn chat(text: &str) -> ProtocolMessage {
    ProtocolMessage::message("chat", serde_json::json!({ "text": text }))
}

#[tokio::test(start_paused = true)]
async fn connect_reports_states_and_active_transport() {
    let server = MockServer::new();
    let mut h = start(&server, config(&[TransportKind::WebSocket]));
    assert_eq!(h.connection.state(), ConnectionState::Initialized);

    h.connection.connect().await.unwrap();

    let connecting = h.next_state().await;
    assert_eq!(connecting.previous, ConnectionState::Initialized);
    assert_eq!(connecting.current, ConnectionState::Connecting);
    let connected = h.next_state().await;
    assert_eq!(connected.current, ConnectionState::Connected);
    assert_eq!(connected.reason, None);
    assert_eq!(
        h.next_active().await,
        (TransportKind::WebSocket, "primary.test".to_string())
    );

    let snapshot = h.connection.snapshot();
    assert_eq!(snapshot.connection_id.as_deref(), Some("conn-1"));
    assert_eq!(snapshot.connection_key.as_deref(), Some("key-1"));
    assert_eq!(
        snapshot.active_transport,
        Some((TransportKind::WebSocket, "primary.test".to_string()))
    );
    assert_eq!(server.attempts().len(), 1);
    assert_eq!(server.attempts()[0].mode, "new");
}

#[tokio::test(start_paused = true)]
async fn connect_while_connected_is_a_no_op() {
    let mut h = connected().await;
    h.drain();

    h.connection.connect().await.unwrap();
    settle().await;

    assert!(h.drain().is_empty());
    assert_eq!(h.server.attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn close_is_idempotent() {
    let mut h = connected().await;
    h.drain();
    let link = h.server.latest().unwrap();

    h.connection.close().await.unwrap();
    h.connection.close().await.unwrap();
    h.connection
        .wait_for_state(ConnectionState::Closed)
        .await
        .unwrap();
    h.connection.close().await.unwrap();
    settle().await;

    let changes: Vec<_> = h
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            ConnectionEvent::StateChange(change) => Some(change.current),
            _ => None,
        })
        .collect();
    assert_eq!(
        changes,
        vec![ConnectionState::Closing, ConnectionState::Closed]
    );

    let closes = link
        .received()
        .iter()
        .filter(|m| m.action == Action::Close)
        .count();
    assert_eq!(closes, 1);
    assert!(!link.is_open());
    assert_eq!(h.connection.connection_key(), None);
}

#[tokio::test(start_paused = true)]
async fn closed_connection_rejects_work() {
    let h = connected().await;
    h.connection.close().await.unwrap();
    h.connection
        .wait_for_state(ConnectionState::Closed)
        .await
        .unwrap();

    assert_matches!(
        h.connection.connect().await,
        Err(ConnectionError::InvalidTransition(_))
    );
    let rejected = h.connection.send(chat("late")).await.unwrap_err();
    assert_eq!(rejected.kind(), ErrorKind::Closed);
    assert_eq!(h.connection.ping().await.unwrap_err().kind(), ErrorKind::Closed);
}

#[tokio::test(start_paused = true)]
async fn unanswered_close_completes_after_request_timeout() {
    let mut h = connected().await;
    h.drain();
    h.server.set_answer_close(false);
    let started = tokio::time::Instant::now();

    h.connection.close().await.unwrap();
    assert_eq!(h.next_state().await.current, ConnectionState::Closing);
    let closed = h.next_state().await;

    assert_eq!(closed.current, ConnectionState::Closed);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(1), "closed after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1_005), "closed after {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn close_before_connect_fails_queued_messages() {
    let server = MockServer::new();
    let mut h = start(&server, config(&[TransportKind::WebSocket]));

    let pending = h.connection.send(chat("early"));
    h.connection.close().await.unwrap();

    let change = h.next_state().await;
    assert_eq!(change.previous, ConnectionState::Initialized);
    assert_eq!(change.current, ConnectionState::Closed);
    assert_eq!(pending.await.unwrap_err().code, codes::CONNECTION_CLOSED);
    assert!(server.attempts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn close_while_connecting_abandons_attempt() {
    let server = MockServer::new();
    server.set_host("primary.test", HostBehavior::Hang);
    let mut h = start(&server, config(&[TransportKind::WebSocket]));

    h.connection.connect().await.unwrap();
    settle().await;
    assert_eq!(h.connection.state(), ConnectionState::Connecting);

    h.connection.close().await.unwrap();
    let states: Vec<_> = [h.next_state().await, h.next_state().await, h.next_state().await]
        .into_iter()
        .map(|change| change.current)
        .collect();
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Closing,
            ConnectionState::Closed
        ]
    );

    // The abandoned attempt never reaches another host
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(server.attempted_hosts(), vec!["primary.test".to_string()]);
    assert_eq!(server.live_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn authentication_error_fails_connection() {
    let server = MockServer::new();
    server.set_host(
        "primary.test",
        HostBehavior::Reject(ErrorInfo::unauthorized("token revoked")),
    );
    let mut h = start(&server, config(&[TransportKind::WebSocket]));
    let pending = h.connection.send(chat("queued"));

    h.connection.connect().await.unwrap();
    let failed = h.until_state(ConnectionState::Failed).await;

    let reason = failed.reason.unwrap();
    assert_eq!(reason.code, codes::UNAUTHORIZED);
    assert_eq!(pending.await.unwrap_err().code, codes::UNAUTHORIZED);
    settle().await;
    assert_eq!(server.attempts().len(), 1);
    assert_eq!(server.live_connections(), 0);

    // Failed is not terminal for explicit reconnects
    server.set_host("primary.test", HostBehavior::Accept);
    h.connection.connect().await.unwrap();
    h.connection
        .wait_for_state(ConnectionState::Connected)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn fatal_error_on_active_transport_fails_connection() {
    let mut h = connected().await;
    h.drain();
    let pending = {
        h.server.set_auto_ack(false);
        h.connection.send(chat("in flight"))
    };
    settle().await;

    let link = h.server.latest().unwrap();
    link.send(&ProtocolMessage::error(ErrorInfo::forbidden("account disabled")));

    let failed = h.next_state().await;
    assert_eq!(failed.current, ConnectionState::Failed);
    assert_eq!(failed.reason.unwrap().kind(), ErrorKind::AuthorizationFailed);
    assert_eq!(
        pending.await.unwrap_err().kind(),
        ErrorKind::AuthorizationFailed
    );
    assert_eq!(h.connection.connection_id(), None);
}

#[tokio::test(start_paused = true)]
async fn no_available_transport_fails_connection() {
    let server = MockServer::new();
    server.set_available(TransportKind::WebSocket, false);
    let mut h = start(&server, config(&[TransportKind::WebSocket]));

    h.connection.connect().await.unwrap();
    let failed = h.until_state(ConnectionState::Failed).await;

    assert_eq!(failed.reason.unwrap().code, codes::TRANSPORT_UNAVAILABLE);
    assert!(server.attempts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn dropping_every_handle_disposes_engine() {
    let h = connected().await;
    h.server.set_auto_ack(false);
    let pending = h.connection.send(chat("never acked"));
    settle().await;
    let server = h.server.clone();
    assert_eq!(server.live_connections(), 1);

    drop(h);

    assert_eq!(pending.await.unwrap_err().kind(), ErrorKind::Closed);
    settle().await;
    assert_eq!(server.live_connections(), 0);
}

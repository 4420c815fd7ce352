//! Message submission, acknowledgement and inbound delivery
#![allow(missing_docs, clippy::expect_used, clippy::unwrap_used)]

mod common;

use common::{config, connected, start};
use futures::future::join_all;
use std::time::Duration;
use tether_core::{codes, Action, ConnectionState, ErrorInfo, ErrorKind, ProtocolMessage, TransportKind};
use tether_testkit::{settle, HostBehavior, MockServer};

fn chat(text: &str) -> ProtocolMessage {
    ProtocolMessage::message("chat", serde_json::json!({ "text": text }))
}

#[tokio::test(start_paused = true)]
async fn messages_queued_while_disconnected_keep_serial_order() {
    let h = connected().await;
    h.server.latest().unwrap().drop_link();
    h.connection
        .wait_for_state(ConnectionState::Disconnected)
        .await
        .unwrap();

    let queued: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|text| h.connection.send(chat(text)))
        .collect();
    settle().await;
    assert_eq!(h.connection.snapshot().pending, 3);

    h.connection
        .wait_for_state(ConnectionState::Connected)
        .await
        .unwrap();
    let results = join_all(queued).await;
    assert!(results.iter().all(Result::is_ok), "{results:?}");
    h.connection.send(chat("d")).await.unwrap();

    let link = h.server.latest().unwrap();
    assert_eq!(link.received_serials(), vec![0, 1, 2, 3]);
    assert_eq!(h.server.received_serials(), vec![0, 1, 2, 3]);
    assert_eq!(h.connection.snapshot().pending, 0);
}

#[tokio::test(start_paused = true)]
async fn nack_fails_only_the_refused_message() {
    let h = connected().await;
    h.server
        .nack_serial(1, ErrorInfo::message_rejected("channel is read-only"));

    let first = h.connection.send(chat("one"));
    let second = h.connection.send(chat("two"));
    let third = h.connection.send(chat("three"));

    assert_eq!(first.await, Ok(()));
    let refused = second.await.unwrap_err();
    assert_eq!(refused.code, codes::MESSAGE_REJECTED);
    assert_eq!(refused.message, "channel is read-only");
    assert_eq!(third.await, Ok(()));
    assert_eq!(h.connection.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_messages_are_resent_after_resume() {
    let h = connected().await;
    h.server.set_auto_ack(false);

    let first = h.connection.send(chat("one"));
    let second = h.connection.send(chat("two"));
    settle().await;
    let original = h.server.latest().unwrap();
    assert_eq!(original.received_serials(), vec![0, 1]);

    h.server.set_auto_ack(true);
    original.drop_link();
    h.connection
        .wait_for_state(ConnectionState::Disconnected)
        .await
        .unwrap();
    h.connection
        .wait_for_state(ConnectionState::Connected)
        .await
        .unwrap();

    assert_eq!(first.await, Ok(()));
    assert_eq!(second.await, Ok(()));
    let resumed = h.server.latest().unwrap();
    assert_eq!(resumed.connection_id(), original.connection_id());
    assert_eq!(resumed.received_serials(), vec![0, 1]);
}

#[tokio::test(start_paused = true)]
async fn oversized_message_is_rejected_without_taking_a_serial() {
    let server = MockServer::new();
    server.set_max_message_size(Some(128));
    let h = start(&server, config(&[TransportKind::WebSocket]));
    h.connection.connect().await.unwrap();
    h.connection
        .wait_for_state(ConnectionState::Connected)
        .await
        .unwrap();

    let rejected = h.connection.send(chat(&"x".repeat(512))).await.unwrap_err();
    assert_eq!(rejected.code, codes::MESSAGE_TOO_LARGE);

    h.connection.send(chat("fits")).await.unwrap();
    assert_eq!(server.received_serials(), vec![0]);
}

#[tokio::test(start_paused = true)]
async fn control_actions_cannot_be_submitted() {
    let h = connected().await;

    for action in [Action::Heartbeat, Action::Close, Action::Ack] {
        let rejected = h
            .connection
            .send(ProtocolMessage::new(action))
            .await
            .unwrap_err();
        assert_eq!(rejected.kind(), ErrorKind::MessageRejected, "{action}");
    }
    assert_eq!(h.connection.snapshot().next_msg_serial, 0);
}

#[tokio::test(start_paused = true)]
async fn queueing_disabled_rejects_until_connected() {
    let server = MockServer::new();
    let h = start(
        &server,
        config(&[TransportKind::WebSocket]).with_queue_messages(false),
    );

    let early = h.connection.send(chat("too soon")).await.unwrap_err();
    assert_eq!(early.kind(), ErrorKind::NetworkUnreachable);

    h.connection.connect().await.unwrap();
    h.connection
        .wait_for_state(ConnectionState::Connected)
        .await
        .unwrap();
    h.connection.send(chat("now")).await.unwrap();
    assert_eq!(server.received_serials(), vec![0]);
}

#[tokio::test(start_paused = true)]
async fn suspended_connection_still_queues() {
    let server = MockServer::new();
    common::refuse_all_hosts(&server);
    let h = start(&server, config(&[TransportKind::WebSocket]));
    h.connection.connect().await.unwrap();
    h.connection
        .wait_for_state(ConnectionState::Suspended)
        .await
        .unwrap();

    let queued = h.connection.send(chat("while suspended"));
    common::set_all_hosts(&server, HostBehavior::Accept);

    queued.await.unwrap();
    assert_eq!(h.connection.state(), ConnectionState::Connected);
    assert_eq!(server.received_serials(), vec![0]);
}

#[tokio::test(start_paused = true)]
async fn duplicate_inbound_messages_are_dropped() {
    let h = connected().await;
    let mut inbound = h.connection.inbound();
    let link = h.server.latest().unwrap();

    for serial in [1, 2, 2, 1, 3] {
        link.send(&chat("from server").with_connection_serial(serial));
    }
    settle().await;

    let mut delivered = Vec::new();
    while let Ok(message) = inbound.try_recv() {
        delivered.push(message.connection_serial);
    }
    assert_eq!(delivered, vec![Some(1), Some(2), Some(3)]);
    assert_eq!(h.connection.snapshot().serial, Some(3));
}

#[tokio::test(start_paused = true)]
async fn ping_measures_round_trip() {
    let h = connected().await;
    assert_eq!(h.connection.ping().await, Ok(Duration::ZERO));

    h.server.set_echo_heartbeats(false);
    let started = tokio::time::Instant::now();
    let timed_out = h.connection.ping().await.unwrap_err();
    assert_eq!(timed_out.kind(), ErrorKind::Timeout);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(1), "timed out after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1_005), "timed out after {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn ping_requires_connection() {
    let server = MockServer::new();
    let h = start(&server, config(&[TransportKind::WebSocket]));
    let refused = h.connection.ping().await.unwrap_err();
    assert_eq!(refused.kind(), ErrorKind::NetworkUnreachable);
}

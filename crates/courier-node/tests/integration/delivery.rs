//! End-to-end delivery: edge chat -> ingest -> outbox -> bus -> fanout -> push.

use std::time::Duration;

use courier_node::bus::MessageBus;
use courier_protocol::{Packet, Payload, PUSH_EVENT_TOPIC};

use crate::harness::TestNode;

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_three_member_session_single_ack_three_inbox_records() {
    let node = TestNode::start().await;
    node.create_session("team", "group", &["alice", "bob", "carol"])
        .await;

    let mut alice = node.connect("alice").await;
    let ack = alice.chat("team", "hi").await;
    assert!(ack.error.is_none(), "ack error: {:?}", ack.error);
    assert_ne!(ack.msg_id, 0);
    assert_eq!(ack.seq_id, 1);

    for owner in ["alice", "bob", "carol"] {
        node.wait_inbox(owner, "team", 1, WAIT).await;
        let records = node.inbox(owner, "team").await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["content"], "hi");
        assert_eq!(records[0]["msg_id"], ack.msg_id);
    }

    // Exactly one ack, and the sender is not pushed its own message.
    assert!(alice.recv(Duration::from_millis(300)).await.is_none());

    node.shutdown().await;
}

#[tokio::test]
async fn test_online_recipient_pushed_offline_recipient_inboxed() {
    let node = TestNode::start().await;
    node.create_session("team", "group", &["alice", "bob", "carol"])
        .await;

    let mut bob = node.connect("bob").await;
    let mut alice = node.connect("alice").await;
    let ack = alice.chat("team", "hello bob").await;
    assert!(ack.error.is_none());

    let pushed = bob.expect_push(WAIT).await;
    assert_eq!(pushed.msg_id, ack.msg_id);
    assert_eq!(pushed.seq_id, ack.seq_id);
    assert_eq!(pushed.from, "alice");
    assert_eq!(pushed.content, "hello bob");

    // carol is offline: no push, but the inbox has the message.
    node.wait_inbox("carol", "team", 1, WAIT).await;
    let diag = node.diagnostics().await;
    assert_eq!(diag["pipeline"]["push_recipients_offline"], 1);
    assert_eq!(diag["pipeline"]["push_tasks_enqueued"], 1);

    node.shutdown().await;
}

#[tokio::test]
async fn test_session_order_visible_to_recipient() {
    let node = TestNode::start().await;
    node.create_session("dm", "direct", &["alice", "bob"]).await;

    let mut bob = node.connect("bob").await;
    let mut alice = node.connect("alice").await;
    for i in 1..=5 {
        let ack = alice.chat("dm", &format!("m{i}")).await;
        assert_eq!(ack.seq_id, i);
    }

    let mut seen = Vec::new();
    for _ in 0..5 {
        seen.push(bob.expect_push(WAIT).await.seq_id);
    }
    seen.sort();
    assert_eq!(seen, vec![1, 2, 3, 4, 5]);

    node.shutdown().await;
}

#[tokio::test]
async fn test_non_member_chat_is_acked_with_error() {
    let node = TestNode::start().await;
    node.create_session("team", "group", &["alice", "bob"]).await;

    let mut mallory = node.connect("mallory").await;
    let ack = mallory.chat("team", "let me in").await;
    assert_eq!(ack.msg_id, 0);
    assert!(ack.error.unwrap().contains("permission denied"));

    let diag = node.diagnostics().await;
    assert_eq!(diag["store"]["messages"], 0);

    node.shutdown().await;
}

#[tokio::test]
async fn test_pulse_is_echoed() {
    let node = TestNode::start().await;
    let mut client = node.connect("alice").await;

    client.send(Packet::pulse("hb-1", 1234)).await;
    let echo = client.recv(WAIT).await.unwrap();
    assert_eq!(echo.seq, "hb-1");
    assert!(matches!(echo.payload, Payload::Pulse(p) if p.sent_at_ms == 1234));

    node.shutdown().await;
}

#[tokio::test]
async fn test_poison_event_acked_and_pipeline_continues() {
    let node = TestNode::start().await;
    node.create_session("team", "group", &["alice", "bob"]).await;

    node.bus
        .publish(PUSH_EVENT_TOPIC, b"not an event".to_vec())
        .await
        .unwrap();

    let mut alice = node.connect("alice").await;
    alice.chat("team", "still works").await;
    node.wait_inbox("bob", "team", 1, WAIT).await;

    // The dispatched counter ticks after the handler returns.
    let deadline = tokio::time::Instant::now() + WAIT;
    let diag = loop {
        let diag = node.diagnostics().await;
        if diag["pipeline"]["events_dispatched"] == 1 || tokio::time::Instant::now() > deadline {
            break diag;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert_eq!(diag["pipeline"]["events_poison"], 1);
    assert_eq!(diag["pipeline"]["events_dispatched"], 1);

    node.shutdown().await;
}

#[tokio::test]
async fn test_status_reports_connections_and_self() {
    let node = TestNode::start().await;
    let _alice = node.connect("alice").await;

    let status = node
        .api_post("/api/v1/status", serde_json::json!({}))
        .await
        .unwrap();
    assert_eq!(status["node_id"], "edge-1");
    assert_eq!(status["connections"], 1);
    assert_eq!(status["live_edge_nodes"][0], "edge-1");

    node.shutdown().await;
}

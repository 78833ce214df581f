//! Outbox relay behaviour against a bus that refuses publishes.

use std::time::Duration;

use courier_storage::IntentStatus;

use crate::harness::{FlakyBus, TestNode};

const WAIT: Duration = Duration::from_secs(10);

async fn send_via_api(node: &TestNode, content: &str) -> u64 {
    let resp = node
        .api_post(
            "/api/v1/messages/send",
            serde_json::json!({
                "session_id": "team",
                "sender": "alice",
                "content": content,
                "type": 1,
                "client_token": "api-1",
            }),
        )
        .await
        .unwrap();
    resp["msg_id"].as_u64().unwrap()
}

async fn wait_status(node: &TestNode, id: i64, status: IntentStatus) {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let intent = node.store.read_intent(id).unwrap().unwrap();
        if intent.status == status {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("intent {id} stuck at {:?}, wanted {status:?}", intent.status);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_transient_bus_failures_retried_until_sent() {
    let node = TestNode::start_with(FlakyBus::new(3), |_| {}).await;
    node.create_session("team", "group", &["alice", "bob"]).await;

    let msg_id = send_via_api(&node, "eventually").await;
    wait_status(&node, 1, IntentStatus::Sent).await;

    let intent = node.store.read_intent(1).unwrap().unwrap();
    assert_eq!(intent.msg_id, msg_id);
    assert_eq!(intent.retry_count, 3);

    // Once published the message still reaches every inbox.
    node.wait_inbox("bob", "team", 1, WAIT).await;

    let diag = node.diagnostics().await;
    assert_eq!(diag["pipeline"]["intents_retried"], 3);
    assert_eq!(diag["pipeline"]["intents_published"], 1);
    // Sent only once the consumer fanned it out.
    assert_eq!(diag["pipeline"]["intents_settled"], 1);
    assert_eq!(diag["pipeline"]["intents_deferred"], 0);

    node.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_intent_listed_then_requeued() {
    let node = TestNode::start_with(FlakyBus::new(u32::MAX), |cfg| {
        cfg.relay.max_retry = 2;
    })
    .await;
    node.create_session("team", "group", &["alice", "bob"]).await;

    send_via_api(&node, "stuck").await;
    wait_status(&node, 1, IntentStatus::Failed).await;

    let failed = node
        .api_post("/api/v1/outbox/failed", serde_json::json!({}))
        .await
        .unwrap();
    let intents = failed["intents"].as_array().unwrap();
    assert_eq!(intents.len(), 1);
    assert_eq!(intents[0]["id"], 1);
    assert_eq!(intents[0]["retry_count"], 2);
    assert!(intents[0]["last_error"]
        .as_str()
        .unwrap()
        .contains("injected failure"));

    // Failed intents are not swept again.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let intent = node.store.read_intent(1).unwrap().unwrap();
    assert_eq!(intent.status, IntentStatus::Failed);
    assert!(node.inbox("bob", "team").await.is_empty());

    node.bus.set_failures(0);
    node.api_post("/api/v1/outbox/requeue", serde_json::json!({ "id": 1 }))
        .await
        .unwrap();
    wait_status(&node, 1, IntentStatus::Sent).await;
    node.wait_inbox("bob", "team", 1, WAIT).await;

    node.shutdown().await;
}

#[tokio::test]
async fn test_requeue_of_unknown_intent_is_not_found() {
    let node = TestNode::start().await;

    let (status, _) = node
        .api_post_raw("/api/v1/outbox/requeue", serde_json::json!({ "id": 42 }))
        .await
        .unwrap();
    assert_eq!(status, 404);

    node.shutdown().await;
}

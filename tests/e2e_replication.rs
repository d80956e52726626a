// tests/e2e_replication.rs
mod helpers;

use helpers::{
    can_bind_loopback, free_port, spawn_mock_peer, spawn_registry, test_config, wait_for_batches,
    wait_for_health,
};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

fn sample_record(app: &str, id: &str) -> Value {
    json!({
        "app_name": app,
        "instance_id": id,
        "host_name": format!("{}.internal", id),
        "ip_addr": "10.0.0.2",
        "port": 8080,
        "status": "UP"
    })
}

#[tokio::test]
async fn test_local_writes_are_batched_to_peer() {
    if !can_bind_loopback().await {
        eprintln!("skipping e2e replication test: cannot bind to loopback in this environment");
        return;
    }

    let client = Client::new();

    let peer_port = free_port().await;
    let (mock_peer, peer_url) = spawn_mock_peer(peer_port).await;
    wait_for_health(&client, &peer_url).await;

    let app_port = free_port().await;
    let mut config = test_config(app_port);
    config.node_name = "node-a".to_string();
    config.peers = vec![peer_url.clone()];
    // Keep heartbeats out of the way so every batch seen is data.
    config.replication.heartbeat_interval_secs = 600;
    let node = spawn_registry(config).await;
    wait_for_health(&client, &node.base_url).await;

    let resp = client
        .post(format!("{}/v1/apps/checkout", node.base_url))
        .json(&sample_record("checkout", "i-1"))
        .send()
        .await
        .expect("failed to register");
    assert_eq!(resp.status().as_u16(), 204);

    let batches = wait_for_batches(&client, &peer_url, 1).await;
    assert_eq!(batches[0]["source_node"], "node-a");
    let op = &batches[0]["operations"][0];
    assert_eq!(op["action"], "register");
    assert_eq!(op["record"]["app_name"], "CHECKOUT");
    assert_eq!(op["record"]["instance_id"], "i-1");

    // A renew rides over as its own operation.
    client
        .put(format!("{}/v1/apps/checkout/i-1/renew", node.base_url))
        .send()
        .await
        .unwrap();
    let batches = wait_for_batches(&client, &peer_url, 2).await;
    let renew_seen = batches.iter().any(|batch| {
        batch["operations"]
            .as_array()
            .map(|ops| ops.iter().any(|op| op["action"] == "renew"))
            .unwrap_or(false)
    });
    assert!(renew_seen, "renew operation never reached the peer");

    node.stop().await;
    mock_peer.stop().await;
}

#[tokio::test]
async fn test_peer_batch_applies_without_echo() {
    if !can_bind_loopback().await {
        eprintln!("skipping e2e replication test: cannot bind to loopback in this environment");
        return;
    }

    let client = Client::new();

    let peer_port = free_port().await;
    let (mock_peer, peer_url) = spawn_mock_peer(peer_port).await;
    wait_for_health(&client, &peer_url).await;

    let app_port = free_port().await;
    let mut config = test_config(app_port);
    config.peers = vec![peer_url.clone()];
    config.replication.heartbeat_interval_secs = 600;
    let node = spawn_registry(config).await;
    wait_for_health(&client, &node.base_url).await;

    // A batch arriving from another node applies locally.
    let batch = json!({
        "source_node": "node-b",
        "operations": [
            { "action": "register", "record": {
                "app_name": "CHECKOUT",
                "instance_id": "i-9",
                "host_name": "i-9.internal",
                "ip_addr": "10.0.0.9",
                "port": 8080,
                "status": "UP",
                "last_dirty_timestamp_ms": 50_000
            }},
            { "action": "renew", "app_name": "CHECKOUT", "instance_id": "ghost" }
        ]
    });
    let response: Value = client
        .post(format!("{}/v1/peer/batch", node.base_url))
        .json(&batch)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response["results"][0], "applied");
    assert_eq!(response["results"][1], "not_found");

    let body: Value = client
        .get(format!("{}/v1/apps?format=full", node.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        body["applications"][0]["instances"][0]["instance_id"],
        "i-9"
    );

    // A stale register (older dirty timestamp) is refused.
    let stale = json!({
        "source_node": "node-b",
        "operations": [
            { "action": "register", "record": {
                "app_name": "CHECKOUT",
                "instance_id": "i-9",
                "host_name": "i-9.internal",
                "ip_addr": "10.0.0.9",
                "port": 8080,
                "status": "DOWN",
                "last_dirty_timestamp_ms": 1
            }}
        ]
    });
    let response: Value = client
        .post(format!("{}/v1/peer/batch", node.base_url))
        .json(&stale)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response["results"][0], "stale");

    // Replicated writes must not fan back out: the mock peer stays silent.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let batches: Vec<Value> = client
        .get(format!("{}/batches", peer_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(
        batches.is_empty(),
        "replicated write echoed back to the peer: {:?}",
        batches
    );

    node.stop().await;
    mock_peer.stop().await;
}

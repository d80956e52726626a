// tests/e2e_eviction.rs
mod helpers;

use helpers::{can_bind_loopback, free_port, poll_until, spawn_registry, test_config, wait_for_health};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

fn short_lease_record(app: &str, id: &str) -> Value {
    json!({
        "app_name": app,
        "instance_id": id,
        "host_name": format!("{}.internal", id),
        "ip_addr": "10.0.0.3",
        "port": 8080,
        "status": "UP",
        "lease_duration_secs": 1
    })
}

async fn store_instance_count(client: &Client, base_url: &str) -> Option<u64> {
    let status: Value = client
        .get(format!("{}/v1/status", base_url))
        .send()
        .await
        .ok()?
        .json()
        .await
        .ok()?;
    status["instance_count"].as_u64()
}

#[tokio::test]
async fn test_expired_leases_are_evicted() {
    if !can_bind_loopback().await {
        eprintln!("skipping e2e eviction test: cannot bind to loopback in this environment");
        return;
    }

    let client = Client::new();
    let port = free_port().await;
    let mut config = test_config(port);
    config.lease.eviction_interval_secs = 1;
    config.lease.eviction_jitter_ms = 0;
    let node = spawn_registry(config).await;
    wait_for_health(&client, &node.base_url).await;

    client
        .post(format!("{}/v1/apps/checkout", node.base_url))
        .json(&short_lease_record("checkout", "i-1"))
        .send()
        .await
        .unwrap();
    // Default lease, stays alive well past this test.
    client
        .post(format!("{}/v1/apps/billing", node.base_url))
        .json(&json!({
            "app_name": "billing",
            "instance_id": "i-2",
            "host_name": "i-2.internal",
            "ip_addr": "10.0.0.4",
            "port": 8080,
            "status": "UP"
        }))
        .send()
        .await
        .unwrap();

    poll_until(|| async {
        (store_instance_count(&client, &node.base_url).await? == 1).then_some(())
    })
    .await
    .expect("expired lease was never evicted");

    // The evicted lease is really gone, not just filtered from the view.
    let resp = client
        .delete(format!("{}/v1/apps/checkout/i-1", node.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);

    let body: Value = client
        .get(format!("{}/v1/apps?format=compact", node.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let apps = body["applications"].as_array().unwrap();
    assert_eq!(apps.len(), 1);
    assert_eq!(apps[0]["name"], "BILLING");

    node.stop().await;
}

#[tokio::test]
async fn test_self_preservation_blocks_eviction() {
    if !can_bind_loopback().await {
        eprintln!("skipping e2e eviction test: cannot bind to loopback in this environment");
        return;
    }

    let client = Client::new();
    let port = free_port().await;
    let mut config = test_config(port);
    config.preservation.enabled = true;
    config.lease.eviction_interval_secs = 1;
    config.lease.eviction_jitter_ms = 0;
    let node = spawn_registry(config).await;
    wait_for_health(&client, &node.base_url).await;

    client
        .post(format!("{}/v1/apps/checkout", node.base_url))
        .json(&short_lease_record("checkout", "i-1"))
        .send()
        .await
        .unwrap();
    client
        .post(format!("{}/v1/apps/checkout", node.base_url))
        .json(&short_lease_record("checkout", "i-2"))
        .send()
        .await
        .unwrap();

    // Both leases expire after 1s, and sweeps run every second, but with no
    // renewals arriving the monitor keeps eviction switched off.
    tokio::time::sleep(Duration::from_millis(3_500)).await;

    let status: Value = client
        .get(format!("{}/v1/status", node.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["self_preservation_active"], true);
    assert_eq!(status["instance_count"], 2);

    // Expired-but-preserved instances stay visible to readers.
    let body: Value = client
        .get(format!("{}/v1/apps?format=compact", node.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        body["applications"][0]["instances"].as_array().unwrap().len(),
        2
    );

    node.stop().await;
}

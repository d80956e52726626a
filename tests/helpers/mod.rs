#![allow(dead_code)] // Test helpers appear unused when compiled independently

use axum::{extract::State, routing::get, routing::post, Json, Router};
use reqwest::Client;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use herdbook::config::RegistryConfig;

const WAIT_ATTEMPTS: usize = 50;
const WAIT_DELAY: Duration = Duration::from_millis(100);

/// Find an available TCP port
pub async fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Best-effort check for whether binding to loopback is permitted in the current sandbox.
pub async fn can_bind_loopback() -> bool {
    match TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(_) => true, // treat other errors as non-fatal for skipping
    }
}

/// Baseline config for an in-process test node: loopback bind, standalone,
/// self-preservation off so tests control eviction explicitly.
pub fn test_config(port: u16) -> RegistryConfig {
    let mut config = RegistryConfig::default();
    config.node_name = "test-node".to_string();
    config.host = "127.0.0.1".to_string();
    config.port = port;
    config.preservation.enabled = false;
    config
}

pub struct RegistryNode {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
    pub base_url: String,
}

impl RegistryNode {
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}

/// Run a registry node in-process, return a handle and its base URL.
pub async fn spawn_registry(config: RegistryConfig) -> RegistryNode {
    let base_url = format!("http://127.0.0.1:{}", config.port);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        let result = herdbook::server::serve_with_shutdown(config, async {
            let _ = shutdown_rx.await;
        })
        .await;
        if let Err(err) = result {
            eprintln!("registry node error: {}", err);
        }
    });

    RegistryNode {
        shutdown_tx,
        handle,
        base_url,
    }
}

#[derive(Clone)]
struct PeerState {
    batches: Arc<Mutex<Vec<Value>>>,
}

pub struct MockPeer {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
    pub base_url: String,
}

impl MockPeer {
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}

/// Spawn a fake peer node that records every replication batch it receives
/// and acknowledges each operation as applied.
pub async fn spawn_mock_peer(port: u16) -> (MockPeer, String) {
    let state = PeerState {
        batches: Arc::new(Mutex::new(Vec::new())),
    };

    let app = Router::new()
        .route("/v1/peer/batch", post(record_batch))
        .route("/batches", get(batches))
        .route("/health", get(|| async { "ok" }))
        .with_state(state);

    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .expect("failed to bind mock peer listener");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        if let Err(err) = server.await {
            eprintln!("mock peer server error: {}", err);
        }
    });

    (
        MockPeer {
            shutdown_tx,
            handle,
            base_url: format!("http://127.0.0.1:{}", port),
        },
        format!("http://127.0.0.1:{}", port),
    )
}

async fn record_batch(State(state): State<PeerState>, Json(batch): Json<Value>) -> Json<Value> {
    let op_count = batch["operations"]
        .as_array()
        .map(|ops| ops.len())
        .unwrap_or(0);
    state.batches.lock().await.push(batch);
    Json(serde_json::json!({ "results": vec!["applied"; op_count] }))
}

async fn batches(State(state): State<PeerState>) -> Json<Vec<Value>> {
    Json(state.batches.lock().await.clone())
}

/// Wait for a server to respond to /health
pub async fn wait_for_health(client: &Client, base_url: &str) {
    poll_until(|| async {
        client
            .get(format!("{}/health", base_url))
            .send()
            .await
            .ok()
            .map(|_| ())
    })
    .await
    .unwrap_or_else(|| panic!("timed out waiting for {} to be healthy", base_url));
}

/// Poll the mock peer until it has recorded at least `min_count` batches
pub async fn wait_for_batches(client: &Client, base_url: &str, min_count: usize) -> Vec<Value> {
    poll_until(|| async {
        match client.get(format!("{}/batches", base_url)).send().await.ok() {
            Some(resp) => match resp.json::<Vec<Value>>().await.ok() {
                Some(batches) if batches.len() >= min_count => Some(batches),
                _ => None,
            },
            None => None,
        }
    })
    .await
    .unwrap_or_else(|| panic!("timed out waiting for {} batches at {}", min_count, base_url))
}

/// Poll the registry until the all-applications view holds exactly
/// `instance_count` instances.
pub async fn wait_for_instance_count(client: &Client, base_url: &str, instance_count: usize) {
    poll_until(|| async {
        let body = client
            .get(format!("{}/v1/apps?format=compact", base_url))
            .send()
            .await
            .ok()?
            .json::<Value>()
            .await
            .ok()?;
        let total: usize = body["applications"]
            .as_array()?
            .iter()
            .map(|app| app["instances"].as_array().map(|i| i.len()).unwrap_or(0))
            .sum();
        (total == instance_count).then_some(())
    })
    .await
    .unwrap_or_else(|| {
        panic!(
            "timed out waiting for {} instances at {}",
            instance_count, base_url
        )
    });
}

pub async fn poll_until<T, F, Fut>(mut f: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for _ in 0..WAIT_ATTEMPTS {
        if let Some(result) = f().await {
            return Some(result);
        }
        tokio::time::sleep(WAIT_DELAY).await;
    }
    None
}

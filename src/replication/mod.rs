//! Asynchronous peer replication.
//!
//! Local mutations fan out to a bounded queue per configured peer; one
//! delivery task per peer drains its queue into batched POSTs against the
//! peer's batch endpoint. Replication is best-effort: client operations
//! never wait on it, transient failures retry with backoff, and anything
//! else is dropped with a counter. Correctness leans on lease expiry and the
//! renew-miss heal rather than on guaranteed delivery.

pub mod client;
pub mod peer;
pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::instance::{InstanceRecord, InstanceStatus};
use crate::store::InstanceStore;

pub use client::{PeerClient, ReplicationSendError};
pub use peer::{PeerStatus, ReplayEntry};
pub use retry::{with_retry, BackoffStrategy, IsRetryable, RetryConfig};

use peer::PeerReplicator;

/// One replicated operation on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReplicationAction {
    Register {
        record: InstanceRecord,
    },
    Renew {
        app_name: String,
        instance_id: String,
    },
    Cancel {
        app_name: String,
        instance_id: String,
    },
    StatusUpdate {
        app_name: String,
        instance_id: String,
        status: InstanceStatus,
        dirty_timestamp_ms: u64,
    },
    Heartbeat,
}

impl ReplicationAction {
    pub fn kind(&self) -> &'static str {
        match self {
            ReplicationAction::Register { .. } => "register",
            ReplicationAction::Renew { .. } => "renew",
            ReplicationAction::Cancel { .. } => "cancel",
            ReplicationAction::StatusUpdate { .. } => "status_update",
            ReplicationAction::Heartbeat => "heartbeat",
        }
    }

    /// Whether losing this task is self-correcting. A dropped renew is
    /// covered by the next one; registers, cancels, and status updates carry
    /// state a peer cannot reconstruct quickly.
    pub fn is_droppable(&self) -> bool {
        matches!(
            self,
            ReplicationAction::Renew { .. } | ReplicationAction::Heartbeat
        )
    }
}

/// An action waiting in a peer queue.
#[derive(Debug, Clone)]
pub struct ReplicationTask {
    pub action: ReplicationAction,
    pub queued_at_ms: u64,
}

/// Payload of `POST /v1/peer/batch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationBatch {
    pub source_node: String,
    pub operations: Vec<ReplicationAction>,
}

/// Per-operation results, index-aligned with the batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchResponse {
    pub results: Vec<OperationOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationOutcome {
    Applied,
    NotFound,
    Stale,
    Conflict,
    Invalid,
}

/// Dispatcher wiring, produced from the node config.
#[derive(Debug, Clone)]
pub struct ReplicationOptions {
    pub node_name: String,
    pub peers: Vec<String>,
    pub queue_capacity: usize,
    pub batch_max: usize,
    pub heartbeat_interval: Duration,
    pub send_timeout: Duration,
    pub retry: RetryConfig,
    pub replay_log_size: usize,
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self {
            node_name: "local".to_string(),
            peers: Vec::new(),
            queue_capacity: 1_000,
            batch_max: 250,
            heartbeat_interval: Duration::from_secs(30),
            send_timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
            replay_log_size: 64,
        }
    }
}

/// Fans local mutations out to every configured peer.
pub struct ReplicationDispatcher {
    options: ReplicationOptions,
    peers: Vec<Arc<PeerReplicator>>,
}

impl ReplicationDispatcher {
    pub fn new(options: ReplicationOptions) -> Self {
        let peers = options
            .peers
            .iter()
            .map(|url| {
                Arc::new(PeerReplicator::new(
                    url.clone(),
                    options.queue_capacity,
                    options.batch_max,
                    options.heartbeat_interval,
                    options.replay_log_size,
                ))
            })
            .collect();
        Self { options, peers }
    }

    pub fn node_name(&self) -> &str {
        &self.options.node_name
    }

    pub fn has_peers(&self) -> bool {
        !self.peers.is_empty()
    }

    /// Start one delivery task per peer. No-op for a standalone node.
    pub fn spawn(
        &self,
        store: Arc<InstanceStore>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), String> {
        if self.peers.is_empty() {
            return Ok(());
        }
        let client = Arc::new(PeerClient::new(
            self.options.send_timeout,
            self.options.retry.clone(),
        )?);
        for peer in &self.peers {
            tokio::spawn(peer.clone().run(
                client.clone(),
                store.clone(),
                self.options.node_name.clone(),
                shutdown.clone(),
            ));
        }
        Ok(())
    }

    /// Queue a local mutation for every peer. Non-blocking; overflow policy
    /// lives in the peer queue.
    pub fn replicate(&self, action: ReplicationAction, now_ms: u64) {
        if self.peers.is_empty() {
            return;
        }
        for peer in &self.peers {
            peer.enqueue(ReplicationTask {
                action: action.clone(),
                queued_at_ms: now_ms,
            });
        }
        debug!(
            action = action.kind(),
            peers = self.peers.len(),
            "queued for replication"
        );
    }

    pub fn status(&self) -> Vec<PeerStatus> {
        self.peers.iter().map(|p| p.status()).collect()
    }
}

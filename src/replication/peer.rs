//! Per-peer delivery: bounded task queue drained by one async task per peer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::replication::client::PeerClient;
use crate::replication::{
    BatchResponse, OperationOutcome, ReplicationAction, ReplicationBatch, ReplicationTask,
};
use crate::store::InstanceStore;

/// One attempted batch delivery, kept in a bounded per-peer replay log.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayEntry {
    pub at_ms: u64,
    pub operation_count: usize,
    pub outcome: String,
}

/// Point-in-time replication state for one peer.
#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    pub peer: String,
    pub pending: usize,
    pub dropped: u64,
    pub recent_batches: Vec<ReplayEntry>,
}

pub(crate) struct PeerReplicator {
    url: String,
    queue: Mutex<VecDeque<ReplicationTask>>,
    notify: Notify,
    dropped: AtomicU64,
    replay: Mutex<VecDeque<ReplayEntry>>,
    queue_capacity: usize,
    batch_max: usize,
    heartbeat_interval: Duration,
    replay_log_size: usize,
}

impl PeerReplicator {
    pub(crate) fn new(
        url: String,
        queue_capacity: usize,
        batch_max: usize,
        heartbeat_interval: Duration,
        replay_log_size: usize,
    ) -> Self {
        Self {
            url,
            queue: Mutex::new(VecDeque::with_capacity(queue_capacity.min(1024))),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            replay: Mutex::new(VecDeque::with_capacity(replay_log_size)),
            queue_capacity: queue_capacity.max(1),
            batch_max: batch_max.max(1),
            heartbeat_interval,
            replay_log_size: replay_log_size.max(1),
        }
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    /// Queue a task for delivery. On overflow the oldest self-correcting task
    /// (renew, heartbeat) is dropped first; if none exists, the oldest task
    /// goes. Peers converge anyway through lease expiry on their side.
    pub(crate) fn enqueue(&self, task: ReplicationTask) {
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= self.queue_capacity {
                let victim = queue
                    .iter()
                    .position(|t| t.action.is_droppable())
                    .unwrap_or(0);
                if let Some(dropped) = queue.remove(victim) {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        peer = %self.url,
                        action = dropped.action.kind(),
                        queued_at_ms = dropped.queued_at_ms,
                        "replication queue full, dropping task"
                    );
                }
            }
            queue.push_back(task);
        }
        self.notify.notify_one();
    }

    pub(crate) fn status(&self) -> PeerStatus {
        PeerStatus {
            peer: self.url.clone(),
            pending: self.queue.lock().unwrap().len(),
            dropped: self.dropped.load(Ordering::Relaxed),
            recent_batches: self.replay.lock().unwrap().iter().cloned().collect(),
        }
    }

    /// Delivery loop. Drains up to `batch_max` tasks per POST; when idle for
    /// `heartbeat_interval` it sends a lone heartbeat so a silent peer is
    /// still distinguishable from a dead link. Pending tasks are dropped at
    /// shutdown.
    pub(crate) async fn run(
        self: Arc<Self>,
        client: Arc<PeerClient>,
        store: Arc<InstanceStore>,
        node_name: String,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(peer = %self.url, "peer replication task started");
        loop {
            let operations = self.drain_batch();
            if operations.is_empty() {
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep(self.heartbeat_interval) => {
                        self.deliver(&client, &store, &node_name, vec![ReplicationAction::Heartbeat])
                            .await;
                    }
                    _ = shutdown.changed() => break,
                }
                continue;
            }

            self.deliver(&client, &store, &node_name, operations).await;
            if *shutdown.borrow() {
                break;
            }
        }

        let pending = self.queue.lock().unwrap().len();
        if pending > 0 {
            debug!(peer = %self.url, pending, "discarding queued replication tasks at shutdown");
        }
        info!(peer = %self.url, "peer replication task stopped");
    }

    fn drain_batch(&self) -> Vec<ReplicationAction> {
        let mut queue = self.queue.lock().unwrap();
        let take = queue.len().min(self.batch_max);
        queue.drain(..take).map(|t| t.action).collect()
    }

    async fn deliver(
        &self,
        client: &PeerClient,
        store: &InstanceStore,
        node_name: &str,
        operations: Vec<ReplicationAction>,
    ) {
        let batch = ReplicationBatch {
            source_node: node_name.to_string(),
            operations,
        };
        let count = batch.operations.len();

        match client.send_batch(&self.url, &batch).await {
            Ok(response) => {
                debug!(peer = %self.url, op_count = count, "replication batch delivered");
                self.record_replay(count, "ok");
                self.heal_missed_renewals(store, &batch, &response);
            }
            Err(e) => {
                let lost = batch
                    .operations
                    .iter()
                    .filter(|op| !matches!(op, ReplicationAction::Heartbeat))
                    .count();
                warn!(
                    peer = %self.url,
                    error = %e,
                    dropped = lost,
                    "replication batch failed after retries, dropping operations"
                );
                self.dropped.fetch_add(lost as u64, Ordering::Relaxed);
                self.record_replay(count, &e.to_string());
            }
        }
    }

    /// A peer answering NotFound to a renew has lost the instance (restart,
    /// missed register). Queue a register carrying our current record so the
    /// peer converges without waiting for the client's next re-registration.
    fn heal_missed_renewals(
        &self,
        store: &InstanceStore,
        batch: &ReplicationBatch,
        response: &BatchResponse,
    ) {
        for (action, outcome) in batch.operations.iter().zip(response.results.iter()) {
            let (app_name, instance_id) = match (action, outcome) {
                (
                    ReplicationAction::Renew {
                        app_name,
                        instance_id,
                    },
                    OperationOutcome::NotFound,
                ) => (app_name, instance_id),
                _ => continue,
            };
            match store.get_record(app_name, instance_id) {
                Some(record) => {
                    info!(
                        peer = %self.url,
                        app = %app_name,
                        instance = %instance_id,
                        "peer missed renewal target, scheduling register"
                    );
                    self.enqueue(ReplicationTask {
                        action: ReplicationAction::Register { record },
                        queued_at_ms: current_time_ms(),
                    });
                }
                // Cancelled locally in the meantime; the peer is already right.
                None => {}
            }
        }
    }

    fn record_replay(&self, operation_count: usize, outcome: &str) {
        let mut replay = self.replay.lock().unwrap();
        replay.push_back(ReplayEntry {
            at_ms: current_time_ms(),
            operation_count,
            outcome: outcome.to_string(),
        });
        while replay.len() > self.replay_log_size {
            replay.pop_front();
        }
    }
}

/// Get current time in milliseconds since epoch.
fn current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

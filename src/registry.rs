//! Registry facade: the operation surface composing store, self-preservation,
//! response cache, and peer replication.
//!
//! Every mutation flows through here so the side effects stay in one place:
//! content changes advance the cache generation and land in the change log,
//! population changes retune the self-preservation threshold, and local
//! writes (never replicated ones) fan out to peers.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::cache::{ChangeKind, PayloadEncoding, PayloadFormat, ResponseCache};
use crate::error::{RegistryError, Result};
use crate::instance::{InstanceRecord, InstanceStatus};
use crate::preservation::SelfPreservationMonitor;
use crate::replication::{
    BatchResponse, OperationOutcome, ReplicationAction, ReplicationBatch, ReplicationDispatcher,
};
use crate::store::InstanceStore;

/// Where a write came from. Replicated writes are applied but never fanned
/// out again, which is what keeps the mesh loop-free.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Local,
    Replicated { node: String },
}

impl Origin {
    pub fn is_replicated(&self) -> bool {
        matches!(self, Origin::Replicated { .. })
    }
}

pub struct Registry {
    store: Arc<InstanceStore>,
    cache: ResponseCache,
    monitor: SelfPreservationMonitor,
    dispatcher: ReplicationDispatcher,
    default_lease_ms: u64,
}

impl Registry {
    pub fn new(
        store: Arc<InstanceStore>,
        cache: ResponseCache,
        monitor: SelfPreservationMonitor,
        dispatcher: ReplicationDispatcher,
        default_lease_ms: u64,
    ) -> Self {
        Self {
            store,
            cache,
            monitor,
            dispatcher,
            default_lease_ms,
        }
    }

    pub fn store(&self) -> &Arc<InstanceStore> {
        &self.store
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn monitor(&self) -> &SelfPreservationMonitor {
        &self.monitor
    }

    pub fn dispatcher(&self) -> &ReplicationDispatcher {
        &self.dispatcher
    }

    /// Register or replace an instance.
    #[tracing::instrument(
        name = "register",
        skip(self, record, origin),
        fields(app = %record.app_name, instance = %record.instance_id)
    )]
    pub fn register(&self, mut record: InstanceRecord, origin: Origin, now_ms: u64) -> Result<()> {
        record.normalize();
        record.validate()?;
        if record.last_dirty_timestamp_ms == 0 {
            record.last_dirty_timestamp_ms = now_ms;
        }

        let duration_ms = record
            .lease_duration_secs
            .map(|secs| secs.max(1) * 1000)
            .unwrap_or(self.default_lease_ms);

        let replicated = origin.is_replicated();
        match self
            .store
            .register(record.clone(), duration_ms, now_ms, replicated)
        {
            Ok(outcome) => {
                if outcome.new_registration {
                    self.monitor.update_expected_count(self.store.instance_count());
                }
            }
            Err(err @ RegistryError::InstanceIdConflict { .. }) if replicated => {
                warn!(error = %err, "replicated register conflicts with local ownership");
                return Err(err);
            }
            Err(err) => return Err(err),
        }

        self.cache
            .record_change(ChangeKind::Registered, record.clone(), now_ms);
        if !replicated {
            self.dispatcher
                .replicate(ReplicationAction::Register { record }, now_ms);
        }
        Ok(())
    }

    /// Refresh a lease. NotFound tells the caller (or a sending peer) that a
    /// register is needed.
    pub fn renew(&self, app_name: &str, instance_id: &str, origin: Origin, now_ms: u64) -> Result<()> {
        let app_name = app_name.to_uppercase();
        self.store.renew(&app_name, instance_id, now_ms)?;
        self.monitor.record_renewal();
        if !origin.is_replicated() {
            self.dispatcher.replicate(
                ReplicationAction::Renew {
                    app_name,
                    instance_id: instance_id.to_string(),
                },
                now_ms,
            );
        }
        Ok(())
    }

    /// Remove a lease deliberately (client shutdown or eviction).
    #[tracing::instrument(name = "cancel", skip(self, origin))]
    pub fn cancel(&self, app_name: &str, instance_id: &str, origin: Origin, now_ms: u64) -> Result<()> {
        let app_name = app_name.to_uppercase();
        let removed = self.store.cancel(&app_name, instance_id)?;
        self.monitor.update_expected_count(self.store.instance_count());
        self.cache
            .record_change(ChangeKind::Deleted, removed, now_ms);
        if !origin.is_replicated() {
            self.dispatcher.replicate(
                ReplicationAction::Cancel {
                    app_name,
                    instance_id: instance_id.to_string(),
                },
                now_ms,
            );
        }
        Ok(())
    }

    /// Overwrite an instance's status out of band.
    #[tracing::instrument(name = "status_update", skip(self, origin, dirty_ms))]
    pub fn status_update(
        &self,
        app_name: &str,
        instance_id: &str,
        status: InstanceStatus,
        dirty_ms: u64,
        origin: Origin,
        now_ms: u64,
    ) -> Result<()> {
        let app_name = app_name.to_uppercase();
        let replicated = origin.is_replicated();
        let next = self.store.status_update(
            &app_name,
            instance_id,
            status,
            dirty_ms,
            now_ms,
            replicated,
        )?;
        let dirty_timestamp_ms = next.last_dirty_timestamp_ms;
        self.cache
            .record_change(ChangeKind::StatusUpdated, next, now_ms);
        if !replicated {
            self.dispatcher.replicate(
                ReplicationAction::StatusUpdate {
                    app_name,
                    instance_id: instance_id.to_string(),
                    status,
                    dirty_timestamp_ms,
                },
                now_ms,
            );
        }
        Ok(())
    }

    /// All-applications payload, cached.
    pub fn applications(
        &self,
        format: PayloadFormat,
        encoding: PayloadEncoding,
        now_ms: u64,
    ) -> Result<Bytes> {
        self.cache
            .applications(&self.store, format, encoding, self.expired_cutoff(now_ms))
    }

    /// Single-application payload, cached. Unknown names render empty.
    pub fn application(
        &self,
        app_name: &str,
        format: PayloadFormat,
        encoding: PayloadEncoding,
        now_ms: u64,
    ) -> Result<Bytes> {
        let app_name = app_name.to_uppercase();
        self.cache.application(
            &self.store,
            &app_name,
            format,
            encoding,
            self.expired_cutoff(now_ms),
        )
    }

    /// Changes after a client's marker, or FullSnapshotRequired.
    pub fn delta(&self, since: u64, encoding: PayloadEncoding) -> Result<Bytes> {
        self.cache.delta(since, encoding)
    }

    /// Apply a peer's batch, producing index-aligned per-operation outcomes.
    #[tracing::instrument(
        name = "apply_batch",
        skip(self, batch),
        fields(source = %batch.source_node, op_count = batch.operations.len())
    )]
    pub fn apply_batch(&self, batch: ReplicationBatch, now_ms: u64) -> BatchResponse {
        let node = batch.source_node;
        let results = batch
            .operations
            .into_iter()
            .map(|action| self.apply_replicated(action, &node, now_ms))
            .collect();
        BatchResponse { results }
    }

    /// Refresh cached payloads and prune delta history. Called by the
    /// rebuild timer.
    pub fn rebuild_cache(&self, now_ms: u64) -> Result<()> {
        self.cache
            .rebuild(&self.store, self.expired_cutoff(now_ms), now_ms)
    }

    fn apply_replicated(&self, action: ReplicationAction, node: &str, now_ms: u64) -> OperationOutcome {
        let origin = Origin::Replicated {
            node: node.to_string(),
        };
        let result = match action {
            ReplicationAction::Register { record } => self.register(record, origin, now_ms),
            ReplicationAction::Renew {
                app_name,
                instance_id,
            } => self.renew(&app_name, &instance_id, origin, now_ms),
            ReplicationAction::Cancel {
                app_name,
                instance_id,
            } => self.cancel(&app_name, &instance_id, origin, now_ms),
            ReplicationAction::StatusUpdate {
                app_name,
                instance_id,
                status,
                dirty_timestamp_ms,
            } => self.status_update(
                &app_name,
                &instance_id,
                status,
                dirty_timestamp_ms,
                origin,
                now_ms,
            ),
            ReplicationAction::Heartbeat => {
                debug!(node = %node, "peer heartbeat");
                Ok(())
            }
        };

        match result {
            Ok(()) => OperationOutcome::Applied,
            Err(RegistryError::NotFound { .. }) => OperationOutcome::NotFound,
            Err(RegistryError::StaleReplica { .. }) => OperationOutcome::Stale,
            Err(RegistryError::InstanceIdConflict { .. }) => OperationOutcome::Conflict,
            Err(err) => {
                warn!(node = %node, error = %err, "replicated operation rejected");
                OperationOutcome::Invalid
            }
        }
    }

    /// During self-preservation the view keeps expired leases: stale but
    /// present beats absent while the renewal signal is suspect.
    fn expired_cutoff(&self, now_ms: u64) -> Option<u64> {
        if self.monitor.is_active() {
            None
        } else {
            Some(now_ms)
        }
    }
}

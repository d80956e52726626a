//! Concurrent two-level instance store: application name -> instance id -> Lease.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::{RegistryError, Result};
use crate::instance::{InstanceRecord, InstanceStatus};
use crate::lease::Lease;

/// Leases for one application, guarded by the outer map's shard lock.
#[derive(Debug, Default)]
struct Application {
    instances: HashMap<String, Lease>,
}

/// Point-in-time copy of one lease, safe to hand to serializers.
#[derive(Debug, Clone)]
pub struct LeaseSnapshot {
    pub record: InstanceRecord,
    pub registered_at_ms: u64,
    pub lease_duration_ms: u64,
    pub service_up_since_ms: Option<u64>,
}

/// Point-in-time copy of one application's live instances.
#[derive(Debug, Clone)]
pub struct AppSnapshot {
    pub name: String,
    pub instances: Vec<LeaseSnapshot>,
}

/// Outcome of a register call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterOutcome {
    /// True when the instance id was not present before this call.
    pub new_registration: bool,
}

/// In-memory registry state.
///
/// The outer [`DashMap`] gives per-shard locking, so operations on different
/// applications do not serialize against each other. Renewals go through the
/// lease's atomic timestamp and take only a shard read guard. The overall
/// instance count is maintained incrementally for O(1) self-preservation
/// threshold math — never recomputed by a full scan.
#[derive(Debug, Default)]
pub struct InstanceStore {
    apps: DashMap<String, Application>,
    /// instance id -> owning application. An id may appear under at most one
    /// application at a time; this index is the guard for that invariant.
    owner: DashMap<String, String>,
    count: AtomicUsize,
}

impl InstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of registered instances across all applications.
    pub fn instance_count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn app_count(&self) -> usize {
        self.apps.len()
    }

    /// Insert or replace the lease for `(record.app_name, record.instance_id)`.
    ///
    /// Local writes overwrite unconditionally. Replicated writes apply
    /// last-writer-wins on the record's dirty timestamp: an incoming record
    /// older than the stored one is rejected as [`RegistryError::StaleReplica`]
    /// (replays and reordered deliveries are safe to drop).
    pub fn register(
        &self,
        record: InstanceRecord,
        duration_ms: u64,
        now_ms: u64,
        replicated: bool,
    ) -> Result<RegisterOutcome> {
        let app_name = record.app_name.clone();
        let instance_id = record.instance_id.clone();

        if let Some(owner) = self.owner.get(&instance_id).map(|o| o.clone()) {
            if owner != app_name {
                warn!(
                    instance_id = %instance_id,
                    owner = %owner,
                    requested = %app_name,
                    "register rejected: instance id owned by another application"
                );
                return Err(RegistryError::InstanceIdConflict { instance_id, owner });
            }
        }

        let mut app = self.apps.entry(app_name.clone()).or_default();
        if let Some(existing) = app.instances.get(&instance_id) {
            if replicated
                && record.last_dirty_timestamp_ms < existing.record().last_dirty_timestamp_ms
            {
                return Err(RegistryError::StaleReplica {
                    app_name,
                    instance_id,
                });
            }
        }

        let replaced = app
            .instances
            .insert(instance_id.clone(), Lease::new(record, duration_ms, now_ms))
            .is_some();
        drop(app);

        if !replaced {
            self.owner.insert(instance_id.clone(), app_name.clone());
            self.count.fetch_add(1, Ordering::Relaxed);
        }
        debug!(app = %app_name, instance = %instance_id, replaced, replicated, "lease registered");
        Ok(RegisterOutcome {
            new_registration: !replaced,
        })
    }

    /// Refresh the renewal timestamp for a lease. Takes only a read guard on
    /// the application's shard.
    pub fn renew(&self, app_name: &str, instance_id: &str, now_ms: u64) -> Result<()> {
        let app = self
            .apps
            .get(app_name)
            .ok_or_else(|| RegistryError::not_found(app_name, instance_id))?;
        let lease = app
            .instances
            .get(instance_id)
            .ok_or_else(|| RegistryError::not_found(app_name, instance_id))?;
        lease.renew(now_ms);
        Ok(())
    }

    /// Remove the lease. Returns the removed record so callers can log it to
    /// the change stream. Cancelling an absent instance reports NotFound; the
    /// caller treats that as idempotent success where appropriate.
    pub fn cancel(&self, app_name: &str, instance_id: &str) -> Result<InstanceRecord> {
        let removed = {
            let mut app = self
                .apps
                .get_mut(app_name)
                .ok_or_else(|| RegistryError::not_found(app_name, instance_id))?;
            app.instances
                .remove(instance_id)
                .ok_or_else(|| RegistryError::not_found(app_name, instance_id))?
        };

        self.owner
            .remove_if(instance_id, |_, owner| owner == app_name);
        self.count.fetch_sub(1, Ordering::Relaxed);
        self.apps
            .remove_if(app_name, |_, app| app.instances.is_empty());
        debug!(app = %app_name, instance = %instance_id, "lease cancelled");
        Ok(removed.record().clone())
    }

    /// Replace the record's status in place, producing a fresh record value.
    /// Replicated updates apply last-writer-wins on the carried dirty
    /// timestamp; local updates bump the timestamp monotonically.
    pub fn status_update(
        &self,
        app_name: &str,
        instance_id: &str,
        status: InstanceStatus,
        dirty_ms: u64,
        now_ms: u64,
        replicated: bool,
    ) -> Result<InstanceRecord> {
        let mut app = self
            .apps
            .get_mut(app_name)
            .ok_or_else(|| RegistryError::not_found(app_name, instance_id))?;
        let lease = app
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| RegistryError::not_found(app_name, instance_id))?;

        let stored_dirty = lease.record().last_dirty_timestamp_ms;
        let effective_dirty = if replicated {
            if dirty_ms < stored_dirty {
                return Err(RegistryError::StaleReplica {
                    app_name: app_name.to_string(),
                    instance_id: instance_id.to_string(),
                });
            }
            dirty_ms
        } else {
            dirty_ms.max(stored_dirty + 1)
        };

        let next = lease.record().with_status(status, effective_dirty);
        lease.replace_record(next.clone(), now_ms);
        debug!(app = %app_name, instance = %instance_id, status = status.as_str(), "status updated");
        Ok(next)
    }

    /// Current record for an instance, if registered.
    pub fn get_record(&self, app_name: &str, instance_id: &str) -> Option<InstanceRecord> {
        let app = self.apps.get(app_name)?;
        app.instances.get(instance_id).map(|l| l.record().clone())
    }

    /// Immutable view of live leases, ordered by application name then
    /// instance id. `expired_cutoff` filters leases already past their TTL;
    /// pass `None` to keep them (self-preservation prefers stale-but-present
    /// data over holes in the view).
    pub fn snapshot(&self, scope: Option<&str>, expired_cutoff: Option<u64>) -> Vec<AppSnapshot> {
        let mut out: Vec<AppSnapshot> = Vec::new();
        let collect = |name: &str, app: &Application, out: &mut Vec<AppSnapshot>| {
            let mut instances: Vec<LeaseSnapshot> = app
                .instances
                .values()
                .filter(|lease| match expired_cutoff {
                    Some(now_ms) => !lease.is_expired(now_ms),
                    None => true,
                })
                .map(|lease| LeaseSnapshot {
                    record: lease.record().clone(),
                    registered_at_ms: lease.registration_ms(),
                    lease_duration_ms: lease.duration_ms(),
                    service_up_since_ms: lease.service_up_since_ms(),
                })
                .collect();
            instances.sort_by(|a, b| a.record.instance_id.cmp(&b.record.instance_id));
            out.push(AppSnapshot {
                name: name.to_string(),
                instances,
            });
        };

        match scope {
            Some(app_name) => {
                if let Some(app) = self.apps.get(app_name) {
                    collect(app_name, &app, &mut out);
                }
            }
            None => {
                for entry in self.apps.iter() {
                    collect(entry.key(), entry.value(), &mut out);
                }
                out.sort_by(|a, b| a.name.cmp(&b.name));
            }
        }
        out
    }

    /// `(app_name, instance_id)` pairs whose lease has gone unrenewed past
    /// its duration — the eviction sweep's candidate set.
    pub fn expired(&self, now_ms: u64) -> Vec<(String, String)> {
        let mut candidates = Vec::new();
        for entry in self.apps.iter() {
            for (id, lease) in entry.value().instances.iter() {
                if lease.is_expired(now_ms) {
                    candidates.push((entry.key().clone(), id.clone()));
                }
            }
        }
        candidates
    }
}

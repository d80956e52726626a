//! Time-bounded claim that a registered instance is alive.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::instance::{InstanceRecord, InstanceStatus};

/// Wraps exactly one [`InstanceRecord`] with its renewal state.
///
/// Renewal touches only `last_renewal_ms`, an atomic field, so heartbeats
/// never contend with store mutations for a map lock. A lease is created on
/// first registration and removed on cancel or eviction; it is never
/// resurrected — a later register creates a fresh lease.
#[derive(Debug)]
pub struct Lease {
    record: InstanceRecord,
    registration_ms: u64,
    duration_ms: u64,
    last_renewal_ms: AtomicU64,
    /// Wall clock of the first transition to UP; 0 until that happens.
    service_up_since_ms: AtomicU64,
}

impl Lease {
    pub fn new(record: InstanceRecord, duration_ms: u64, now_ms: u64) -> Self {
        let up_since = if record.status == InstanceStatus::Up {
            now_ms
        } else {
            0
        };
        Self {
            record,
            registration_ms: now_ms,
            duration_ms,
            last_renewal_ms: AtomicU64::new(now_ms),
            service_up_since_ms: AtomicU64::new(up_since),
        }
    }

    pub fn record(&self) -> &InstanceRecord {
        &self.record
    }

    pub fn registration_ms(&self) -> u64 {
        self.registration_ms
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn last_renewal_ms(&self) -> u64 {
        self.last_renewal_ms.load(Ordering::Relaxed)
    }

    pub fn service_up_since_ms(&self) -> Option<u64> {
        match self.service_up_since_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }

    /// Refresh the renewal timestamp. Requires only a shared reference.
    pub fn renew(&self, now_ms: u64) {
        self.last_renewal_ms.store(now_ms, Ordering::Relaxed);
    }

    /// A lease is expired once it has gone longer than its duration without
    /// a renewal. The boundary itself still counts as alive.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_renewal_ms()) > self.duration_ms
    }

    /// Swap in an updated record, tracking the first UP transition.
    pub(crate) fn replace_record(&mut self, record: InstanceRecord, now_ms: u64) {
        if record.status == InstanceStatus::Up
            && self.service_up_since_ms.load(Ordering::Relaxed) == 0
        {
            self.service_up_since_ms.store(now_ms, Ordering::Relaxed);
        }
        self.record = record;
    }
}

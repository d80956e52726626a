//! Bounded log of registry mutations backing delta queries.
//!
//! Every recorded change gets the next sequence number; the latest sequence
//! doubles as the registry's generation. Sequences are dense, so a delta
//! reader can detect pruned history by looking at the oldest retained entry.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::instance::InstanceRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Registered,
    StatusUpdated,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub sequence: u64,
    pub kind: ChangeKind,
    pub record: InstanceRecord,
    pub at_ms: u64,
}

#[derive(Debug)]
pub struct ChangeLog {
    entries: Mutex<VecDeque<ChangeEntry>>,
    latest: AtomicU64,
    capacity: usize,
    retention_ms: u64,
}

impl ChangeLog {
    pub fn new(capacity: usize, retention_ms: u64) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            latest: AtomicU64::new(0),
            capacity: capacity.max(1),
            retention_ms,
        }
    }

    /// Sequence of the most recent change; 0 before any change.
    pub fn latest_sequence(&self) -> u64 {
        self.latest.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a change and return its sequence. The sequence counter is
    /// advanced under the queue lock so entries land in sequence order.
    pub fn record(&self, kind: ChangeKind, record: InstanceRecord, now_ms: u64) -> u64 {
        let mut entries = self.entries.lock().unwrap();
        let sequence = self.latest.fetch_add(1, Ordering::AcqRel) + 1;
        entries.push_back(ChangeEntry {
            sequence,
            kind,
            record,
            at_ms: now_ms,
        });
        Self::prune_locked(&mut entries, self.capacity, self.retention_ms, now_ms);
        sequence
    }

    /// All changes after `since`, oldest first.
    ///
    /// Returns `None` when the log can no longer prove completeness: the
    /// marker is ahead of anything we issued (a different node's history) or
    /// behind the oldest retained entry (pruned history). Either way the
    /// caller needs a full snapshot.
    pub fn collect_since(&self, since: u64) -> Option<Vec<ChangeEntry>> {
        let latest = self.latest_sequence();
        if since > latest {
            return None;
        }
        if since == latest {
            return Some(Vec::new());
        }
        let entries = self.entries.lock().unwrap();
        match entries.front() {
            None => None,
            Some(front) if front.sequence > since + 1 => None,
            Some(_) => Some(
                entries
                    .iter()
                    .filter(|e| e.sequence > since)
                    .cloned()
                    .collect(),
            ),
        }
    }

    /// Drop entries past the retention window. Capacity is enforced on every
    /// append; this handles quiet periods where nothing gets appended.
    pub fn prune(&self, now_ms: u64) {
        let mut entries = self.entries.lock().unwrap();
        Self::prune_locked(&mut entries, self.capacity, self.retention_ms, now_ms);
    }

    pub fn oldest_sequence(&self) -> Option<u64> {
        self.entries.lock().unwrap().front().map(|e| e.sequence)
    }

    fn prune_locked(
        entries: &mut VecDeque<ChangeEntry>,
        capacity: usize,
        retention_ms: u64,
        now_ms: u64,
    ) {
        while entries.len() > capacity {
            entries.pop_front();
        }
        while let Some(front) = entries.front() {
            if now_ms.saturating_sub(front.at_ms) > retention_ms {
                entries.pop_front();
            } else {
                break;
            }
        }
    }
}

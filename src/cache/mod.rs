//! Generation-stamped cache for serialized registry views.
//!
//! Every mutation recorded through [`ResponseCache::record_change`] advances
//! a global generation (the change sequence) and lands in the bounded change
//! log. Cached payloads are stamped with the generation they were rendered
//! at; a read whose stamp matches the current generation is served as-is,
//! anything else is re-rendered lazily. Nothing is ever cleared eagerly on
//! write, so the write path stays cheap.

pub mod changelog;
pub mod key;
pub mod payload;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::error::{RegistryError, Result};
use crate::instance::InstanceRecord;
use crate::store::InstanceStore;

pub use changelog::{ChangeEntry, ChangeKind, ChangeLog};
pub use key::{CacheKey, PayloadEncoding, PayloadFormat, ViewScope};

#[derive(Debug, Clone)]
struct CachedPayload {
    generation: u64,
    body: Bytes,
}

#[derive(Debug)]
pub struct ResponseCache {
    entries: DashMap<CacheKey, CachedPayload>,
    changelog: ChangeLog,
    recomputes: AtomicU64,
    delta_entries: AtomicUsize,
    delta_entry_cap: usize,
}

impl ResponseCache {
    pub fn new(changelog_capacity: usize, delta_retention_ms: u64, delta_entry_cap: usize) -> Self {
        Self {
            entries: DashMap::new(),
            changelog: ChangeLog::new(changelog_capacity, delta_retention_ms),
            recomputes: AtomicU64::new(0),
            delta_entries: AtomicUsize::new(0),
            delta_entry_cap,
        }
    }

    /// Current view generation. Equals the sequence of the latest recorded
    /// change; renewals do not advance it.
    pub fn generation(&self) -> u64 {
        self.changelog.latest_sequence()
    }

    /// How many payload renders have happened. Flat across cache hits.
    pub fn recompute_count(&self) -> u64 {
        self.recomputes.load(Ordering::Relaxed)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn changelog_len(&self) -> usize {
        self.changelog.len()
    }

    /// Record a content-changing mutation: advances the generation and logs
    /// the change for delta readers. Returns the change sequence.
    pub fn record_change(&self, kind: ChangeKind, record: InstanceRecord, now_ms: u64) -> u64 {
        self.changelog.record(kind, record, now_ms)
    }

    /// All-applications payload for the given shape and encoding.
    pub fn applications(
        &self,
        store: &InstanceStore,
        format: PayloadFormat,
        encoding: PayloadEncoding,
        expired_cutoff: Option<u64>,
    ) -> Result<Bytes> {
        self.lookup_or_render(CacheKey::all(format, encoding), |generation| {
            let snapshot = store.snapshot(None, expired_cutoff);
            payload::render_applications(&snapshot, generation, format)
        })
    }

    /// Single-application payload. Unknown applications render empty.
    pub fn application(
        &self,
        store: &InstanceStore,
        app_name: &str,
        format: PayloadFormat,
        encoding: PayloadEncoding,
        expired_cutoff: Option<u64>,
    ) -> Result<Bytes> {
        let key = CacheKey::application(app_name, format, encoding);
        self.lookup_or_render(key, |generation| {
            let snapshot = store.snapshot(Some(app_name), expired_cutoff);
            payload::render_application(app_name, snapshot.first(), generation, format)
        })
    }

    /// Changes after `since`, or [`RegistryError::FullSnapshotRequired`] when
    /// the marker fell out of retained history.
    pub fn delta(&self, since: u64, encoding: PayloadEncoding) -> Result<Bytes> {
        self.lookup_or_render(CacheKey::delta(since, encoding), |_| {
            let entries = self
                .changelog
                .collect_since(since)
                .ok_or(RegistryError::FullSnapshotRequired { since })?;
            let latest_marker = entries.last().map(|e| e.sequence).unwrap_or(since);
            payload::render_delta(&entries, latest_marker)
        })
    }

    /// Periodic refresh: re-render the canonical all-applications payloads
    /// (the view can drift without a generation bump as leases expire), prune
    /// the change log, and drop cache entries stamped with old generations.
    pub fn rebuild(
        &self,
        store: &InstanceStore,
        expired_cutoff: Option<u64>,
        now_ms: u64,
    ) -> Result<()> {
        self.changelog.prune(now_ms);
        let generation = self.generation();
        let snapshot = store.snapshot(None, expired_cutoff);

        for format in [PayloadFormat::Full, PayloadFormat::Compact] {
            let identity = payload::render_applications(&snapshot, generation, format)?;
            for encoding in [PayloadEncoding::Identity, PayloadEncoding::Gzip] {
                let body = payload::encode(identity.clone(), encoding)?;
                self.recomputes.fetch_add(1, Ordering::Relaxed);
                self.entries
                    .insert(CacheKey::all(format, encoding), CachedPayload { generation, body });
            }
        }

        self.entries.retain(|_, entry| entry.generation == generation);
        let live_deltas = self
            .entries
            .iter()
            .filter(|entry| entry.key().is_delta())
            .count();
        self.delta_entries.store(live_deltas, Ordering::Relaxed);
        debug!(
            generation,
            entries = self.entries.len(),
            changelog = self.changelog.len(),
            "cache rebuilt"
        );
        Ok(())
    }

    fn lookup_or_render<F>(&self, key: CacheKey, render: F) -> Result<Bytes>
    where
        F: FnOnce(u64) -> Result<Vec<u8>>,
    {
        let generation = self.generation();
        if let Some(entry) = self.entries.get(&key) {
            if entry.generation == generation {
                return Ok(entry.body.clone());
            }
        }

        // Exclusive entry guard: a concurrent miss for the same key waits
        // here and then sees the freshly stamped payload instead of
        // rendering again.
        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().generation == generation {
                    return Ok(occupied.get().body.clone());
                }
                let body = self.render_entry(&key, generation, render)?;
                occupied.insert(CachedPayload {
                    generation,
                    body: body.clone(),
                });
                Ok(body)
            }
            Entry::Vacant(vacant) => {
                let body = self.render_entry(&key, generation, render)?;
                if key.is_delta()
                    && self.delta_entries.load(Ordering::Relaxed) >= self.delta_entry_cap
                {
                    // Cap reached: serve without caching. The rebuild pass
                    // reclaims slots as old generations are dropped.
                    debug!(cache_key = %key, "delta cache at capacity, serving uncached");
                    return Ok(body);
                }
                if key.is_delta() {
                    self.delta_entries.fetch_add(1, Ordering::Relaxed);
                }
                vacant.insert(CachedPayload {
                    generation,
                    body: body.clone(),
                });
                Ok(body)
            }
        }
    }

    fn render_entry<F>(&self, key: &CacheKey, generation: u64, render: F) -> Result<Bytes>
    where
        F: FnOnce(u64) -> Result<Vec<u8>>,
    {
        let identity = render(generation)?;
        let body = payload::encode(identity, key.encoding)?;
        self.recomputes.fetch_add(1, Ordering::Relaxed);
        debug!(cache_key = %key, generation, bytes = body.len(), "payload rendered");
        Ok(body)
    }
}

//! Self-preservation: gate eviction on the observed renewal rate.
//!
//! When renewals drop well below what the registered population should be
//! sending, the likelier explanation is a network partition between clients
//! and this node than a mass crash. In that state the registry stops evicting
//! and keeps serving the last known instances.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tracing::{info, warn};

#[derive(Debug)]
pub struct SelfPreservationMonitor {
    enabled: bool,
    renewal_interval_secs: u64,
    renewal_percent_threshold: f64,
    expected_count: AtomicUsize,
    current_minute: AtomicU64,
    last_minute: AtomicU64,
}

impl SelfPreservationMonitor {
    pub fn new(enabled: bool, renewal_interval_secs: u64, renewal_percent_threshold: f64) -> Self {
        Self {
            enabled,
            renewal_interval_secs: renewal_interval_secs.max(1),
            renewal_percent_threshold,
            expected_count: AtomicUsize::new(0),
            current_minute: AtomicU64::new(0),
            last_minute: AtomicU64::new(0),
        }
    }

    /// Called on every successful renewal, local or replicated.
    pub fn record_renewal(&self) {
        self.current_minute.fetch_add(1, Ordering::Relaxed);
    }

    /// Re-derive the expected renewal rate from the registered population.
    /// Called whenever an instance is added or removed.
    pub fn update_expected_count(&self, instance_count: usize) {
        self.expected_count.store(instance_count, Ordering::Relaxed);
    }

    /// Roll the per-minute renewal bucket. Driven by a timer in production;
    /// tests call it directly.
    pub fn tick_minute(&self) {
        let rolled = self.current_minute.swap(0, Ordering::Relaxed);
        self.last_minute.store(rolled, Ordering::Relaxed);
    }

    pub fn renewals_last_minute(&self) -> u64 {
        self.last_minute.load(Ordering::Relaxed)
    }

    /// Renewals per minute the current population should produce if every
    /// instance heartbeats on schedule.
    pub fn expected_renewals_per_minute(&self) -> f64 {
        let count = self.expected_count.load(Ordering::Relaxed) as f64;
        count * (60.0 / self.renewal_interval_secs as f64)
    }

    /// Minimum renewals in the last minute for eviction to stay enabled.
    pub fn renewal_threshold(&self) -> f64 {
        self.expected_renewals_per_minute() * self.renewal_percent_threshold
    }

    /// Whether the eviction sweep may remove expired leases right now.
    ///
    /// Always true when the feature is disabled or the registry is empty.
    /// Otherwise the last full minute's renewal count must meet the
    /// threshold fraction of the expected rate.
    pub fn is_eviction_allowed(&self) -> bool {
        if !self.enabled {
            return true;
        }
        if self.expected_count.load(Ordering::Relaxed) == 0 {
            return true;
        }
        let seen = self.last_minute.load(Ordering::Relaxed) as f64;
        let threshold = self.renewal_threshold();
        if seen >= threshold {
            true
        } else {
            warn!(
                renewals_last_minute = seen,
                threshold,
                "self-preservation active: renewal rate below threshold, eviction suspended"
            );
            false
        }
    }

    /// True when self-preservation is currently suppressing eviction.
    pub fn is_active(&self) -> bool {
        if !self.enabled || self.expected_count.load(Ordering::Relaxed) == 0 {
            return false;
        }
        (self.last_minute.load(Ordering::Relaxed) as f64) < self.renewal_threshold()
    }

    pub fn log_state(&self) {
        info!(
            expected_per_minute = self.expected_renewals_per_minute(),
            threshold = self.renewal_threshold(),
            renewals_last_minute = self.renewals_last_minute(),
            active = self.is_active(),
            "self-preservation state"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> SelfPreservationMonitor {
        SelfPreservationMonitor::new(true, 30, 0.85)
    }

    #[test]
    fn threshold_follows_population() {
        let m = monitor();
        m.update_expected_count(10);
        assert_eq!(m.expected_renewals_per_minute(), 20.0);
        assert_eq!(m.renewal_threshold(), 17.0);
    }

    #[test]
    fn empty_registry_always_allows_eviction() {
        let m = monitor();
        assert!(m.is_eviction_allowed());
        assert!(!m.is_active());
    }

    #[test]
    fn disabled_monitor_always_allows_eviction() {
        let m = SelfPreservationMonitor::new(false, 30, 0.85);
        m.update_expected_count(100);
        m.tick_minute();
        assert!(m.is_eviction_allowed());
        assert!(!m.is_active());
    }

    #[test]
    fn renewal_shortfall_suspends_eviction() {
        let m = monitor();
        m.update_expected_count(10);
        for _ in 0..16 {
            m.record_renewal();
        }
        m.tick_minute();
        // 16 < 17 threshold
        assert!(!m.is_eviction_allowed());
        assert!(m.is_active());
    }

    #[test]
    fn healthy_renewal_rate_allows_eviction() {
        let m = monitor();
        m.update_expected_count(10);
        for _ in 0..17 {
            m.record_renewal();
        }
        m.tick_minute();
        assert!(m.is_eviction_allowed());
        assert!(!m.is_active());
    }

    #[test]
    fn tick_rolls_current_bucket_into_last() {
        let m = monitor();
        m.record_renewal();
        m.record_renewal();
        assert_eq!(m.renewals_last_minute(), 0);
        m.tick_minute();
        assert_eq!(m.renewals_last_minute(), 2);
        m.tick_minute();
        assert_eq!(m.renewals_last_minute(), 0);
    }
}

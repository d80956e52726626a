//! Expired-lease eviction: a periodic sweep that cancels leases past their
//! duration, gated by the self-preservation monitor.
//!
//! Evictions go one at a time with a jittered pause so a large die-off does
//! not land on peers as a burst, and the order is shuffled so no application
//! is systematically drained first.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::RegistryError;
use crate::registry::{Origin, Registry};

pub struct EvictionController {
    registry: Arc<Registry>,
    interval: Duration,
    jitter_ms: u64,
}

impl EvictionController {
    pub fn new(registry: Arc<Registry>, interval: Duration, jitter_ms: u64) -> Self {
        Self {
            registry,
            interval,
            jitter_ms,
        }
    }

    /// One sweep over the expired leases. Returns how many were evicted.
    pub async fn sweep(&self, now_ms: u64) -> usize {
        let mut candidates = self.registry.store().expired(now_ms);
        if candidates.is_empty() {
            debug!("no expired leases");
            return 0;
        }
        candidates.shuffle(&mut rand::thread_rng());

        let monitor = self.registry.monitor();
        if !monitor.is_eviction_allowed() {
            monitor.log_state();
            info!(
                expired = candidates.len(),
                "eviction suppressed by self-preservation"
            );
            return 0;
        }

        let expired = candidates.len();
        let mut evicted = 0;
        for (app_name, instance_id) in candidates {
            // The registry shrinks while the sweep runs; the gate is
            // consulted again before each individual eviction.
            if !monitor.is_eviction_allowed() {
                info!(evicted, "self-preservation tripped mid-sweep");
                break;
            }
            match self
                .registry
                .cancel(&app_name, &instance_id, Origin::Local, now_ms)
            {
                Ok(()) => {
                    info!(app = %app_name, instance = %instance_id, "evicted expired lease");
                    evicted += 1;
                }
                Err(RegistryError::NotFound { .. }) => {
                    debug!(app = %app_name, instance = %instance_id, "lease already gone");
                }
                Err(err) => {
                    warn!(app = %app_name, instance = %instance_id, error = %err, "eviction failed");
                }
            }
            if self.jitter_ms > 0 {
                let pause = rand::thread_rng().gen_range(0..=self.jitter_ms);
                sleep(Duration::from_millis(pause)).await;
            }
        }
        info!(expired, evicted, "eviction sweep finished");
        evicted
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!(interval_secs = self.interval.as_secs(), "eviction loop started");
        loop {
            tokio::select! {
                _ = sleep(self.interval) => {
                    self.sweep(current_time_ms()).await;
                }
                _ = shutdown.changed() => {
                    debug!("eviction loop stopping");
                    break;
                }
            }
        }
    }
}

fn current_time_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

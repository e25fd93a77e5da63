//! Eviction sweeper
//!
//! Periodically removes entries whose `accessed_at` is older than the
//! retention window, deleting the asset first and then the metadata row.
//! Each entry is re-read under its key lock right before deletion, so an
//! entry refreshed by a hit after the scan started is never evicted.
//! The same pass also reclaims asset files that have no metadata row.

use crate::asset::AssetStore;
use crate::key::CacheKey;
use crate::locks::KeyLocks;
use crate::metadata::MetadataStore;
use crate::types::CacheEntry;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepState {
    Idle,
    Scanning,
    Deleting,
}

/// Outcome of one sweep
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub evicted: usize,
    /// Entries that were hit after the scan and kept
    pub skipped_refreshed: usize,
    pub orphans_removed: usize,
    pub errors: Vec<String>,
}

/// `now - retention`, saturating at the earliest representable time
pub fn retention_cutoff(now: DateTime<Utc>, retention: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(retention)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

enum Eviction {
    Evicted,
    Refreshed,
    Gone,
}

pub struct EvictionSweeper {
    metadata: Arc<dyn MetadataStore>,
    assets: Arc<dyn AssetStore>,
    locks: KeyLocks,
    retention: Duration,
    interval: Duration,
    state: Mutex<SweepState>,
    completed: AtomicU64,
}

impl EvictionSweeper {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        assets: Arc<dyn AssetStore>,
        locks: KeyLocks,
        retention: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            metadata,
            assets,
            locks,
            retention,
            interval,
            state: Mutex::new(SweepState::Idle),
            completed: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SweepState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of sweeps finished since creation
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: SweepState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Run the sweep loop every `interval`, starting one interval from now
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = self.interval.as_secs(), "Eviction sweeper started");
            loop {
                ticker.tick().await;
                self.sweep_once().await;
            }
        })
    }

    /// Perform one full sweep. Per-entry failures are collected, never fatal.
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let cutoff = retention_cutoff(Utc::now(), self.retention);

        self.set_state(SweepState::Scanning);
        let expired = match self.metadata.list_expired(cutoff).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Failed to list expired cache entries");
                report.errors.push(format!("list expired: {}", e));
                Vec::new()
            }
        };
        report.scanned = expired.len();

        self.set_state(SweepState::Deleting);
        for entry in expired {
            match self.evict(&entry, cutoff, &mut report).await {
                Eviction::Evicted => report.evicted += 1,
                Eviction::Refreshed => report.skipped_refreshed += 1,
                Eviction::Gone => {}
            }
        }

        self.remove_orphans(&mut report).await;

        self.set_state(SweepState::Idle);
        self.completed.fetch_add(1, Ordering::Relaxed);
        info!(
            scanned = report.scanned,
            evicted = report.evicted,
            skipped_refreshed = report.skipped_refreshed,
            orphans_removed = report.orphans_removed,
            errors = report.errors.len(),
            "Cache sweep finished"
        );
        report
    }

    async fn evict(
        &self,
        entry: &CacheEntry,
        cutoff: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Eviction {
        let key = CacheKey::derive(&entry.source_url, &entry.options());
        let _guard = self.locks.lock(&key).await;

        let current = match self.metadata.get(entry.id).await {
            Ok(Some(current)) => current,
            Ok(None) => return Eviction::Gone,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to re-read cache entry");
                report.errors.push(format!("{}: re-read: {}", key, e));
                return Eviction::Gone;
            }
        };
        if current.accessed_at >= cutoff {
            debug!(key = %key, "Entry refreshed since scan, keeping");
            return Eviction::Refreshed;
        }

        match self.assets.delete(&current.storage_path).await {
            Ok(true) => {}
            Ok(false) => debug!(key = %key, "Asset already absent"),
            Err(e) => {
                warn!(key = %key, path = %current.storage_path, error = %e, "Failed to delete cached asset");
                report
                    .errors
                    .push(format!("{}: delete asset: {}", key, e));
            }
        }

        match self.metadata.delete(current.id).await {
            Ok(_) => {
                debug!(key = %key, "Evicted cache entry");
                Eviction::Evicted
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to delete cache entry");
                report.errors.push(format!("{}: delete row: {}", key, e));
                Eviction::Gone
            }
        }
    }

    async fn remove_orphans(&self, report: &mut SweepReport) {
        let paths = match self.assets.list().await {
            Ok(paths) => paths,
            Err(e) => {
                warn!(error = %e, "Failed to list cached assets");
                report.errors.push(format!("list assets: {}", e));
                return;
            }
        };

        for path in paths {
            // Only files named after a derived key belong to the cache
            let Some(key) = path
                .split_once('.')
                .and_then(|(stem, _)| CacheKey::from_stem(stem))
            else {
                continue;
            };

            let _guard = self.locks.lock(&key).await;
            match self.metadata.find_by_key(&key).await {
                Ok(Some(_)) => {}
                Ok(None) => match self.assets.delete(&path).await {
                    Ok(_) => {
                        debug!(path = %path, "Removed orphaned asset");
                        report.orphans_removed += 1;
                    }
                    Err(e) => {
                        warn!(path = %path, error = %e, "Failed to remove orphaned asset");
                        report.errors.push(format!("{}: delete orphan: {}", path, e));
                    }
                },
                Err(e) => {
                    report.errors.push(format!("{}: lookup: {}", path, e));
                }
            }
        }
    }
}

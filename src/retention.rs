//! Cache retention: age and storage-budget eviction

use crate::{CacheStore, RetentionConfig, ScreenshotError};
use serde::Serialize;
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub scanned: usize,
    pub deleted: usize,
    pub freed_bytes: u64,
    pub remaining_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct RetentionManager {
    store: CacheStore,
    max_age: Duration,
    max_storage_bytes: u64,
}

impl RetentionManager {
    pub fn new(store: CacheStore, max_age: Duration, max_storage_bytes: u64) -> Self {
        Self {
            store,
            max_age,
            max_storage_bytes,
        }
    }

    pub fn from_config(store: CacheStore, config: &RetentionConfig) -> Self {
        Self::new(store, config.max_age(), config.max_storage_bytes)
    }

    /// Delete expired entries, then the oldest remaining ones until usage fits the budget
    ///
    /// Entries that vanish mid-sweep are skipped. A failed delete is logged and
    /// does not abort the sweep.
    pub async fn sweep(&self) -> Result<SweepReport, ScreenshotError> {
        self.sweep_at(SystemTime::now()).await
    }

    pub async fn sweep_at(&self, now: SystemTime) -> Result<SweepReport, ScreenshotError> {
        let mut entries = self.store.entries().await?;
        entries.sort_by_key(|entry| entry.modified);

        let mut report = SweepReport {
            scanned: entries.len(),
            ..Default::default()
        };
        let mut total: u64 = entries.iter().map(|entry| entry.size).sum();

        for entry in entries {
            let age = now.duration_since(entry.modified).unwrap_or_default();
            let expired = age > self.max_age;
            let over_budget = total > self.max_storage_bytes;
            if !expired && !over_budget {
                // Sorted oldest first, so nothing later is expired either
                break;
            }

            match self.store.delete(&entry.fingerprint).await {
                Ok(true) => {
                    report.deleted += 1;
                    report.freed_bytes += entry.size;
                    debug!(
                        "Evicted {} ({} bytes, {})",
                        entry.fingerprint.filename(),
                        entry.size,
                        if expired { "expired" } else { "over budget" }
                    );
                }
                Ok(false) => {}
                Err(e) => {
                    error!("Failed to evict {}: {}", entry.fingerprint.filename(), e);
                    continue;
                }
            }
            total = total.saturating_sub(entry.size);
        }

        report.remaining_bytes = total;
        if report.deleted > 0 {
            info!(
                "Retention sweep removed {} of {} entries, freed {}",
                report.deleted,
                report.scanned,
                crate::utils::format_bytes(report.freed_bytes)
            );
        }
        Ok(report)
    }

    /// Sweep every `interval` until shutdown is signalled
    pub fn start(self, interval: Duration, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            error!("Retention sweep failed: {}", e);
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("Retention task stopping");
                        break;
                    }
                }
            }
        })
    }
}

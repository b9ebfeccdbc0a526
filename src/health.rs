use crate::{CacheStore, PageRenderer, RendererHealth, StorageUsage};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub min_healthy_browsers: usize,
    /// Storage budget used to grade disk usage; `u64::MAX` disables the check
    pub max_storage_bytes: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            min_healthy_browsers: 1,
            max_storage_bytes: u64::MAX,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthLevel,
    pub browser_status: HealthLevel,
    pub storage_status: HealthLevel,
    pub browser: RendererHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageUsage>,
    pub check_duration_ms: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

pub struct HealthChecker {
    renderer: Arc<dyn PageRenderer>,
    store: CacheStore,
    thresholds: HealthThresholds,
}

impl HealthChecker {
    pub fn new(renderer: Arc<dyn PageRenderer>, store: CacheStore, thresholds: HealthThresholds) -> Self {
        Self {
            renderer,
            store,
            thresholds,
        }
    }

    pub async fn check(&self) -> HealthReport {
        let start_time = Instant::now();

        let browser = self.renderer.health().await;
        let browser_status = self.grade_browser(&browser);

        let (storage, storage_status) = match self.store.usage().await {
            Ok(usage) => (Some(usage), self.grade_storage(&usage)),
            Err(e) => {
                error!("Health check cannot read cache directory: {}", e);
                (None, HealthLevel::Critical)
            }
        };

        let status = determine_overall_health(&[browser_status, storage_status]);
        let check_duration = start_time.elapsed();
        debug!("Health check completed in {:?}: {:?}", check_duration, status);

        HealthReport {
            status,
            browser_status,
            storage_status,
            browser,
            storage,
            check_duration_ms: check_duration.as_millis() as u64,
            timestamp: chrono::Utc::now(),
        }
    }

    fn grade_browser(&self, stats: &RendererHealth) -> HealthLevel {
        if stats.healthy_instances < self.thresholds.min_healthy_browsers {
            warn!(
                "Browser pool health critical: only {} healthy instances",
                stats.healthy_instances
            );
            return HealthLevel::Critical;
        }

        let failure_rate = if stats.total_instances > 0 {
            stats.failed_instances as f64 / stats.total_instances as f64
        } else {
            0.0
        };

        if failure_rate > 0.5 {
            error!(
                "Browser pool health critical: failure rate {:.2}%",
                failure_rate * 100.0
            );
            return HealthLevel::Critical;
        } else if failure_rate > 0.2 {
            warn!(
                "Browser pool health warning: failure rate {:.2}%",
                failure_rate * 100.0
            );
            return HealthLevel::Warning;
        }

        let utilization = if stats.total_instances > 0 {
            stats.busy_instances as f64 / stats.total_instances as f64
        } else {
            0.0
        };

        if utilization > 0.9 {
            warn!("Browser pool high utilization: {:.2}%", utilization * 100.0);
            return HealthLevel::Warning;
        }

        HealthLevel::Healthy
    }

    fn grade_storage(&self, usage: &StorageUsage) -> HealthLevel {
        if self.thresholds.max_storage_bytes == u64::MAX || self.thresholds.max_storage_bytes == 0 {
            return HealthLevel::Healthy;
        }

        let ratio = usage.bytes as f64 / self.thresholds.max_storage_bytes as f64;
        if ratio > 1.0 {
            warn!("Cache exceeds its storage budget: {:.2}%", ratio * 100.0);
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        }
    }
}

pub fn determine_overall_health(healths: &[HealthLevel]) -> HealthLevel {
    if healths.contains(&HealthLevel::Critical) {
        HealthLevel::Critical
    } else if healths.contains(&HealthLevel::Warning) {
        HealthLevel::Warning
    } else {
        HealthLevel::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockRenderer;

    #[test]
    fn test_overall_health_takes_worst() {
        assert_eq!(
            determine_overall_health(&[HealthLevel::Healthy, HealthLevel::Healthy]),
            HealthLevel::Healthy
        );
        assert_eq!(
            determine_overall_health(&[HealthLevel::Warning, HealthLevel::Healthy]),
            HealthLevel::Warning
        );
        assert_eq!(
            determine_overall_health(&[HealthLevel::Warning, HealthLevel::Critical]),
            HealthLevel::Critical
        );
    }

    #[tokio::test]
    async fn test_healthy_report() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).await.unwrap();
        let checker = HealthChecker::new(
            Arc::new(MockRenderer::new()),
            store,
            HealthThresholds::default(),
        );

        let report = checker.check().await;
        assert_eq!(report.status, HealthLevel::Healthy);
        assert_eq!(report.storage, Some(StorageUsage::default()));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["browser"]["healthyInstances"], 1);
    }

    #[tokio::test]
    async fn test_browser_failures_grade_critical() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).await.unwrap();
        let renderer = MockRenderer::new().with_health(RendererHealth {
            total_instances: 4,
            healthy_instances: 1,
            busy_instances: 0,
            failed_instances: 3,
            total_renders: 10,
        });
        let checker = HealthChecker::new(Arc::new(renderer), store, HealthThresholds::default());

        let report = checker.check().await;
        assert_eq!(report.browser_status, HealthLevel::Critical);
        assert_eq!(report.status, HealthLevel::Critical);
    }

    #[tokio::test]
    async fn test_storage_over_budget_warns() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).await.unwrap();
        let key = crate::Fingerprint::compute(
            "https://example.com/",
            1200,
            630,
            false,
            crate::OutputFormat::Png,
            false,
        );
        store.write(&key, &[0u8; 64]).await.unwrap();

        let checker = HealthChecker::new(
            Arc::new(MockRenderer::new()),
            store,
            HealthThresholds {
                max_storage_bytes: 32,
                ..Default::default()
            },
        );

        let report = checker.check().await;
        assert_eq!(report.storage_status, HealthLevel::Warning);
        assert_eq!(report.status, HealthLevel::Warning);
    }
}

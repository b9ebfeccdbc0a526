use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{info, warn};

/// Counter kinds tracked by [`StatsCollector`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stat {
    Request,
    CacheHit,
    CacheMiss,
    Error,
    Upload,
    UploadFailure,
    Render,
    Coalesced,
    RateLimited,
    Blocked,
}

impl Stat {
    fn metric_name(&self) -> &'static str {
        match self {
            Stat::Request => "screenshot_requests_total",
            Stat::CacheHit => "screenshot_cache_hits_total",
            Stat::CacheMiss => "screenshot_cache_misses_total",
            Stat::Error => "screenshot_errors_total",
            Stat::Upload => "screenshot_uploads_total",
            Stat::UploadFailure => "screenshot_upload_failures_total",
            Stat::Render => "screenshot_renders_total",
            Stat::Coalesced => "screenshot_coalesced_total",
            Stat::RateLimited => "screenshot_rate_limited_total",
            Stat::Blocked => "screenshot_blocked_total",
        }
    }
}

/// Process-wide usage counters
///
/// Counters only ever increase. Every increment is also forwarded to the
/// `metrics` facade, which is a no-op until a recorder is installed.
pub struct StatsCollector {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    errors: AtomicU64,
    uploads: AtomicU64,
    upload_failures: AtomicU64,
    renders: AtomicU64,
    coalesced: AtomicU64,
    rate_limited: AtomicU64,
    blocked: AtomicU64,
    started_at: Instant,
    started_at_utc: chrono::DateTime<chrono::Utc>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            uploads: AtomicU64::new(0),
            upload_failures: AtomicU64::new(0),
            renders: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
            started_at: Instant::now(),
            started_at_utc: chrono::Utc::now(),
        }
    }

    pub fn record(&self, stat: Stat) {
        let slot = match stat {
            Stat::Request => &self.requests,
            Stat::CacheHit => &self.cache_hits,
            Stat::CacheMiss => &self.cache_misses,
            Stat::Error => &self.errors,
            Stat::Upload => &self.uploads,
            Stat::UploadFailure => &self.upload_failures,
            Stat::Render => &self.renders,
            Stat::Coalesced => &self.coalesced,
            Stat::RateLimited => &self.rate_limited,
            Stat::Blocked => &self.blocked,
        };
        slot.fetch_add(1, Ordering::Relaxed);
        counter!(stat.metric_name()).increment(1);
    }

    pub fn snapshot(&self) -> UsageStats {
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        let cache_misses = self.cache_misses.load(Ordering::Relaxed);
        let lookups = cache_hits + cache_misses;

        UsageStats {
            total_requests: self.requests.load(Ordering::Relaxed),
            cache_hits,
            cache_misses,
            errors: self.errors.load(Ordering::Relaxed),
            uploads: self.uploads.load(Ordering::Relaxed),
            upload_failures: self.upload_failures.load(Ordering::Relaxed),
            renders: self.renders.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            hit_rate: if lookups > 0 {
                cache_hits as f64 / lookups as f64
            } else {
                0.0
            },
            uptime_secs: self.started_at.elapsed().as_secs(),
            started_at: self.started_at_utc,
        }
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub errors: u64,
    pub uploads: u64,
    pub upload_failures: u64,
    pub renders: u64,
    pub coalesced: u64,
    pub rate_limited: u64,
    pub blocked: u64,
    /// Hits over hits plus misses, 0.0 before the first lookup
    pub hit_rate: f64,
    pub uptime_secs: u64,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// Install the global Prometheus recorder and describe our counters
///
/// Returns `None` when another recorder is already installed.
pub fn install_prometheus_recorder() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            describe_counter!("screenshot_requests_total", "Screenshot API requests received");
            describe_counter!("screenshot_cache_hits_total", "Requests served from the cache");
            describe_counter!("screenshot_cache_misses_total", "Requests that needed a capture");
            describe_counter!("screenshot_errors_total", "Requests that ended in an error");
            describe_counter!("screenshot_uploads_total", "Artifacts uploaded to object storage");
            describe_counter!("screenshot_upload_failures_total", "Failed uploads");
            describe_counter!("screenshot_renders_total", "Browser captures performed");
            describe_counter!("screenshot_coalesced_total", "Requests that joined an in-flight capture");
            describe_counter!("screenshot_rate_limited_total", "Requests rejected by the rate limiter");
            describe_counter!("screenshot_blocked_total", "Requests rejected by URL policy");
            info!("Prometheus recorder installed");
            Some(handle)
        }
        Err(e) => {
            warn!("Prometheus recorder not installed: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let stats = StatsCollector::new();
        stats.record(Stat::Request);
        stats.record(Stat::Request);
        stats.record(Stat::CacheHit);
        stats.record(Stat::CacheMiss);
        stats.record(Stat::CacheMiss);
        stats.record(Stat::CacheMiss);
        stats.record(Stat::Upload);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.cache_misses, 3);
        assert_eq!(snapshot.uploads, 1);
        assert_eq!(snapshot.errors, 0);
        assert!((snapshot.hit_rate - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_hit_rate_without_lookups() {
        let snapshot = StatsCollector::new().snapshot();
        assert_eq!(snapshot.hit_rate, 0.0);
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let stats = std::sync::Arc::new(StatsCollector::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record(Stat::Request);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(stats.snapshot().total_requests, 8000);
    }
}

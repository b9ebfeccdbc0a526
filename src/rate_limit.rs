//! Per-client fixed-window rate limiting
//!
//! Each client gets a window that starts at its first request. Once the window
//! has expired the next request replaces it with a fresh one instead of
//! continuing the old count. Rejected requests do not touch the window.

use crate::{RateLimitConfig, ScreenshotError};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitWindow {
    pub count: u32,
    pub reset_at: Instant,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<String, RateLimitWindow>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Admit or reject one request from `client`
    pub fn admit(&self, client: &str) -> bool {
        self.admit_at(client, Instant::now())
    }

    /// Same as [`admit`](Self::admit) with an explicit clock reading
    pub fn admit_at(&self, client: &str, now: Instant) -> bool {
        if !self.config.enabled {
            return true;
        }

        if !self.windows.contains_key(client) && self.windows.len() >= self.config.max_clients {
            self.make_room(now);
        }

        let window = self.config.window();
        let max_requests = self.config.max_requests;

        let (admitted, inserted) = {
            let mut inserted = false;
            let mut entry = self.windows.entry(client.to_string()).or_insert_with(|| {
                inserted = true;
                RateLimitWindow {
                    count: 0,
                    reset_at: now + window,
                }
            });

            if now >= entry.reset_at {
                *entry = RateLimitWindow {
                    count: 1,
                    reset_at: now + window,
                };
                (true, inserted)
            } else if entry.count >= max_requests {
                (false, inserted)
            } else {
                entry.count += 1;
                (true, inserted)
            }
        };

        // Concurrent first requests can all pass the room check above
        if inserted && self.windows.len() > self.config.max_clients {
            self.evict_oldest(self.config.max_clients, Some(client));
        }

        if !admitted {
            debug!("Rate limit exceeded for client {}", client);
        }
        admitted
    }

    /// Admit a request or produce the error returned to the client
    pub fn check(&self, client: &str) -> Result<(), ScreenshotError> {
        let now = Instant::now();
        if self.admit_at(client, now) {
            Ok(())
        } else {
            Err(ScreenshotError::RateLimited(self.retry_after(client, now)))
        }
    }

    /// Time until the client's current window resets
    pub fn retry_after(&self, client: &str, now: Instant) -> Duration {
        self.windows
            .get(client)
            .map(|w| w.reset_at.saturating_duration_since(now))
            .unwrap_or_default()
    }

    pub fn window(&self, client: &str) -> Option<RateLimitWindow> {
        self.windows.get(client).map(|w| *w)
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }

    /// Drop every window that has expired, returning how many were removed
    pub fn prune(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, w| now < w.reset_at);
        before.saturating_sub(self.windows.len())
    }

    fn make_room(&self, now: Instant) {
        let pruned = self.prune(now);
        if pruned > 0 {
            debug!("Pruned {} expired rate limit windows", pruned);
        }

        self.evict_oldest(self.config.max_clients.saturating_sub(1), None);
    }

    /// Evict windows with the earliest reset until at most `limit` remain
    fn evict_oldest(&self, limit: usize, keep: Option<&str>) {
        while self.windows.len() > limit {
            let oldest = self
                .windows
                .iter()
                .filter(|entry| Some(entry.key().as_str()) != keep)
                .min_by_key(|entry| entry.value().reset_at)
                .map(|entry| entry.key().clone());

            match oldest {
                Some(key) => {
                    self.windows.remove(&key);
                }
                None => break,
            }
        }
    }

    /// Periodically prune expired windows until shutdown
    pub fn start_pruning(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let removed = self.prune(Instant::now());
                        if removed > 0 {
                            debug!("Rate limiter pruned {} idle clients", removed);
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Rate limiter pruning stopped");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32, max_clients: usize) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            enabled: true,
            max_requests,
            window_secs: 3600,
            max_clients,
            ..Default::default()
        })
    }

    #[test]
    fn test_admits_up_to_limit() {
        let limiter = limiter(3, 100);
        let now = Instant::now();

        assert!(limiter.admit_at("a", now));
        assert!(limiter.admit_at("a", now));
        assert!(limiter.admit_at("a", now));
        assert!(!limiter.admit_at("a", now));
        assert!(!limiter.admit_at("a", now + Duration::from_secs(10)));

        // other clients are independent
        assert!(limiter.admit_at("b", now));
    }

    #[test]
    fn test_rejection_does_not_mutate_window() {
        let limiter = limiter(1, 100);
        let now = Instant::now();

        assert!(limiter.admit_at("a", now));
        let before = limiter.window("a").unwrap();
        assert!(!limiter.admit_at("a", now + Duration::from_secs(1)));
        assert_eq!(limiter.window("a").unwrap(), before);
        assert_eq!(before.count, 1);
    }

    #[test]
    fn test_expired_window_is_replaced() {
        let limiter = limiter(2, 100);
        let now = Instant::now();

        assert!(limiter.admit_at("a", now));
        assert!(limiter.admit_at("a", now));
        assert!(!limiter.admit_at("a", now));

        let later = now + Duration::from_secs(3600);
        assert!(limiter.admit_at("a", later));
        let window = limiter.window("a").unwrap();
        assert_eq!(window.count, 1);
        assert_eq!(window.reset_at, later + Duration::from_secs(3600));
    }

    #[test]
    fn test_disabled_always_admits() {
        let limiter = RateLimiter::new(RateLimitConfig {
            enabled: false,
            max_requests: 1,
            ..Default::default()
        });
        let now = Instant::now();
        for _ in 0..10 {
            assert!(limiter.admit_at("a", now));
        }
        assert_eq!(limiter.tracked_clients(), 0);
    }

    #[test]
    fn test_client_table_is_bounded() {
        let limiter = limiter(5, 3);
        let now = Instant::now();

        for (i, client) in ["a", "b", "c"].iter().enumerate() {
            assert!(limiter.admit_at(client, now + Duration::from_secs(i as u64)));
        }
        assert_eq!(limiter.tracked_clients(), 3);

        // no expired windows, so the earliest reset is evicted
        assert!(limiter.admit_at("d", now + Duration::from_secs(5)));
        assert_eq!(limiter.tracked_clients(), 3);
        assert!(limiter.window("a").is_none());
        assert!(limiter.window("d").is_some());
    }

    #[test]
    fn test_prune_removes_expired() {
        let limiter = limiter(5, 100);
        let now = Instant::now();
        limiter.admit_at("a", now);
        limiter.admit_at("b", now + Duration::from_secs(1800));

        let removed = limiter.prune(now + Duration::from_secs(3600));
        assert_eq!(removed, 1);
        assert!(limiter.window("a").is_none());
        assert!(limiter.window("b").is_some());
    }

    #[test]
    fn test_check_reports_retry_after() {
        let limiter = limiter(1, 100);
        assert!(limiter.check("a").is_ok());
        match limiter.check("a") {
            Err(ScreenshotError::RateLimited(retry)) => {
                assert!(retry <= Duration::from_secs(3600));
                assert!(retry > Duration::from_secs(3500));
            }
            other => panic!("expected rate limit error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_admissions_respect_limit() {
        let limiter = Arc::new(limiter(50, 100));
        let mut handles = Vec::new();
        for _ in 0..100 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.admit("shared") }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 50);
    }

    #[test]
    fn test_concurrent_new_clients_stay_within_bound() {
        let limiter = Arc::new(limiter(5, 8));
        let barrier = Arc::new(std::sync::Barrier::new(32));

        let threads: Vec<_> = (0..32)
            .map(|i| {
                let limiter = limiter.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    limiter.admit(&format!("client-{}", i))
                })
            })
            .collect();

        for thread in threads {
            assert!(thread.join().unwrap());
        }
        assert!(limiter.tracked_clients() <= 8);
    }
}

//! Browser pool management for concurrent Chrome instances
//!
//! This module keeps a fixed set of headless Chrome instances alive and leases
//! them to [`ChromiumRenderer`] one capture at a time. Instances whose DevTools
//! handler has died are relaunched on the next lease or by the periodic
//! health task.

use crate::{
    create_browser_config_with_instance_id, BrowserSettings, PageMetadata, PageRenderer,
    RenderJob, RenderedPage, RendererHealth, ScreenshotError,
};
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::emulation::{
    MediaFeature, SetDeviceMetricsOverrideParams, SetEmulatedMediaParams,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

const SELECTOR_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Current status of a browser instance in the pool
#[derive(Debug, Clone, Copy)]
pub enum InstanceStatus {
    /// Instance is ready and available for use
    Healthy,
    /// Instance is currently rendering a page
    Busy,
    /// Instance is being restarted
    Restarting,
    /// Instance has failed and needs replacement
    Failed,
}

/// A single Chrome browser instance in the pool
#[derive(Debug)]
pub struct BrowserInstance {
    pub id: usize,
    pub browser: Arc<Mutex<Browser>>,
    /// Background task driving Chrome DevTools Protocol communication
    pub handler: tokio::task::JoinHandle<Result<(), chromiumoxide::error::CdpError>>,
    pub last_used: Instant,
    pub render_count: usize,
    pub status: InstanceStatus,
    pub created_at: Instant,
    pub failure_count: usize,
}

impl BrowserInstance {
    pub fn new(
        id: usize,
        browser: Browser,
        handler: tokio::task::JoinHandle<Result<(), chromiumoxide::error::CdpError>>,
    ) -> Self {
        Self {
            id,
            browser: Arc::new(Mutex::new(browser)),
            handler,
            last_used: Instant::now(),
            render_count: 0,
            status: InstanceStatus::Healthy,
            created_at: Instant::now(),
            failure_count: 0,
        }
    }

    pub fn mark_used(&mut self) {
        self.last_used = Instant::now();
        self.render_count += 1;
        self.status = InstanceStatus::Busy;
    }

    pub fn mark_available(&mut self) {
        if matches!(self.status, InstanceStatus::Busy) {
            self.status = InstanceStatus::Healthy;
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.status, InstanceStatus::Healthy) && !self.handler.is_finished()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_time(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub async fn shutdown(self) {
        let _ = self.browser.lock().await.close().await;
        self.handler.abort();
    }
}

/// A leased browser. Dropping it returns the instance to the pool.
pub struct BrowserHandle {
    pub browser: Arc<Mutex<Browser>>,
    pub instance_id: usize,
    pool: Arc<BrowserPool>,
    permit: Option<OwnedSemaphorePermit>,
}

impl BrowserHandle {
    fn new(
        browser: Arc<Mutex<Browser>>,
        instance_id: usize,
        pool: Arc<BrowserPool>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            browser,
            instance_id,
            pool,
            permit: Some(permit),
        }
    }
}

impl Drop for BrowserHandle {
    fn drop(&mut self) {
        let pool = self.pool.clone();
        let instance_id = self.instance_id;
        let permit = self.permit.take();

        tokio::spawn(async move {
            pool.return_browser(instance_id).await;
            // release the lease only once the instance is back in the queue
            drop(permit);
        });
    }
}

pub struct BrowserPool {
    instances: Arc<Mutex<Vec<BrowserInstance>>>,
    available: Arc<Mutex<VecDeque<usize>>>,
    semaphore: Arc<Semaphore>,
    settings: BrowserSettings,
    is_shutting_down: Arc<AtomicBool>,
}

impl BrowserPool {
    pub async fn new(settings: BrowserSettings) -> Result<Self, ScreenshotError> {
        let pool = Self {
            instances: Arc::new(Mutex::new(Vec::new())),
            available: Arc::new(Mutex::new(VecDeque::new())),
            semaphore: Arc::new(Semaphore::new(settings.pool_size)),
            settings,
            is_shutting_down: Arc::new(AtomicBool::new(false)),
        };

        pool.initialize_instances().await?;
        pool.start_health_check_task();

        Ok(pool)
    }

    async fn initialize_instances(&self) -> Result<(), ScreenshotError> {
        let mut instances = self.instances.lock().await;
        let mut available = self.available.lock().await;

        for i in 0..self.settings.pool_size {
            // Stagger launches to avoid profile directory races
            if i > 0 {
                sleep(Duration::from_millis(500)).await;
            }

            match self.create_browser_instance(i).await {
                Ok(instance) => {
                    instances.push(instance);
                    available.push_back(i);
                    info!("Browser instance {} created successfully", i);
                }
                Err(e) => {
                    error!("Failed to create browser instance {}: {}", i, e);
                    return Err(e);
                }
            }
        }

        info!("Browser pool initialized with {} instances", instances.len());
        Ok(())
    }

    async fn create_browser_instance(&self, id: usize) -> Result<BrowserInstance, ScreenshotError> {
        let temp_dir = format!("/tmp/chromium-temp-{}-{}", std::process::id(), id);
        tokio::fs::create_dir_all(&temp_dir).await.map_err(|e| {
            ScreenshotError::BrowserLaunchFailed(format!("Failed to create temp dir: {}", e))
        })?;

        let instance_config = create_browser_config_with_instance_id(&self.settings, Some(id))?;

        let (browser, mut handler) = Browser::launch(instance_config)
            .await
            .map_err(|e| ScreenshotError::BrowserLaunchFailed(e.to_string()))?;

        // The handler is a Stream and must be polled for the browser to make progress
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    error!("Browser {} handler error: {}", id, e);
                    return Err(e);
                }
            }
            debug!("Browser {} handler stream ended", id);
            Ok(())
        });

        Ok(BrowserInstance::new(id, browser, handler_task))
    }

    pub async fn get_browser(&self) -> Result<BrowserHandle, ScreenshotError> {
        if self.is_shutting_down.load(Ordering::Relaxed) {
            return Err(ScreenshotError::BrowserUnavailable);
        }

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ScreenshotError::BrowserUnavailable)?;

        for attempt in 0..3 {
            let instance_id = self
                .available
                .lock()
                .await
                .pop_front()
                .ok_or(ScreenshotError::BrowserUnavailable)?;

            let healthy = {
                let instances = self.instances.lock().await;
                instances
                    .get(instance_id)
                    .map(BrowserInstance::is_healthy)
                    .unwrap_or(false)
            };

            if !healthy {
                warn!(
                    "Browser instance {} unhealthy (attempt {}), attempting restart",
                    instance_id,
                    attempt + 1
                );

                if let Err(e) = self.restart_instance(instance_id).await {
                    self.available.lock().await.push_back(instance_id);
                    if attempt < 2 {
                        continue;
                    }
                    return Err(e);
                }
            }

            let browser = {
                let mut instances = self.instances.lock().await;
                let instance = instances
                    .get_mut(instance_id)
                    .ok_or(ScreenshotError::BrowserUnavailable)?;
                instance.mark_used();
                instance.browser.clone()
            };

            return Ok(BrowserHandle::new(
                browser,
                instance_id,
                Arc::new(self.clone()),
                permit,
            ));
        }

        Err(ScreenshotError::BrowserUnavailable)
    }

    pub async fn return_browser(&self, instance_id: usize) {
        let mut instances = self.instances.lock().await;
        let mut available = self.available.lock().await;

        if let Some(instance) = instances.get_mut(instance_id) {
            instance.mark_available();
            available.push_back(instance_id);
        }
    }

    pub async fn record_failure(&self, instance_id: usize) {
        let mut instances = self.instances.lock().await;
        if let Some(instance) = instances.get_mut(instance_id) {
            instance.failure_count += 1;
        }
    }

    pub async fn restart_instance(&self, instance_id: usize) -> Result<(), ScreenshotError> {
        let mut instances = self.instances.lock().await;

        let Some(instance) = instances.get_mut(instance_id) else {
            return Err(ScreenshotError::BrowserUnavailable);
        };
        instance.status = InstanceStatus::Restarting;

        let _ = instance.browser.lock().await.close().await;
        instance.handler.abort();

        match self.create_browser_instance(instance_id).await {
            Ok(new_instance) => {
                *instance = new_instance;
                info!("Browser instance {} restarted successfully", instance_id);
                Ok(())
            }
            Err(e) => {
                instance.status = InstanceStatus::Failed;
                instance.failure_count += 1;
                error!("Failed to restart browser instance {}: {}", instance_id, e);
                Err(e)
            }
        }
    }

    fn start_health_check_task(&self) {
        let pool = self.clone();

        tokio::spawn(async move {
            let mut quick_interval = tokio::time::interval(Duration::from_secs(15));
            let mut deep_interval = tokio::time::interval(Duration::from_secs(60));

            while !pool.is_shutting_down.load(Ordering::Relaxed) {
                tokio::select! {
                    _ = quick_interval.tick() => {
                        pool.quick_health_check().await;
                    }
                    _ = deep_interval.tick() => {
                        pool.deep_health_check().await;
                    }
                }
            }
        });
    }

    async fn quick_health_check(&self) {
        let instances = self.instances.lock().await;
        for instance in instances.iter() {
            if instance.handler.is_finished() {
                warn!("Browser instance {} handler exited, restart pending", instance.id);
            }

            if instance.idle_time() > Duration::from_secs(300)
                && matches!(instance.status, InstanceStatus::Busy)
            {
                warn!(
                    "Browser instance {} busy for {}s",
                    instance.id,
                    instance.idle_time().as_secs()
                );
            }
        }
    }

    async fn deep_health_check(&self) {
        let instances_to_restart: Vec<usize> = {
            let instances = self.instances.lock().await;
            instances
                .iter()
                .filter(|instance| {
                    // Busy instances are left alone; they are restarted on their next lease
                    !matches!(instance.status, InstanceStatus::Busy)
                        && (instance.age() > Duration::from_secs(3600)
                            || instance.failure_count > 10
                            || instance.handler.is_finished()
                            || matches!(instance.status, InstanceStatus::Failed))
                })
                .map(|instance| {
                    info!(
                        "Scheduling restart for browser instance {}: age={:?}, failures={}",
                        instance.id,
                        instance.age(),
                        instance.failure_count
                    );
                    instance.id
                })
                .collect()
        };

        for instance_id in instances_to_restart {
            if let Err(e) = self.restart_instance(instance_id).await {
                error!(
                    "Failed to restart browser instance {} during health check: {}",
                    instance_id, e
                );
            }
        }
    }

    pub async fn shutdown(&self) {
        info!("Shutting down browser pool...");
        self.is_shutting_down.store(true, Ordering::Relaxed);

        // Give in-flight renders a moment to hand their instances back
        let mut retries = 0;
        while retries < 10 {
            let available_count = self.available.lock().await.len();
            if available_count == self.settings.pool_size {
                break;
            }

            sleep(Duration::from_millis(100)).await;
            retries += 1;
        }

        let mut instances = self.instances.lock().await;
        for instance in instances.drain(..) {
            instance.shutdown().await;
        }

        info!("Browser pool shutdown complete");
    }

    pub async fn get_stats(&self) -> RendererHealth {
        let instances = self.instances.lock().await;

        let mut stats = RendererHealth {
            total_instances: instances.len(),
            ..Default::default()
        };

        for instance in instances.iter() {
            stats.total_renders += instance.render_count;
            match instance.status {
                InstanceStatus::Healthy if !instance.handler.is_finished() => {
                    stats.healthy_instances += 1
                }
                InstanceStatus::Busy => stats.busy_instances += 1,
                InstanceStatus::Failed => stats.failed_instances += 1,
                _ => {}
            }
        }

        stats
    }
}

impl Clone for BrowserPool {
    fn clone(&self) -> Self {
        Self {
            instances: self.instances.clone(),
            available: self.available.clone(),
            semaphore: self.semaphore.clone(),
            settings: self.settings.clone(),
            is_shutting_down: self.is_shutting_down.clone(),
        }
    }
}

/// Closes the tab when the capture finishes or is abandoned
struct PageGuard(Option<Page>);

impl Drop for PageGuard {
    fn drop(&mut self) {
        if let Some(page) = self.0.take() {
            tokio::spawn(async move {
                let _ = page.close().await;
            });
        }
    }
}

/// [`PageRenderer`] backed by the browser pool
pub struct ChromiumRenderer {
    pool: Arc<BrowserPool>,
}

impl ChromiumRenderer {
    pub async fn launch(settings: BrowserSettings) -> Result<Self, ScreenshotError> {
        let pool = BrowserPool::new(settings).await?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    pub fn pool(&self) -> &Arc<BrowserPool> {
        &self.pool
    }
}

#[async_trait]
impl PageRenderer for ChromiumRenderer {
    async fn render(&self, job: &RenderJob) -> Result<RenderedPage, ScreenshotError> {
        let handle = self.pool.get_browser().await?;

        let page = {
            let browser = handle.browser.lock().await;
            browser
                .new_page("about:blank")
                .await
                .map_err(|e| ScreenshotError::RenderFailed(format!("opening tab: {}", e)))?
        };
        let guard = PageGuard(Some(page.clone()));

        let result = capture_page(&page, job).await;
        if let Err(e) = &result {
            warn!("Render of {} on browser {} failed: {}", job.url, handle.instance_id, e);
            self.pool.record_failure(handle.instance_id).await;
        }

        drop(guard);
        result
    }

    async fn health(&self) -> RendererHealth {
        self.pool.get_stats().await
    }

    async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

async fn capture_page(page: &Page, job: &RenderJob) -> Result<RenderedPage, ScreenshotError> {
    if let Some(user_agent) = &job.user_agent {
        page.set_user_agent(user_agent.as_str())
            .await
            .map_err(|e| ScreenshotError::RenderFailed(e.to_string()))?;
    }

    let emulation_params = SetDeviceMetricsOverrideParams::builder()
        .width(job.width)
        .height(job.height)
        .device_scale_factor(1.0)
        .mobile(false)
        .build()
        .map_err(ScreenshotError::RenderFailed)?;
    page.execute(emulation_params)
        .await
        .map_err(|e| ScreenshotError::RenderFailed(e.to_string()))?;

    if job.dark_mode {
        let media = SetEmulatedMediaParams {
            media: None,
            features: Some(vec![MediaFeature {
                name: "prefers-color-scheme".to_string(),
                value: "dark".to_string(),
            }]),
        };
        page.execute(media)
            .await
            .map_err(|e| ScreenshotError::RenderFailed(e.to_string()))?;
    }

    page.goto(job.url.as_str())
        .await
        .map_err(|e| ScreenshotError::RenderFailed(format!("navigating to {}: {}", job.url, e)))?;

    let selector_found = match &job.wait_for {
        Some(selector) => {
            let found = wait_for_selector(page, selector, job.selector_timeout).await;
            if !found {
                warn!(
                    "Selector '{}' not found on {} within {:?}, capturing anyway",
                    selector, job.url, job.selector_timeout
                );
            }
            Some(found)
        }
        None => None,
    };

    if !job.delay.is_zero() {
        sleep(job.delay).await;
    }

    let metadata = if job.extract_metadata {
        Some(extract_metadata(page).await)
    } else {
        None
    };

    let params = ScreenshotParams::builder()
        .format(CaptureScreenshotFormat::Png)
        .full_page(job.full_page)
        .build();
    let image = page
        .screenshot(params)
        .await
        .map_err(|e| ScreenshotError::RenderFailed(format!("capture: {}", e)))?;

    Ok(RenderedPage {
        image,
        metadata,
        selector_found,
    })
}

/// Poll for a selector until it appears or the limit passes
async fn wait_for_selector(page: &Page, selector: &str, limit: Duration) -> bool {
    let poll = async {
        loop {
            if page.find_element(selector).await.is_ok() {
                return;
            }
            sleep(SELECTOR_POLL_INTERVAL).await;
        }
    };

    timeout(limit, poll).await.is_ok()
}

async fn extract_metadata(page: &Page) -> PageMetadata {
    PageMetadata {
        title: page.get_title().await.ok().flatten(),
        description: evaluate_string(
            page,
            "(document.querySelector('meta[name=\"description\"]') || document.querySelector('meta[property=\"og:description\"]') || {}).content || null",
        )
        .await,
        canonical_url: evaluate_string(
            page,
            "(document.querySelector('link[rel=\"canonical\"]') || {}).href || null",
        )
        .await,
    }
}

async fn evaluate_string(page: &Page, expression: &str) -> Option<String> {
    page.evaluate(expression)
        .await
        .ok()
        .and_then(|result| result.into_value::<Option<String>>().ok())
        .flatten()
        .filter(|s| !s.trim().is_empty())
}

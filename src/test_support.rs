use crate::{
    CacheStore, CaptureCoordinator, CoordinatorSettings, PageMetadata, PageRenderer,
    RenderJob, RenderedPage, RendererHealth, ScreenshotError, StatsCollector,
};
use async_trait::async_trait;
use image::{DynamicImage, ImageBuffer, ImageOutputFormat, Rgba};
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Renderer double that paints a solid image and counts invocations
pub struct MockRenderer {
    calls: AtomicUsize,
    shade: AtomicU8,
    delay: Duration,
    failure: Option<String>,
    health: RendererHealth,
    jobs: Mutex<Vec<RenderJob>>,
}

impl MockRenderer {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            shade: AtomicU8::new(40),
            delay: Duration::ZERO,
            failure: None,
            health: RendererHealth {
                total_instances: 1,
                healthy_instances: 1,
                ..Default::default()
            },
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    pub fn with_health(mut self, health: RendererHealth) -> Self {
        self.health = health;
        self
    }

    /// Change the colour of subsequent captures
    pub fn set_shade(&self, shade: u8) {
        self.shade.store(shade, Ordering::SeqCst);
    }

    pub fn render_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_job(&self) -> Option<RenderJob> {
        self.jobs.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl PageRenderer for MockRenderer {
    async fn render(&self, job: &RenderJob) -> Result<RenderedPage, ScreenshotError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.jobs.lock().unwrap().push(job.clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if let Some(message) = &self.failure {
            return Err(ScreenshotError::RenderFailed(message.clone()));
        }

        Ok(RenderedPage {
            image: solid_png(64, 48, self.shade.load(Ordering::SeqCst)),
            metadata: job.extract_metadata.then(|| PageMetadata {
                title: Some("Mock page".to_string()),
                description: None,
                canonical_url: Some(job.url.to_string()),
            }),
            selector_found: job.wait_for.as_ref().map(|s| !s.contains("missing")),
        })
    }

    async fn health(&self) -> RendererHealth {
        self.health
    }
}

pub fn solid_png(width: u32, height: u32, shade: u8) -> Vec<u8> {
    let img = ImageBuffer::from_pixel(width, height, Rgba([shade, shade, 255 - shade, 255]));
    let mut out = Vec::new();
    DynamicImage::ImageRgba8(img)
        .write_to(&mut Cursor::new(&mut out), ImageOutputFormat::Png)
        .unwrap();
    out
}

pub fn test_settings() -> CoordinatorSettings {
    CoordinatorSettings {
        render_timeout: Duration::from_secs(5),
        selector_timeout: Duration::from_millis(100),
        max_concurrent_renders: 4,
    }
}

pub async fn coordinator_with(dir: &Path, renderer: Arc<MockRenderer>) -> CaptureCoordinator {
    let store = CacheStore::open(dir).await.unwrap();
    CaptureCoordinator::new(store, renderer, Arc::new(StatsCollector::new()), test_settings())
}

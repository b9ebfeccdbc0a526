//! Cache resolution and capture coordination
//!
//! `CaptureCoordinator::resolve` turns a validated request into an artifact:
//! it consults the cache according to the request's directive, and on a miss
//! runs render, encode and write. At most one capture per fingerprint runs at
//! any time. Requests that miss while a capture for their fingerprint is in
//! flight wait for it and share its result, success or error.
//!
//! Captures run in their own task, so a client that disconnects does not
//! cancel work that other clients are waiting on.

use crate::{
    CacheDirective, CacheStore, CaptureRequest, Config, EncodeOptions, Fingerprint,
    ImageEncoder, ObjectStore, PageMetadata, PageRenderer, RasterEncoder, RenderJob,
    ScreenshotError, Stat, StatsCollector,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

type SharedOutcome = Result<Arc<CaptureOutput>, ScreenshotError>;
type InFlight = Arc<Mutex<HashMap<Fingerprint, watch::Receiver<Option<SharedOutcome>>>>>;

#[derive(Debug)]
struct CaptureOutput {
    data: Bytes,
    metadata: Option<PageMetadata>,
    selector_found: Option<bool>,
}

/// Outcome of a resolved request
#[derive(Debug, Clone)]
pub struct ArtifactResult {
    pub fingerprint: Fingerprint,
    pub path: PathBuf,
    pub data: Bytes,
    /// Served from the cache without a capture
    pub cached: bool,
    /// Joined a capture started by another request
    pub coalesced: bool,
    pub metadata: Option<PageMetadata>,
    pub selector_found: Option<bool>,
    pub upload_url: Option<String>,
    pub duration: Duration,
}

impl ArtifactResult {
    pub fn filename(&self) -> String {
        self.fingerprint.filename()
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorSettings {
    pub render_timeout: Duration,
    pub selector_timeout: Duration,
    pub max_concurrent_renders: usize,
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            render_timeout: config.browser.render_timeout(),
            selector_timeout: config.browser.selector_timeout(),
            max_concurrent_renders: config.max_concurrent_renders,
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

enum Join {
    /// Entry appeared while we were deciding; read it once the registry is released
    Cached,
    Capture {
        outcome: watch::Receiver<Option<SharedOutcome>>,
        coalesced: bool,
    },
}

#[derive(Clone)]
pub struct CaptureCoordinator {
    store: CacheStore,
    renderer: Arc<dyn PageRenderer>,
    encoder: Arc<dyn ImageEncoder>,
    uploader: Option<Arc<dyn ObjectStore>>,
    stats: Arc<StatsCollector>,
    in_flight: InFlight,
    render_slots: Arc<Semaphore>,
    settings: CoordinatorSettings,
}

impl CaptureCoordinator {
    pub fn new(
        store: CacheStore,
        renderer: Arc<dyn PageRenderer>,
        stats: Arc<StatsCollector>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            store,
            renderer,
            encoder: Arc::new(RasterEncoder),
            uploader: None,
            stats,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            render_slots: Arc::new(Semaphore::new(settings.max_concurrent_renders.max(1))),
            settings,
        }
    }

    pub fn with_encoder(mut self, encoder: Arc<dyn ImageEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn with_uploader(mut self, uploader: Option<Arc<dyn ObjectStore>>) -> Self {
        self.uploader = uploader;
        self
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn renderer(&self) -> &Arc<dyn PageRenderer> {
        &self.renderer
    }

    pub fn stats(&self) -> &Arc<StatsCollector> {
        &self.stats
    }

    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    pub async fn resolve(&self, request: &CaptureRequest) -> Result<ArtifactResult, ScreenshotError> {
        let started = Instant::now();
        let fingerprint = Fingerprint::of(request);

        if request.cache != CacheDirective::Refresh {
            if let Some(data) = self.lookup(&fingerprint).await? {
                return Ok(self.cache_hit(request, fingerprint, data, started).await);
            }

            if request.cache == CacheDirective::Only {
                self.stats.record(Stat::CacheMiss);
                return Err(ScreenshotError::NotCached);
            }
        }

        let (mut outcome, coalesced) = loop {
            match self.join_or_start(&fingerprint, request).await? {
                Join::Cached => {
                    if let Some(data) = self.lookup(&fingerprint).await? {
                        return Ok(self.cache_hit(request, fingerprint, data, started).await);
                    }
                }
                Join::Capture { outcome, coalesced } => break (outcome, coalesced),
            }
        };

        self.stats.record(Stat::CacheMiss);
        if coalesced {
            self.stats.record(Stat::Coalesced);
            debug!("Joined in-flight capture of {} ({})", request.url, fingerprint);
        }

        let shared = outcome
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ScreenshotError::RenderFailed("capture task aborted".to_string()))?
            .clone()
            .ok_or_else(|| ScreenshotError::RenderFailed("capture produced no result".to_string()))?;
        let output = shared?;

        let upload_url = self.maybe_upload(request, &fingerprint, &output.data).await;

        Ok(ArtifactResult {
            path: self.store.path_for(&fingerprint),
            fingerprint,
            data: output.data.clone(),
            cached: false,
            coalesced,
            metadata: output.metadata.clone(),
            selector_found: output.selector_found,
            upload_url,
            duration: started.elapsed(),
        })
    }

    /// Read an entry if present; a file removed between check and read counts as absent
    async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<Bytes>, ScreenshotError> {
        if !self.store.exists(fingerprint).await {
            return Ok(None);
        }

        match self.store.read(fingerprint).await {
            Ok(data) => Ok(Some(data)),
            Err(ScreenshotError::NotFound(_)) => {
                debug!("Cache entry {} vanished before read", fingerprint);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn cache_hit(
        &self,
        request: &CaptureRequest,
        fingerprint: Fingerprint,
        data: Bytes,
        started: Instant,
    ) -> ArtifactResult {
        self.stats.record(Stat::CacheHit);
        debug!("Cache hit for {} ({})", request.url, fingerprint);

        let upload_url = self.maybe_upload(request, &fingerprint, &data).await;

        ArtifactResult {
            path: self.store.path_for(&fingerprint),
            fingerprint,
            data,
            cached: true,
            coalesced: false,
            metadata: None,
            selector_found: None,
            upload_url,
            duration: started.elapsed(),
        }
    }

    async fn join_or_start(
        &self,
        fingerprint: &Fingerprint,
        request: &CaptureRequest,
    ) -> Result<Join, ScreenshotError> {
        let mut in_flight = self.in_flight.lock().await;

        if let Some(existing) = in_flight.get(fingerprint) {
            let finished = existing.borrow().is_some();
            let abandoned = !finished && existing.has_changed().is_err();
            if !abandoned {
                return Ok(Join::Capture {
                    outcome: existing.clone(),
                    coalesced: true,
                });
            }
            warn!("Discarding abandoned capture of {}", fingerprint);
            in_flight.remove(fingerprint);
        } else if request.cache != CacheDirective::Refresh {
            // A capture may have finished between our lookup and taking the lock
            if self.store.exists(fingerprint).await {
                return Ok(Join::Cached);
            }
        }

        let (tx, rx) = watch::channel(None);
        in_flight.insert(fingerprint.clone(), rx.clone());
        self.spawn_capture(fingerprint.clone(), request.clone(), tx);

        Ok(Join::Capture {
            outcome: rx,
            coalesced: false,
        })
    }

    fn spawn_capture(
        &self,
        fingerprint: Fingerprint,
        request: CaptureRequest,
        tx: watch::Sender<Option<SharedOutcome>>,
    ) {
        let this = self.clone();

        tokio::spawn(async move {
            let outcome = this.capture(&fingerprint, &request).await.map(Arc::new);
            if let Err(e) = &outcome {
                error!("Capture of {} failed: {}", request.url, e);
            }

            // Deregister first: anyone who already holds a receiver still sees the result
            this.in_flight.lock().await.remove(&fingerprint);
            let _ = tx.send(Some(outcome));
        });
    }

    async fn capture(
        &self,
        fingerprint: &Fingerprint,
        request: &CaptureRequest,
    ) -> Result<CaptureOutput, ScreenshotError> {
        let _slot = self.render_slots.clone().acquire_owned().await?;
        let started = Instant::now();

        let job = RenderJob::from_request(request, self.settings.selector_timeout);
        self.stats.record(Stat::Render);

        let rendered = match timeout(self.settings.render_timeout, self.renderer.render(&job)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    "Render of {} timed out after {:?}",
                    request.url, self.settings.render_timeout
                );
                return Err(ScreenshotError::RenderTimeout(self.settings.render_timeout));
            }
        };

        let encoder = self.encoder.clone();
        let options = EncodeOptions {
            format: request.format,
            quality: request.quality,
            crop: request.crop,
        };
        let raw = rendered.image;
        let encoded = tokio::task::spawn_blocking(move || encoder.encode(&raw, &options))
            .await
            .map_err(|e| ScreenshotError::EncodeFailed(e.to_string()))??;

        self.store.write(fingerprint, &encoded).await?;

        info!(
            "Captured {} as {} ({} bytes) in {:?}",
            request.url,
            fingerprint.filename(),
            encoded.len(),
            started.elapsed()
        );

        Ok(CaptureOutput {
            data: Bytes::from(encoded),
            metadata: rendered.metadata,
            selector_found: rendered.selector_found,
        })
    }

    /// Upload failures are logged and counted; they never fail the request
    async fn maybe_upload(
        &self,
        request: &CaptureRequest,
        fingerprint: &Fingerprint,
        data: &Bytes,
    ) -> Option<String> {
        if !request.upload {
            return None;
        }
        let uploader = match &self.uploader {
            Some(uploader) => uploader,
            None => {
                debug!("Upload requested but no object store is configured");
                return None;
            }
        };

        match uploader
            .upload(
                &fingerprint.filename(),
                data.clone(),
                fingerprint.format().content_type(),
            )
            .await
        {
            Ok(url) => {
                self.stats.record(Stat::Upload);
                Some(url)
            }
            Err(e) => {
                self.stats.record(Stat::UploadFailure);
                warn!("Upload of {} failed: {}", fingerprint.filename(), e);
                None
            }
        }
    }
}

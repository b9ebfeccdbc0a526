//! HTTP surface
//!
//! Routes, shared state, client identification and the listener loop. The
//! request handlers themselves live in `handlers`.

use crate::handlers;
use crate::{
    install_prometheus_recorder, BatchProcessor, CacheStore, CaptureCoordinator, ChromiumRenderer,
    Config, CoordinatorSettings, HealthChecker, HealthThresholds, ObjectStore, PageRenderer,
    RateLimiter, S3ObjectStore, SafetyGate, ScreenshotError, StatsCollector,
};
use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub gate: SafetyGate,
    pub rate_limiter: Arc<RateLimiter>,
    pub coordinator: CaptureCoordinator,
    pub batch: Arc<BatchProcessor>,
    pub health: Arc<HealthChecker>,
    pub stats: Arc<StatsCollector>,
    pub store: CacheStore,
    pub prometheus: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        config: Config,
        coordinator: CaptureCoordinator,
        health: HealthChecker,
        prometheus: Option<PrometheusHandle>,
    ) -> Self {
        let gate = SafetyGate::new();
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let batch = Arc::new(BatchProcessor::new(coordinator.clone(), gate.clone()));

        Self {
            gate,
            rate_limiter,
            stats: coordinator.stats().clone(),
            store: coordinator.store().clone(),
            batch,
            coordinator,
            health: Arc::new(health),
            config: Arc::new(config),
            prometheus,
        }
    }
}

/// Wire up the production service: Chromium pool, cache directory and optional S3 upload
pub async fn build_state(config: Config) -> Result<AppState, ScreenshotError> {
    let prometheus = if config.metrics_enabled {
        install_prometheus_recorder()
    } else {
        None
    };

    let store = CacheStore::open(&config.cache.directory).await?;
    let renderer: Arc<dyn PageRenderer> =
        Arc::new(ChromiumRenderer::launch(config.browser.clone()).await?);
    let uploader: Option<Arc<dyn ObjectStore>> = match &config.upload {
        Some(upload) => Some(Arc::new(S3ObjectStore::from_config(upload).await)),
        None => None,
    };

    let coordinator = CaptureCoordinator::new(
        store.clone(),
        renderer.clone(),
        Arc::new(StatsCollector::new()),
        CoordinatorSettings::from_config(&config),
    )
    .with_uploader(uploader);

    let thresholds = HealthThresholds {
        max_storage_bytes: if config.retention.enabled {
            config.retention.max_storage_bytes
        } else {
            u64::MAX
        },
        ..Default::default()
    };
    let health = HealthChecker::new(renderer, store, thresholds);

    Ok(AppState::new(config, coordinator, health, prometheus))
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/screenshot",
            get(handlers::screenshot_get)
                .post(handlers::screenshot_post)
                .fallback(handlers::method_not_allowed),
        )
        .route(
            "/api/batch",
            post(handlers::batch).fallback(handlers::method_not_allowed),
        )
        .route("/stats", get(handlers::stats).fallback(handlers::method_not_allowed))
        .route("/health", get(handlers::health).fallback(handlers::method_not_allowed))
        .route("/metrics", get(handlers::metrics).fallback(handlers::method_not_allowed))
        .route(
            "/images/{filename}",
            get(handlers::image).fallback(handlers::method_not_allowed),
        )
        .fallback(handlers::not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the shutdown channel fires
pub async fn serve(
    state: AppState,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), ScreenshotError> {
    let address = state.config.server.address();
    let listener = TcpListener::bind(&address).await.map_err(|e| {
        ScreenshotError::ConfigurationError(format!("cannot bind {}: {}", address, e))
    })?;
    info!("Screenshot API listening on http://{}", address);

    let app = build_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.recv().await;
        info!("HTTP server draining connections");
    })
    .await
    .map_err(|e| ScreenshotError::StorageError(format!("server error: {}", e)))?;

    Ok(())
}

/// Rate limiting identity of the caller
///
/// The socket peer address, unless `rate_limit.trust_forwarded_headers` is set,
/// in which case the first `X-Forwarded-For` hop and then `X-Real-IP` win.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientId(pub String);

impl FromRequestParts<AppState> for ClientId {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let forwarded = if state.config.rate_limit.trust_forwarded_headers {
            header("x-forwarded-for").or_else(|| header("x-real-ip"))
        } else {
            None
        };

        let id = forwarded
            .or_else(|| {
                parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip().to_string())
            })
            .unwrap_or_else(|| "unknown".to_string());

        Ok(ClientId(id))
    }
}

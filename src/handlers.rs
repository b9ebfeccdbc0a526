use crate::server::{AppState, ClientId};
use crate::utils::{format_bytes, kilobytes};
use crate::{
    ArtifactResult, BatchReport, BatchRequest, CaptureRequest, Fingerprint, HealthLevel, OutputMode,
    PageMetadata, ScreenshotError, ScreenshotParams, Stat, StorageUsage, UsageStats,
};
use axum::body::{Body, Bytes};
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

/// JSON descriptor returned for `output=json`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshotResponse {
    pub success: bool,
    pub url: String,
    pub filename: String,
    pub local_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_url: Option<String>,
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub size: usize,
    #[serde(rename = "sizeKB")]
    pub size_kb: f64,
    pub cached: bool,
    /// Milliseconds
    pub response_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PageMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector_found: Option<bool>,
}

impl ScreenshotResponse {
    fn new(request: &CaptureRequest, artifact: ArtifactResult, elapsed: Duration) -> Self {
        Self {
            success: true,
            url: request.url.to_string(),
            filename: artifact.filename(),
            local_path: artifact.path.display().to_string(),
            s3_url: artifact.upload_url,
            width: request.width,
            height: request.height,
            format: request.format.as_str().to_string(),
            size: artifact.data.len(),
            size_kb: kilobytes(artifact.data.len() as u64),
            cached: artifact.cached,
            response_time: elapsed.as_millis() as u64,
            metadata: artifact.metadata,
            selector_found: artifact.selector_found,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    #[serde(flatten)]
    pub usage: UsageStats,
    pub storage: StorageUsage,
    pub storage_human: String,
    pub tracked_clients: usize,
    pub in_flight_captures: usize,
}

pub async fn screenshot_get(
    State(state): State<AppState>,
    client: ClientId,
    RawQuery(query): RawQuery,
) -> Response {
    let started = Instant::now();
    state.stats.record(Stat::Request);

    let params = serde_urlencoded::from_str::<ScreenshotParams>(query.as_deref().unwrap_or(""))
        .map_err(|e| ScreenshotError::InvalidInput(format!("malformed query: {}", e)));

    match params {
        Ok(params) => screenshot(&state, &client, params, started).await,
        Err(e) => failure(&state, e),
    }
}

pub async fn screenshot_post(
    State(state): State<AppState>,
    client: ClientId,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    state.stats.record(Stat::Request);

    let params = serde_json::from_slice::<ScreenshotParams>(&body)
        .map_err(|e| ScreenshotError::InvalidInput(format!("malformed JSON body: {}", e)));

    match params {
        Ok(params) => screenshot(&state, &client, params, started).await,
        Err(e) => failure(&state, e),
    }
}

async fn screenshot(
    state: &AppState,
    client: &ClientId,
    params: ScreenshotParams,
    started: Instant,
) -> Response {
    match capture(state, client, params, started).await {
        Ok(response) => response,
        Err(e) => failure(state, e),
    }
}

/// Gate, then rate limit, then resolve; nothing is spent on a rejected request
async fn capture(
    state: &AppState,
    client: &ClientId,
    params: ScreenshotParams,
    started: Instant,
) -> Result<Response, ScreenshotError> {
    let (request, output) = params.into_request(&state.gate)?;
    state.rate_limiter.check(&client.0)?;

    let limit = state.config.server.request_timeout();
    let artifact = timeout(limit, state.coordinator.resolve(&request))
        .await
        .map_err(|_| ScreenshotError::RenderTimeout(limit))??;

    let elapsed = started.elapsed();
    debug!(
        "Served {} for {} in {:?} (cached: {})",
        artifact.filename(),
        client.0,
        elapsed,
        artifact.cached
    );

    let response = match output {
        OutputMode::Json => Json(ScreenshotResponse::new(&request, artifact, elapsed)).into_response(),
        OutputMode::Image => image_response(&artifact, elapsed),
    };
    Ok(response)
}

fn image_response(artifact: &ArtifactResult, elapsed: Duration) -> Response {
    let mut response = Response::new(Body::from(artifact.data.clone()));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(artifact.fingerprint.format().content_type()),
    );
    headers.insert(
        "x-cache",
        HeaderValue::from_static(if artifact.cached { "HIT" } else { "MISS" }),
    );
    if let Ok(value) = HeaderValue::from_str(&format!("{}ms", elapsed.as_millis())) {
        headers.insert("x-response-time", value);
    }
    response
}

fn failure(state: &AppState, error: ScreenshotError) -> Response {
    match &error {
        ScreenshotError::Blocked(_) => state.stats.record(Stat::Blocked),
        ScreenshotError::RateLimited(_) => state.stats.record(Stat::RateLimited),
        _ => {}
    }
    state.stats.record(Stat::Error);

    if error.is_client_error() {
        debug!("Request rejected: {}", error);
    } else {
        warn!("Request failed: {}", error);
    }
    error.into_response()
}

pub async fn batch(State(state): State<AppState>, client: ClientId, body: Bytes) -> Response {
    state.stats.record(Stat::Request);

    let result: Result<BatchReport, ScreenshotError> = async {
        let request: BatchRequest = serde_json::from_slice(&body)
            .map_err(|e| ScreenshotError::InvalidInput(format!("malformed JSON body: {}", e)))?;
        state.rate_limiter.check(&client.0)?;
        state.batch.process(request.urls).await
    }
    .await;

    match result {
        Ok(report) => Json(report).into_response(),
        Err(e) => failure(&state, e),
    }
}

pub async fn stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ScreenshotError> {
    let storage = state.store.usage().await?;

    Ok(Json(StatsResponse {
        usage: state.stats.snapshot(),
        storage_human: format_bytes(storage.bytes),
        storage,
        tracked_clients: state.rate_limiter.tracked_clients(),
        in_flight_captures: state.coordinator.in_flight_count().await,
    }))
}

pub async fn health(State(state): State<AppState>) -> Response {
    let report = state.health.check().await;
    let status = match report.status {
        HealthLevel::Critical => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status, Json(report)).into_response()
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => ScreenshotError::NotFound("metrics exporter is disabled".to_string()).into_response(),
    }
}

/// Serve a cached artifact by filename; anything not shaped like a fingerprint is a 404
pub async fn image(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, ScreenshotError> {
    let fingerprint = Fingerprint::from_filename(&filename)
        .ok_or_else(|| ScreenshotError::NotFound(filename.clone()))?;
    let data = state.store.read(&fingerprint).await?;

    Ok((
        [(header::CONTENT_TYPE, fingerprint.format().content_type())],
        data,
    )
        .into_response())
}

pub async fn method_not_allowed() -> ScreenshotError {
    ScreenshotError::MethodNotAllowed
}

pub async fn not_found(uri: Uri) -> ScreenshotError {
    ScreenshotError::NotFound(uri.path().to_string())
}

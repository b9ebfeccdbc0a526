//! Page rendering abstraction
//!
//! The coordinator only talks to [`PageRenderer`]; the Chromium-backed
//! implementation lives in `browser_pool`.

use crate::{CaptureRequest, ScreenshotError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Everything a renderer needs to produce one raw capture
#[derive(Debug, Clone, PartialEq)]
pub struct RenderJob {
    pub url: Url,
    pub width: u32,
    pub height: u32,
    pub dark_mode: bool,
    pub full_page: bool,
    pub delay: Duration,
    pub wait_for: Option<String>,
    pub selector_timeout: Duration,
    pub user_agent: Option<String>,
    pub extract_metadata: bool,
}

impl RenderJob {
    pub fn from_request(request: &CaptureRequest, selector_timeout: Duration) -> Self {
        Self {
            url: request.url.clone(),
            width: request.width,
            height: request.height,
            dark_mode: request.dark_mode,
            full_page: request.full_page,
            delay: request.delay,
            wait_for: request.wait_for.clone(),
            selector_timeout,
            user_agent: request.user_agent.clone(),
            extract_metadata: request.extract_metadata,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub canonical_url: Option<String>,
}

/// Raw capture output
#[derive(Debug, Clone)]
pub struct RenderedPage {
    /// PNG-encoded screenshot at full resolution
    pub image: Vec<u8>,
    pub metadata: Option<PageMetadata>,
    /// `None` when no selector was requested
    pub selector_found: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RendererHealth {
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub busy_instances: usize,
    pub failed_instances: usize,
    pub total_renders: usize,
}

#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render(&self, job: &RenderJob) -> Result<RenderedPage, ScreenshotError>;

    async fn health(&self) -> RendererHealth;

    async fn shutdown(&self) {}
}

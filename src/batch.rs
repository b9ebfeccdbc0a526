//! Multi-URL capture with default parameters

use crate::{
    CaptureCoordinator, CaptureRequest, SafetyGate, ScreenshotError, Stat,
};
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

pub const MAX_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    pub url: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchItem {
    fn failed(url: String, error: &ScreenshotError) -> Self {
        Self {
            url,
            success: false,
            filename: None,
            cached: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<BatchItem>,
}

pub struct BatchProcessor {
    coordinator: CaptureCoordinator,
    gate: SafetyGate,
}

impl BatchProcessor {
    pub fn new(coordinator: CaptureCoordinator, gate: SafetyGate) -> Self {
        Self { coordinator, gate }
    }

    /// Size is checked up front; after that each URL succeeds or fails on its own
    pub async fn process(&self, urls: Vec<String>) -> Result<BatchReport, ScreenshotError> {
        if urls.is_empty() {
            return Err(ScreenshotError::InvalidInput(
                "urls must contain at least one entry".to_string(),
            ));
        }
        if urls.len() > MAX_BATCH_SIZE {
            return Err(ScreenshotError::InvalidInput(format!(
                "batch accepts at most {} urls, got {}",
                MAX_BATCH_SIZE,
                urls.len()
            )));
        }

        let results = join_all(urls.into_iter().map(|url| self.capture_one(url))).await;

        let succeeded = results.iter().filter(|item| item.success).count();
        let report = BatchReport {
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            results,
        };
        info!(
            "Batch finished: {}/{} succeeded",
            report.succeeded, report.total
        );
        Ok(report)
    }

    async fn capture_one(&self, url: String) -> BatchItem {
        let stats = self.coordinator.stats();

        let target = match self.gate.evaluate(&url) {
            Ok(target) => target,
            Err(e) => {
                if matches!(e, ScreenshotError::Blocked(_)) {
                    stats.record(Stat::Blocked);
                }
                stats.record(Stat::Error);
                warn!("Batch entry {} rejected: {}", url, e);
                return BatchItem::failed(url, &e);
            }
        };

        match self
            .coordinator
            .resolve(&CaptureRequest::with_defaults(target))
            .await
        {
            Ok(artifact) => BatchItem {
                url,
                success: true,
                filename: Some(artifact.filename()),
                cached: Some(artifact.cached),
                error: None,
            },
            Err(e) => {
                stats.record(Stat::Error);
                warn!("Batch entry {} failed: {}", url, e);
                BatchItem::failed(url, &e)
            }
        }
    }
}

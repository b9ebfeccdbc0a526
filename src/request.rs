//! Request types for the screenshot API
//!
//! `ScreenshotParams` is the loosely-typed shape accepted from query strings
//! and JSON bodies. `CaptureRequest` is the validated, immutable form that
//! flows through the gate, the fingerprinter and the capture coordinator.

use crate::{validate_params, OutputFormat, SafetyGate, ScreenshotError};
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use url::Url;

pub const DEFAULT_WIDTH: u32 = 1200;
pub const DEFAULT_HEIGHT: u32 = 630;
pub const DEFAULT_QUALITY: u8 = 80;

/// Raw screenshot parameters as sent by clients
///
/// Numbers and flags are accepted either as JSON values or as strings, since
/// the same struct backs both `GET` query strings and `POST` bodies.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScreenshotParams {
    pub url: Option<String>,
    #[serde(deserialize_with = "loose_int")]
    pub width: Option<i64>,
    #[serde(deserialize_with = "loose_int")]
    pub height: Option<i64>,
    pub format: Option<String>,
    #[serde(deserialize_with = "loose_int")]
    pub quality: Option<i64>,
    #[serde(deserialize_with = "loose_flag")]
    pub full_page: bool,
    #[serde(deserialize_with = "loose_flag")]
    pub dark_mode: bool,
    #[serde(deserialize_with = "loose_int")]
    pub delay: Option<i64>,
    pub wait_for: Option<String>,
    pub user_agent: Option<String>,
    #[serde(deserialize_with = "loose_int")]
    pub crop_x: Option<i64>,
    #[serde(deserialize_with = "loose_int")]
    pub crop_y: Option<i64>,
    #[serde(deserialize_with = "loose_int")]
    pub crop_width: Option<i64>,
    #[serde(deserialize_with = "loose_int")]
    pub crop_height: Option<i64>,
    pub cache: Option<String>,
    #[serde(deserialize_with = "loose_flag")]
    pub upload: bool,
    #[serde(deserialize_with = "loose_flag")]
    pub metadata: bool,
    pub output: Option<String>,
}

impl ScreenshotParams {
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    /// Run the safety gate and parameter validation, producing a capture request
    pub fn into_request(self, gate: &SafetyGate) -> Result<(CaptureRequest, OutputMode), ScreenshotError> {
        let raw_url = self
            .url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ScreenshotError::InvalidInput("url parameter is required".to_string()))?;

        let url = gate.evaluate(raw_url)?;
        let validated = validate_params(&self)?;

        let output = match self.output.as_deref() {
            None | Some("") | Some("image") => OutputMode::Image,
            Some("json") => OutputMode::Json,
            Some(other) => {
                return Err(ScreenshotError::InvalidInput(format!(
                    "output must be 'image' or 'json', got '{}'",
                    other
                )))
            }
        };

        let request = CaptureRequest {
            url,
            width: validated.width,
            height: validated.height,
            format: validated.format,
            quality: validated.quality,
            full_page: self.full_page,
            dark_mode: self.dark_mode,
            delay: validated.delay,
            wait_for: self.wait_for.filter(|s| !s.trim().is_empty()),
            user_agent: self.user_agent.filter(|s| !s.trim().is_empty()),
            crop: validated.crop,
            cache: validated.cache,
            upload: self.upload,
            extract_metadata: self.metadata,
        };

        Ok((request, output))
    }
}

/// How a response should be shaped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Image,
    Json,
}

/// How the cache participates in a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheDirective {
    /// Serve from cache when present, capture otherwise
    #[default]
    Default,
    /// Always capture and overwrite the cached entry
    Refresh,
    /// Serve from cache or fail; never capture
    Only,
}

impl CacheDirective {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "default" => Some(Self::Default),
            "refresh" => Some(Self::Refresh),
            "only" => Some(Self::Only),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// A validated screenshot request
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    pub url: Url,
    pub width: u32,
    pub height: u32,
    pub format: OutputFormat,
    pub quality: u8,
    pub full_page: bool,
    pub dark_mode: bool,
    pub delay: Duration,
    pub wait_for: Option<String>,
    pub user_agent: Option<String>,
    pub crop: Option<CropRect>,
    pub cache: CacheDirective,
    pub upload: bool,
    pub extract_metadata: bool,
}

impl CaptureRequest {
    /// A request with service defaults, as used by batch capture
    pub fn with_defaults(url: Url) -> Self {
        Self {
            url,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            format: OutputFormat::default(),
            quality: DEFAULT_QUALITY,
            full_page: false,
            dark_mode: false,
            delay: Duration::ZERO,
            wait_for: None,
            user_agent: None,
            crop: None,
            cache: CacheDirective::Default,
            upload: false,
            extract_metadata: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BatchRequest {
    #[serde(default)]
    pub urls: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Loose {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

fn loose_int<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Option::<Loose>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Loose::Int(n)) => Ok(Some(n)),
        Some(Loose::Float(f)) if f.fract() == 0.0 => Ok(Some(f as i64)),
        Some(Loose::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(Loose::Text(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("expected an integer, got '{}'", s))),
        Some(_) => Err(D::Error::custom("expected an integer")),
    }
}

fn loose_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Option::<Loose>::deserialize(deserializer)? {
        None => Ok(false),
        Some(Loose::Bool(b)) => Ok(b),
        Some(Loose::Int(n)) => Ok(n != 0),
        Some(Loose::Text(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" | "" => Ok(false),
            _ => Err(D::Error::custom(format!("expected a boolean, got '{}'", s))),
        },
        Some(Loose::Float(_)) => Err(D::Error::custom("expected a boolean")),
    }
}

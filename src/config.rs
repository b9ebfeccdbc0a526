//! Configuration management with serde serialization/deserialization
//!
//! This module provides all configuration structures for the screenshot API,
//! including server binding, browser pool settings, cache and retention policy,
//! rate limiting and optional object storage upload.

use crate::ScreenshotError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for the screenshot API
///
/// Every section falls back to its defaults when omitted from the JSON file,
/// so a config file only needs to mention the values it changes.
///
/// # Examples
///
/// ```rust
/// use screenshot_api::Config;
///
/// let config = Config::default();
/// assert_eq!(config.server.port, 3000);
///
/// let config: Config = serde_json::from_str(r#"{"server": {"port": 8080}}"#).unwrap();
/// assert_eq!(config.server.port, 8080);
/// assert!(config.rate_limit.enabled);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// HTTP listener settings
    pub server: ServerConfig,

    /// Browser pool and rendering settings
    pub browser: BrowserSettings,

    /// Where rendered artifacts are stored
    pub cache: CacheConfig,

    /// Age and size bounds for the cache directory
    pub retention: RetentionConfig,

    /// Per-client request admission policy
    pub rate_limit: RateLimitConfig,

    /// Optional remote upload target. Uploads are skipped when absent.
    pub upload: Option<UploadConfig>,

    /// Maximum number of captures running at once across distinct pages (default: CPU count)
    ///
    /// Identical requests share a single capture and do not count twice.
    pub max_concurrent_renders: usize,

    /// Install the Prometheus recorder and expose `/metrics` (default: true)
    pub metrics_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            browser: BrowserSettings::default(),
            cache: CacheConfig::default(),
            retention: RetentionConfig::default(),
            rate_limit: RateLimitConfig::default(),
            upload: None,
            max_concurrent_renders: num_cpus::get().max(1),
            metrics_enabled: true,
        }
    }
}

impl Config {
    /// Load a configuration file, applying defaults for missing sections
    pub async fn from_file(path: &Path) -> Result<Self, ScreenshotError> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            ScreenshotError::ConfigurationError(format!("{}: {}", path.display(), e))
        })?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ScreenshotError> {
        if self.browser.pool_size == 0 {
            return Err(ScreenshotError::ConfigurationError(
                "Browser pool size must be greater than 0".to_string(),
            ));
        }

        if self.max_concurrent_renders == 0 {
            return Err(ScreenshotError::ConfigurationError(
                "Max concurrent renders must be greater than 0".to_string(),
            ));
        }

        if self.browser.render_timeout_secs == 0 {
            return Err(ScreenshotError::ConfigurationError(
                "Render timeout must be greater than 0".to_string(),
            ));
        }

        if self.server.request_timeout_secs < self.browser.render_timeout_secs {
            return Err(ScreenshotError::ConfigurationError(
                "Request timeout must not be shorter than the render timeout".to_string(),
            ));
        }

        if self.rate_limit.enabled && (self.rate_limit.max_requests == 0 || self.rate_limit.window_secs == 0) {
            return Err(ScreenshotError::ConfigurationError(
                "Rate limit needs a non-zero request budget and window".to_string(),
            ));
        }

        if self.rate_limit.max_clients == 0 {
            return Err(ScreenshotError::ConfigurationError(
                "Rate limit client table must hold at least one client".to_string(),
            ));
        }

        if self.retention.enabled && self.retention.interval_secs == 0 {
            return Err(ScreenshotError::ConfigurationError(
                "Retention interval must be greater than 0".to_string(),
            ));
        }

        if let Some(upload) = &self.upload {
            if upload.bucket.trim().is_empty() {
                return Err(ScreenshotError::ConfigurationError(
                    "Upload bucket must not be empty".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    pub bind: String,

    /// Listen port (default: 3000)
    pub port: u16,

    /// Upper bound on the whole request path in seconds (default: 255)
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 3000,
            request_timeout_secs: 255,
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Browser pool and rendering settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrowserSettings {
    /// Number of Chrome browser instances to keep alive (default: 2)
    ///
    /// Each instance costs a few hundred MB of memory.
    pub pool_size: usize,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Extra command-line flags appended to the defaults
    pub extra_args: Vec<String>,

    /// Render timeout in seconds, covering navigation through capture (default: 30)
    pub render_timeout_secs: u64,

    /// How long to wait for `waitFor` selectors in milliseconds (default: 10000)
    ///
    /// A selector that never appears is not an error; the capture proceeds.
    pub selector_timeout_ms: u64,

    /// Window size used when launching browsers
    pub window_width: u32,
    pub window_height: u32,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            pool_size: 2,
            chrome_path: None,
            extra_args: Vec::new(),
            render_timeout_secs: 30,
            selector_timeout_ms: 10_000,
            window_width: 1920,
            window_height: 1080,
        }
    }
}

impl BrowserSettings {
    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render_timeout_secs)
    }

    pub fn selector_timeout(&self) -> Duration {
        Duration::from_millis(self.selector_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding `<fingerprint>.<ext>` files (default: ./screenshots)
    pub directory: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("screenshots"),
        }
    }
}

/// Retention policy for the cache directory
///
/// An entry is deleted when it is older than `max_age_secs`, or when it is
/// among the oldest entries that keep the directory above `max_storage_bytes`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub enabled: bool,

    /// Maximum age of a cache entry in seconds (default: 7 days)
    pub max_age_secs: u64,

    /// Storage budget for the whole cache directory (default: 1GB)
    pub max_storage_bytes: u64,

    /// Seconds between sweeps (default: 1 hour)
    pub interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_age_secs: 7 * 24 * 60 * 60,
            max_storage_bytes: 1024 * 1024 * 1024,
            interval_secs: 60 * 60,
        }
    }
}

impl RetentionConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// When false every request is admitted
    pub enabled: bool,

    /// Requests admitted per client per window (default: 100)
    pub max_requests: u32,

    /// Window length in seconds (default: 1 hour)
    pub window_secs: u64,

    /// Upper bound on tracked clients (default: 10000)
    pub max_clients: usize,

    /// Key clients on `X-Forwarded-For`/`X-Real-IP` instead of the peer
    /// address. Only safe behind a proxy that overwrites those headers.
    pub trust_forwarded_headers: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 100,
            window_secs: 60 * 60,
            max_clients: 10_000,
            trust_forwarded_headers: false,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// S3-compatible upload target
///
/// Credentials come from the standard AWS environment chain.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploadConfig {
    pub bucket: String,

    #[serde(default = "default_region")]
    pub region: String,

    /// Custom endpoint for S3-compatible stores; enables path-style addressing
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Key prefix, e.g. `screenshots/`
    #[serde(default)]
    pub prefix: String,

    /// Base used to build public URLs; defaults to the virtual-hosted S3 URL
    #[serde(default)]
    pub public_base_url: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// Supported output image formats
///
/// - WebP: small files, the default
/// - PNG: lossless, largest files
/// - JPEG: lossy, honours the quality setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Webp,
    Png,
    Jpeg,
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::Webp
    }
}

impl OutputFormat {
    /// Parse a user-supplied format name. `jpg` is an alias for `jpeg`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "webp" => Some(Self::Webp),
            "png" => Some(Self::Png),
            "jpeg" | "jpg" => Some(Self::Jpeg),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webp => "webp",
            Self::Png => "png",
            Self::Jpeg => "jpeg",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Webp => "webp",
            Self::Png => "png",
            Self::Jpeg => "jpg",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "webp" => Some(Self::Webp),
            "png" => Some(Self::Png),
            "jpg" => Some(Self::Jpeg),
            _ => None,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Webp => "image/webp",
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generate Chrome arguments with a unique instance ID for browser pool isolation
///
/// Each pool member gets its own temp directory so concurrent launches do not
/// trip over Chrome's process singleton.
pub fn get_chrome_args_with_instance_id(
    settings: &BrowserSettings,
    instance_id: Option<usize>,
) -> Vec<String> {
    let unique_id = instance_id_suffix(instance_id);

    let mut args = vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-features=TranslateUI,ProcessSingleton".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--hide-scrollbars".to_string(),
        "--mute-audio".to_string(),
        format!(
            "--window-size={},{}",
            settings.window_width, settings.window_height
        ),
        format!("--temp-dir=/tmp/chromium-temp-{}", unique_id),
    ];

    args.extend(settings.extra_args.iter().cloned());
    args
}

pub fn user_data_dir_for(instance_id: Option<usize>) -> PathBuf {
    PathBuf::from(format!(
        "/tmp/chromium-screenshot-{}",
        instance_id_suffix(instance_id)
    ))
}

fn instance_id_suffix(instance_id: Option<usize>) -> String {
    match instance_id {
        Some(id) => format!("{}-{}", std::process::id(), id),
        None => format!("{}-{}", std::process::id(), uuid::Uuid::new_v4()),
    }
}

pub fn create_browser_config_with_instance_id(
    settings: &BrowserSettings,
    instance_id: Option<usize>,
) -> Result<chromiumoxide::browser::BrowserConfig, ScreenshotError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .window_size(settings.window_width, settings.window_height)
        .user_data_dir(user_data_dir_for(instance_id))
        .request_timeout(settings.render_timeout())
        .args(get_chrome_args_with_instance_id(settings, instance_id));

    if let Some(chrome_path) = &settings.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(ScreenshotError::BrowserLaunchFailed)
}

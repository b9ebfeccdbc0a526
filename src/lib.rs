//! # Screenshot API
//!
//! An HTTP service that renders web pages to images with headless Chrome and
//! keeps the results in a content-addressed cache on disk.
//!
//! ## Request Pipeline
//!
//! Every capture request passes the same stages, in order:
//!
//! 1. **Safety gate** ([`SafetyGate`]): only public `http`/`https` targets are
//!    allowed. Loopback, private, link-local and metadata addresses, blocked
//!    ports, embedded credentials and encoded script schemes are rejected.
//! 2. **Parameter validation** ([`validate_params`]): viewport, quality, delay,
//!    format, crop and cache directive.
//! 3. **Rate limiting** ([`RateLimiter`]): fixed windows per client.
//! 4. **Resolution** ([`CaptureCoordinator`]): the request's [`Fingerprint`]
//!    selects a cache entry; on a miss a single capture runs per fingerprint and
//!    concurrent requests for the same fingerprint share its result.
//!
//! Cached artifacts are evicted by age and storage budget by the
//! [`RetentionManager`].
//!
//! ## Cache Key
//!
//! The fingerprint covers URL, viewport size, dark mode, format and full-page
//! mode. Quality, crop, delay, user agent and selector waits are deliberately
//! not part of it, so a cache hit may have been captured with different values
//! for those.
//!
//! ## HTTP Endpoints
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | GET, POST | `/api/screenshot` | Capture or fetch one URL |
//! | POST | `/api/batch` | Up to 10 URLs with default parameters |
//! | GET | `/images/{filename}` | Raw cached artifact |
//! | GET | `/stats` | Usage counters and storage usage |
//! | GET | `/health` | Browser pool and storage summary |
//! | GET | `/metrics` | Prometheus exposition |
//!
//! ## CLI Usage
//!
//! ```bash
//! screenshot-api serve --port 3000
//! screenshot-api capture --url https://example.com --output example.webp
//! screenshot-api sweep --config config.json
//! ```

/// Configuration and settings for the service
pub mod config;

/// Error types and their HTTP mapping
pub mod error;

/// Client-facing request parameters and validated capture requests
pub mod request;

/// URL policy and parameter validation
pub mod security;

/// Deterministic cache keys
pub mod fingerprint;

/// Per-client fixed-window rate limiting
pub mod rate_limit;

/// Directory-backed artifact cache
pub mod cache_store;

/// Page rendering abstraction
pub mod renderer;

/// Browser pool management and the Chromium renderer
pub mod browser_pool;

/// Image format conversion and cropping
pub mod encoder;

/// Optional S3 upload of artifacts
pub mod upload;

/// Cache resolution with single-flight captures
pub mod coordinator;

/// Age and storage-budget eviction
pub mod retention;

/// Multi-URL capture
pub mod batch;

/// Usage counters and Prometheus export
pub mod metrics;

/// Health reporting for the browser pool and cache
pub mod health;

/// HTTP routing, state and listener
pub mod server;

/// HTTP request handlers
pub mod handlers;

/// Command-line interface implementation
pub mod cli;

/// Formatting helpers
pub mod utils;

#[cfg(test)]
mod test_support;


pub use batch::*;
pub use browser_pool::*;
pub use cache_store::*;
pub use cli::*;
pub use config::*;
pub use coordinator::*;
pub use encoder::*;
pub use error::*;
pub use fingerprint::*;
pub use health::*;
pub use self::metrics::*;
pub use rate_limit::*;
pub use renderer::*;
pub use request::*;
pub use retention::*;
pub use security::*;
pub use server::*;
pub use upload::*;
pub use utils::*;

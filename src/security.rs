//! Outbound request safety checks
//!
//! Every URL is evaluated here before any rate-limit accounting, cache lookup
//! or browser work happens. The gate is purely syntactic: it never resolves
//! DNS, so the host checks apply to literal hosts and well-known names.

use crate::{
    CacheDirective, CropRect, OutputFormat, ScreenshotError, ScreenshotParams, DEFAULT_HEIGHT,
    DEFAULT_QUALITY, DEFAULT_WIDTH,
};
use regex::Regex;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::LazyLock;
use std::time::Duration;
use url::{Host, Url};

pub const MAX_URL_LENGTH: usize = 2048;
pub const MAX_HOSTNAME_LENGTH: usize = 253;

pub const MIN_WIDTH: i64 = 320;
pub const MAX_WIDTH: i64 = 3840;
pub const MIN_HEIGHT: i64 = 240;
pub const MAX_HEIGHT: i64 = 2160;
pub const MAX_DELAY_MS: i64 = 10_000;

/// Ports of well-known internal services
const BLOCKED_PORTS: &[u16] = &[
    22, 23, 25, 110, 139, 143, 445, 465, 587, 993, 995, 1433, 1521, 2375, 2376, 3306, 3389,
    5432, 5900, 6379, 9200, 11211, 27017,
];

const BLOCKED_HOSTNAMES: &[&str] = &["localhost", "metadata.google.internal"];

static SUSPICIOUS_SCHEME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(javascript|vbscript|data|file|about|blob|gopher|dict|ldap|jar)\s*:")
        .expect("suspicious scheme pattern compiles")
});

const TRAVERSAL_MARKERS: &[&str] = &["..", "%2e%2e", "%2e.", ".%2e", "%252e"];

/// Validates target URLs against the outbound request policy
///
/// Checks run in a fixed order and stop at the first failure:
/// scheme, host, port, credentials, embedded schemes, path traversal, length.
///
/// # Examples
///
/// ```rust
/// use screenshot_api::SafetyGate;
///
/// let gate = SafetyGate::new();
/// assert!(gate.evaluate("https://example.com/").is_ok());
/// assert!(gate.evaluate("http://127.0.0.1/admin").is_err());
/// ```
#[derive(Debug, Clone)]
pub struct SafetyGate {
    blocked_ports: HashSet<u16>,
}

impl Default for SafetyGate {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyGate {
    pub fn new() -> Self {
        Self {
            blocked_ports: BLOCKED_PORTS.iter().copied().collect(),
        }
    }

    /// Returns the normalised URL when allowed
    ///
    /// Unparseable input is an `InvalidInput`; every policy rejection is `Blocked`.
    pub fn evaluate(&self, raw: &str) -> Result<Url, ScreenshotError> {
        let raw = raw.trim();
        let url = Url::parse(raw)
            .map_err(|e| ScreenshotError::InvalidInput(format!("Invalid URL: {}", e)))?;

        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(ScreenshotError::Blocked(format!(
                    "scheme '{}' is not allowed",
                    other
                )))
            }
        }

        let host = url
            .host()
            .ok_or_else(|| ScreenshotError::InvalidInput("URL has no host".to_string()))?;
        if let Some(reason) = blocked_host_reason(&host) {
            return Err(ScreenshotError::Blocked(reason));
        }

        if let Some(port) = url.port() {
            if self.blocked_ports.contains(&port) {
                return Err(ScreenshotError::Blocked(format!("port {} is not allowed", port)));
            }
        }

        if !url.username().is_empty() || url.password().is_some() {
            return Err(ScreenshotError::Blocked(
                "credentials in URLs are not allowed".to_string(),
            ));
        }

        if contains_suspicious_scheme(raw) {
            return Err(ScreenshotError::Blocked(
                "URL contains an embedded script or local scheme".to_string(),
            ));
        }

        if has_path_traversal(raw) {
            return Err(ScreenshotError::Blocked(
                "path traversal sequences are not allowed".to_string(),
            ));
        }

        if raw.len() > MAX_URL_LENGTH {
            return Err(ScreenshotError::Blocked(format!(
                "URL exceeds {} characters",
                MAX_URL_LENGTH
            )));
        }

        if url.host_str().map(str::len).unwrap_or(0) > MAX_HOSTNAME_LENGTH {
            return Err(ScreenshotError::Blocked(format!(
                "hostname exceeds {} characters",
                MAX_HOSTNAME_LENGTH
            )));
        }

        Ok(url)
    }
}

fn blocked_host_reason(host: &Host<&str>) -> Option<String> {
    match host {
        Host::Domain(domain) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            let blocked = BLOCKED_HOSTNAMES.contains(&domain.as_str())
                || domain.ends_with(".localhost");
            blocked.then(|| format!("host '{}' is not allowed", domain))
        }
        Host::Ipv4(ip) => is_private_ip(IpAddr::V4(*ip))
            .then(|| format!("address {} is private or reserved", ip)),
        Host::Ipv6(ip) => is_private_ip(IpAddr::V6(*ip))
            .then(|| format!("address {} is private or reserved", ip)),
    }
}

pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => is_private_ipv4(ipv4),
        IpAddr::V6(ipv6) => is_private_ipv6(ipv6),
    }
}

fn is_private_ipv4(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    // 0.0.0.0/8
    octets[0] == 0
        // 10.0.0.0/8
        || octets[0] == 10
        // 172.16.0.0/12
        || (octets[0] == 172 && (16..=31).contains(&octets[1]))
        // 192.168.0.0/16
        || (octets[0] == 192 && octets[1] == 168)
        || ip.is_loopback()
        // 169.254.0.0/16, includes the cloud metadata address
        || ip.is_link_local()
}

fn is_private_ipv6(ip: Ipv6Addr) -> bool {
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return is_private_ipv4(mapped);
    }

    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // fc00::/7
        || (first & 0xfe00) == 0xfc00
        // fe80::/10
        || (first & 0xffc0) == 0xfe80
}

/// Checks the raw string and up to two rounds of percent-decoding
fn contains_suspicious_scheme(raw: &str) -> bool {
    if SUSPICIOUS_SCHEME.is_match(raw) {
        return true;
    }

    let once = match urlencoding::decode(raw) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => return false,
    };
    if SUSPICIOUS_SCHEME.is_match(&once) {
        return true;
    }

    match urlencoding::decode(&once) {
        Ok(twice) => SUSPICIOUS_SCHEME.is_match(&twice),
        Err(_) => false,
    }
}

/// Inspects the path as written, before URL normalisation removes dot segments
fn has_path_traversal(raw: &str) -> bool {
    let after_scheme = match raw.find("://") {
        Some(idx) => &raw[idx + 3..],
        None => raw,
    };
    // The authority ends at the first of '/', '?' or '#'; only a '/' starts a path
    let path = match after_scheme.find(['/', '?', '#']) {
        Some(idx) if after_scheme[idx..].starts_with('/') => &after_scheme[idx..],
        _ => return false,
    };
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let lowered = path.to_ascii_lowercase();

    TRAVERSAL_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Numeric and enumerated parameters after validation
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedParams {
    pub width: u32,
    pub height: u32,
    pub format: OutputFormat,
    pub quality: u8,
    pub delay: Duration,
    pub crop: Option<CropRect>,
    pub cache: CacheDirective,
}

/// Bounds-check everything in a request except the URL
pub fn validate_params(params: &ScreenshotParams) -> Result<ValidatedParams, ScreenshotError> {
    let width = bounded("width", params.width, DEFAULT_WIDTH as i64, MIN_WIDTH, MAX_WIDTH)?;
    let height = bounded("height", params.height, DEFAULT_HEIGHT as i64, MIN_HEIGHT, MAX_HEIGHT)?;
    let delay = bounded("delay", params.delay, 0, 0, MAX_DELAY_MS)?;
    let quality = bounded("quality", params.quality, DEFAULT_QUALITY as i64, 1, 100)?;

    let format = match params.format.as_deref().map(str::trim) {
        None | Some("") => OutputFormat::default(),
        Some(value) => OutputFormat::parse(value).ok_or_else(|| {
            ScreenshotError::InvalidInput(format!(
                "format must be one of webp, png, jpeg, jpg; got '{}'",
                value
            ))
        })?,
    };

    let cache = match params.cache.as_deref() {
        None => CacheDirective::Default,
        Some(value) => CacheDirective::parse(value).ok_or_else(|| {
            ScreenshotError::InvalidInput(format!(
                "cache must be one of default, refresh, only; got '{}'",
                value
            ))
        })?,
    };

    Ok(ValidatedParams {
        width: width as u32,
        height: height as u32,
        format,
        quality: quality as u8,
        delay: Duration::from_millis(delay as u64),
        crop: validate_crop(params)?,
        cache,
    })
}

fn bounded(name: &str, value: Option<i64>, default: i64, min: i64, max: i64) -> Result<i64, ScreenshotError> {
    let value = value.unwrap_or(default);
    if value < min || value > max {
        return Err(ScreenshotError::InvalidInput(format!(
            "{} must be between {} and {}, got {}",
            name, min, max, value
        )));
    }
    Ok(value)
}

fn validate_crop(params: &ScreenshotParams) -> Result<Option<CropRect>, ScreenshotError> {
    let fields = [params.crop_x, params.crop_y, params.crop_width, params.crop_height];
    if fields.iter().all(Option::is_none) {
        return Ok(None);
    }

    let [Some(x), Some(y), Some(width), Some(height)] = fields else {
        return Err(ScreenshotError::InvalidInput(
            "cropX, cropY, cropWidth and cropHeight must be given together".to_string(),
        ));
    };

    let limit = u32::MAX as i64;
    if x < 0 || y < 0 || x > limit || y > limit {
        return Err(ScreenshotError::InvalidInput(
            "crop offsets must not be negative".to_string(),
        ));
    }
    if width <= 0 || height <= 0 || width > limit || height > limit {
        return Err(ScreenshotError::InvalidInput(
            "crop width and height must be positive".to_string(),
        ));
    }

    Ok(Some(CropRect {
        x: x as u32,
        y: y as u32,
        width: width as u32,
        height: height as u32,
    }))
}

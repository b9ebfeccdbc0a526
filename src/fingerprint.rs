//! Content-addressed cache keys
//!
//! A fingerprint covers exactly the inputs that change which page is rendered
//! and how it is laid out: URL, viewport size, colour scheme, format and
//! full-page mode. Quality, delay, wait selector, user agent and crop are left
//! out, so requests differing only in those share one cached artifact.

use crate::{CaptureRequest, OutputFormat};
use sha2::{Digest, Sha256};
use std::fmt;

const DIGEST_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    digest: String,
    format: OutputFormat,
}

impl Fingerprint {
    pub fn of(request: &CaptureRequest) -> Self {
        Self::compute(
            request.url.as_str(),
            request.width,
            request.height,
            request.dark_mode,
            request.format,
            request.full_page,
        )
    }

    pub fn compute(
        url: &str,
        width: u32,
        height: u32,
        dark_mode: bool,
        format: OutputFormat,
        full_page: bool,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        hasher.update(b"\n");
        hasher.update(width.to_string().as_bytes());
        hasher.update(b"\n");
        hasher.update(height.to_string().as_bytes());
        hasher.update(b"\n");
        hasher.update(if dark_mode { b"dark" as &[u8] } else { b"light" });
        hasher.update(b"\n");
        hasher.update(format.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(if full_page { b"full" as &[u8] } else { b"viewport" });

        Self {
            digest: format!("{:x}", hasher.finalize()),
            format,
        }
    }

    /// Parse a storage filename of the form `<64 hex chars>.<ext>`
    ///
    /// Anything else, including path separators, yields `None`.
    pub fn from_filename(name: &str) -> Option<Self> {
        let (digest, ext) = name.split_once('.')?;
        let format = OutputFormat::from_extension(ext)?;

        let valid = digest.len() == DIGEST_LEN
            && digest
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self {
            digest: digest.to_string(),
            format,
        })
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn filename(&self) -> String {
        format!("{}.{}", self.digest, self.format.extension())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.digest)
    }
}

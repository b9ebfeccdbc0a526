//! Directory-backed artifact cache
//!
//! One file per fingerprint, named `<digest>.<ext>`, with no index. Writes go
//! to a uniquely named temp file in the same directory and are renamed into
//! place, so readers never observe a partially written artifact.

use crate::{Fingerprint, ScreenshotError};
use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntryMeta {
    pub fingerprint: Fingerprint,
    pub size: u64,
    pub modified: SystemTime,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageUsage {
    pub files: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

enum ScanState {
    Start(PathBuf),
    Reading(fs::ReadDir),
    Done,
}

impl CacheStore {
    /// Open the cache directory, creating it if needed
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, ScreenshotError> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(|e| {
            ScreenshotError::StorageError(format!("cannot create {}: {}", root.display(), e))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &Fingerprint) -> PathBuf {
        self.root.join(key.filename())
    }

    pub async fn exists(&self, key: &Fingerprint) -> bool {
        match fs::metadata(self.path_for(key)).await {
            Ok(meta) => meta.is_file(),
            Err(_) => false,
        }
    }

    pub async fn read(&self, key: &Fingerprint) -> Result<Bytes, ScreenshotError> {
        match fs::read(self.path_for(key)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(ScreenshotError::NotFound(key.filename()))
            }
            Err(e) => Err(ScreenshotError::StorageError(e.to_string())),
        }
    }

    /// Atomically create or replace the entry for `key`
    pub async fn write(&self, key: &Fingerprint, data: &[u8]) -> Result<(), ScreenshotError> {
        let target = self.path_for(key);
        let temp = self.root.join(format!(
            "{}.{}.tmp",
            key.filename(),
            uuid::Uuid::new_v4().simple()
        ));

        if let Err(e) = write_file(&temp, data).await {
            let _ = fs::remove_file(&temp).await;
            return Err(ScreenshotError::StorageError(format!(
                "writing {}: {}",
                temp.display(),
                e
            )));
        }

        if let Err(e) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(ScreenshotError::StorageError(format!(
                "renaming into {}: {}",
                target.display(),
                e
            )));
        }

        debug!("Cached {} ({} bytes)", key.filename(), data.len());
        Ok(())
    }

    /// Remove an entry. Returns whether a file was actually deleted.
    pub async fn delete(&self, key: &Fingerprint) -> Result<bool, ScreenshotError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ScreenshotError::StorageError(e.to_string())),
        }
    }

    /// Lazily list cache entries
    ///
    /// Temp files and anything not named like a fingerprint are skipped, as are
    /// files that disappear between listing and stat.
    pub fn enumerate(&self) -> impl Stream<Item = Result<CacheEntryMeta, ScreenshotError>> + Send + 'static {
        stream::unfold(ScanState::Start(self.root.clone()), |state| async move {
            let mut dir = match state {
                ScanState::Start(root) => match fs::read_dir(&root).await {
                    Ok(dir) => dir,
                    Err(e) => {
                        return Some((
                            Err(ScreenshotError::StorageError(format!(
                                "listing {}: {}",
                                root.display(),
                                e
                            ))),
                            ScanState::Done,
                        ))
                    }
                },
                ScanState::Reading(dir) => dir,
                ScanState::Done => return None,
            };

            loop {
                let entry = match dir.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => return None,
                    Err(e) => {
                        return Some((
                            Err(ScreenshotError::StorageError(e.to_string())),
                            ScanState::Done,
                        ))
                    }
                };

                let file_name = entry.file_name();
                let Some(fingerprint) = file_name.to_str().and_then(Fingerprint::from_filename)
                else {
                    continue;
                };

                match entry.metadata().await {
                    Ok(meta) if meta.is_file() => {
                        let item = CacheEntryMeta {
                            fingerprint,
                            size: meta.len(),
                            modified: meta.modified().unwrap_or(UNIX_EPOCH),
                        };
                        return Some((Ok(item), ScanState::Reading(dir)));
                    }
                    Ok(_) => continue,
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => {
                        warn!("Failed to stat cache entry {:?}: {}", file_name, e);
                        continue;
                    }
                }
            }
        })
    }

    pub async fn entries(&self) -> Result<Vec<CacheEntryMeta>, ScreenshotError> {
        let mut entries = Vec::new();
        let mut stream = Box::pin(self.enumerate());
        while let Some(entry) = stream.next().await {
            entries.push(entry?);
        }
        Ok(entries)
    }

    pub async fn usage(&self) -> Result<StorageUsage, ScreenshotError> {
        let mut usage = StorageUsage::default();
        let mut stream = Box::pin(self.enumerate());
        while let Some(entry) = stream.next().await {
            let entry = entry?;
            usage.files += 1;
            usage.bytes += entry.size;
        }
        Ok(usage)
    }
}

async fn write_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OutputFormat;

    fn key(url: &str) -> Fingerprint {
        Fingerprint::compute(url, 1200, 630, false, OutputFormat::Png, false)
    }

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).await.unwrap();
        let key = key("https://example.com/");

        assert!(!store.exists(&key).await);
        store.write(&key, b"png-bytes").await.unwrap();
        assert!(store.exists(&key).await);
        assert_eq!(store.read(&key).await.unwrap(), Bytes::from_static(b"png-bytes"));
        assert_eq!(store.path_for(&key), dir.path().join(key.filename()));
    }

    #[tokio::test]
    async fn test_write_replaces_existing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).await.unwrap();
        let key = key("https://example.com/");

        store.write(&key, b"first").await.unwrap();
        store.write(&key, b"second").await.unwrap();

        assert_eq!(store.read(&key).await.unwrap(), Bytes::from_static(b"second"));
        let entries = store.entries().await.unwrap();
        assert_eq!(entries.len(), 1);

        // no temp files left behind
        let mut names = Vec::new();
        let mut dir_entries = fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = dir_entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec![key.filename()]);
    }

    #[tokio::test]
    async fn test_read_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).await.unwrap();

        let err = store.read(&key("https://missing.example/")).await.unwrap_err();
        assert!(matches!(err, ScreenshotError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).await.unwrap();
        let key = key("https://example.com/");

        tokio_test::assert_ok!(store.write(&key, b"data").await);
        assert!(tokio_test::assert_ok!(store.delete(&key).await));
        assert!(!tokio_test::assert_ok!(store.delete(&key).await));
        assert!(!store.exists(&key).await);
    }

    #[tokio::test]
    async fn test_enumerate_skips_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).await.unwrap();

        store.write(&key("https://a.example/"), b"aaaa").await.unwrap();
        store.write(&key("https://b.example/"), b"bb").await.unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignore me").await.unwrap();
        fs::write(
            dir.path().join(format!("{}.tmp", key("https://c.example/").filename())),
            b"partial",
        )
        .await
        .unwrap();
        fs::create_dir(dir.path().join(format!("{}.png", "f".repeat(64))))
            .await
            .unwrap();

        let entries = store.entries().await.unwrap();
        assert_eq!(entries.len(), 2);

        let usage = store.usage().await.unwrap();
        assert_eq!(usage, StorageUsage { files: 2, bytes: 6 });
    }

    #[tokio::test]
    async fn test_open_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let store = CacheStore::open(&nested).await.unwrap();
        assert!(nested.is_dir());
        assert_eq!(store.usage().await.unwrap(), StorageUsage::default());
    }
}

//! File-backed log store.
//!
//! A single append-only file shared by every connection. Records are
//! stored back to back with no framing or index; playback is simply the
//! whole file from the beginning.
//!
//! The store does no locking of its own. The accept loop serves one
//! connection at a time, so there is never more than one writer, and no
//! read-back overlaps a write. Handling connections in parallel would need
//! a mutex around `append` and a consistent snapshot for `read_all`.

use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, trace};

/// Handle to the shared log file
#[derive(Debug)]
pub struct LogStore {
    path: PathBuf,
}

impl LogStore {
    /// Create a store handle. The file itself is created on first append.
    pub fn new(path: impl Into<PathBuf>) -> Arc<Self> {
        let path = path.into();
        info!(path = %path.display(), "Initializing log store");
        Arc::new(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `bytes` verbatim, creating the file if needed.
    ///
    /// Returns once the data is synced, so a following `read_all` sees it.
    pub async fn append(&self, bytes: &[u8]) -> Result<(), StoreError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| StoreError::Open(self.path.clone(), e))?;

        file.write_all(bytes)
            .await
            .map_err(|e| StoreError::Write(self.path.clone(), e))?;
        // tokio's File completes writes in the background; flush waits for them.
        file.flush()
            .await
            .map_err(|e| StoreError::Write(self.path.clone(), e))?;
        file.sync_data()
            .await
            .map_err(|e| StoreError::Write(self.path.clone(), e))?;

        trace!(bytes = bytes.len(), "Appended to log store");
        Ok(())
    }

    /// Read the entire store from the beginning.
    pub async fn read_all(&self) -> Result<Bytes, StoreError> {
        let contents = tokio::fs::read(&self.path)
            .await
            .map_err(|e| StoreError::Read(self.path.clone(), e))?;
        Ok(Bytes::from(contents))
    }

    /// Delete the store.
    ///
    /// Idempotent: returns `Ok(false)` if there was nothing to delete.
    pub async fn remove(&self) -> Result<bool, StoreError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "Removed log store");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Remove(self.path.clone(), e)),
        }
    }
}

/// Log store I/O errors
#[derive(Debug)]
pub enum StoreError {
    Open(PathBuf, io::Error),
    Write(PathBuf, io::Error),
    Read(PathBuf, io::Error),
    Remove(PathBuf, io::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Open(path, e) => {
                write!(f, "Failed to open log store '{}': {}", path.display(), e)
            }
            StoreError::Write(path, e) => {
                write!(f, "Failed to append to log store '{}': {}", path.display(), e)
            }
            StoreError::Read(path, e) => {
                write!(f, "Failed to read log store '{}': {}", path.display(), e)
            }
            StoreError::Remove(path, e) => {
                write!(f, "Failed to remove log store '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Open(_, e)
            | StoreError::Write(_, e)
            | StoreError::Read(_, e)
            | StoreError::Remove(_, e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_append_creates_file() {
        let dir = tempdir().unwrap();
        let store = LogStore::new(dir.path().join("log"));
        assert!(!store.path().exists());

        store.append(b"hello\n").await.unwrap();

        assert!(store.path().exists());
        assert_eq!(&store.read_all().await.unwrap()[..], b"hello\n");
    }

    #[tokio::test]
    async fn test_appends_accumulate_in_order() {
        let dir = tempdir().unwrap();
        let store = LogStore::new(dir.path().join("log"));

        store.append(b"one\n").await.unwrap();
        store.append(b"two\n").await.unwrap();
        store.append(b"three\n").await.unwrap();

        assert_eq!(&store.read_all().await.unwrap()[..], b"one\ntwo\nthree\n");
    }

    #[tokio::test]
    async fn test_existing_file_is_appended_to() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, b"left over\n").unwrap();

        let store = LogStore::new(&path);
        store.append(b"new\n").await.unwrap();

        assert_eq!(&store.read_all().await.unwrap()[..], b"left over\nnew\n");
    }

    #[tokio::test]
    async fn test_arbitrary_bytes_preserved() {
        let dir = tempdir().unwrap();
        let store = LogStore::new(dir.path().join("log"));
        let payload: Vec<u8> = (0u8..=255).chain(std::iter::once(b'\n')).collect();

        store.append(&payload).await.unwrap();

        assert_eq!(&store.read_all().await.unwrap()[..], &payload[..]);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = LogStore::new(dir.path().join("log"));

        assert!(!store.remove().await.unwrap());

        store.append(b"x\n").await.unwrap();
        assert!(store.remove().await.unwrap());
        assert!(!store.path().exists());

        assert!(!store.remove().await.unwrap());
    }

    #[tokio::test]
    async fn test_append_fails_in_missing_directory() {
        let dir = tempdir().unwrap();
        let store = LogStore::new(dir.path().join("missing").join("log"));

        match store.append(b"x\n").await {
            Err(StoreError::Open(path, _)) => assert_eq!(path, store.path()),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_missing_store_fails() {
        let dir = tempdir().unwrap();
        let store = LogStore::new(dir.path().join("log"));

        assert!(matches!(
            store.read_all().await,
            Err(StoreError::Read(_, _))
        ));
    }
}

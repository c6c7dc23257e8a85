//! On-disk attachment cache
//!
//! Each attachment lives at `<dir>/<hex sha256 of id>`. Files are written to
//! a hidden temporary name and renamed into place, so a reader never sees a
//! partial file, and downloads of the same id are single-flight.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::errors::Result;
use crate::types::AttachmentId;

/// Content directory for downloaded attachments
#[derive(Debug)]
pub struct AttachmentStore {
    dir: PathBuf,
    in_flight: StdMutex<HashMap<AttachmentId, Arc<Mutex<()>>>>,
}

impl AttachmentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            in_flight: StdMutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Deterministic cache path for `id`
    pub fn path_for(&self, id: &AttachmentId) -> PathBuf {
        let digest = Sha256::digest(id.as_str().as_bytes());
        self.dir.join(hex::encode(digest))
    }

    /// Cached path for `id` if the file is already present
    pub async fn cached(&self, id: &AttachmentId) -> Option<PathBuf> {
        let path = self.path_for(id);
        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Some(path),
            _ => None,
        }
    }

    fn gate(&self, id: &AttachmentId) -> Arc<Mutex<()>> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id.clone())
            .or_default()
            .clone()
    }

    fn release(&self, id: &AttachmentId, gate: &Arc<Mutex<()>>) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        // Two references: the map's and ours. Anything more is a waiter.
        if Arc::strong_count(gate) <= 2 {
            in_flight.remove(id);
        }
    }

    #[cfg(test)]
    fn in_flight_len(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Return the cached path for `id`, running `fetch` at most once
    ///
    /// Concurrent callers for the same id wait for the first fetch and then
    /// find the file in place.
    pub async fn get_or_fetch<F, Fut>(&self, id: &AttachmentId, fetch: F) -> Result<PathBuf>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>>>,
    {
        if let Some(path) = self.cached(id).await {
            debug!("Attachment {} served from cache", id);
            return Ok(path);
        }

        let flight = InFlight {
            store: self,
            id,
            gate: self.gate(id),
        };
        let _guard = flight.gate.lock().await;
        match self.cached(id).await {
            Some(path) => Ok(path),
            None => {
                let bytes = fetch().await?;
                self.write_atomic(id, &bytes).await
            }
        }
    }

    async fn write_atomic(&self, id: &AttachmentId, bytes: &[u8]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.path_for(id);
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let staging = self
            .dir
            .join(format!(".{}.{}.part", file_name, uuid::Uuid::new_v4()));

        if let Err(e) = tokio::fs::write(&staging, bytes).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&staging, &path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }

        info!("Cached attachment {} ({} bytes)", id, bytes.len());
        Ok(path)
    }
}

/// Single-flight entry, released when the download finishes or is dropped
struct InFlight<'a> {
    store: &'a AttachmentStore,
    id: &'a AttachmentId,
    gate: Arc<Mutex<()>>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.store.release(self.id, &self.gate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_path_is_deterministic_and_flat() {
        let store = AttachmentStore::new("/cache");
        let a = store.path_for(&AttachmentId::from("../../etc/passwd"));
        let b = store.path_for(&AttachmentId::from("../../etc/passwd"));
        assert_eq!(a, b);
        assert_eq!(a.parent(), Some(Path::new("/cache")));
        assert_eq!(a.file_name().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn test_fetch_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = AttachmentStore::new(dir.path());
        let id = AttachmentId::from("att-1");
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let path = store
                .get_or_fetch(&id, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(b"bytes".to_vec())
                })
                .await
                .unwrap();
            assert_eq!(std::fs::read(&path).unwrap(), b"bytes");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".part"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_failed_fetch_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = AttachmentStore::new(dir.path());
        let id = AttachmentId::from("att-2");

        let result = store
            .get_or_fetch(&id, || async { Err(crate::errors::SyncError::LinkLost) })
            .await;
        assert!(result.is_err());
        assert!(store.cached(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_fetch_releases_in_flight_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = AttachmentStore::new(dir.path());
        let id = AttachmentId::from("att-3");

        let cancelled = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            store.get_or_fetch(&id, || std::future::pending::<Result<Vec<u8>>>()),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(store.in_flight_len(), 0);

        let path = store
            .get_or_fetch(&id, || async { Ok(b"retry".to_vec()) })
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"retry");
        assert_eq!(store.in_flight_len(), 0);
    }
}

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::Mutex;

use super::{BlobContent, BlobStore, CopyStatus, Metadata, StorageError};

/// How server-side copies started on an [`InMemoryBlobStore`] progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CopyBehavior {
    /// Copy is done before the first status poll.
    #[default]
    Immediate,
    /// Status is pending for the first `n - 1` polls and succeeds on the n-th.
    CompleteAfter(u32),
    /// Status never leaves pending.
    NeverComplete,
    /// First poll reports failure.
    Fail,
}

#[derive(Debug, Clone)]
struct Blob {
    bytes: Vec<u8>,
    metadata: Metadata,
    content_encoding: Option<String>,
}

struct CopyJob {
    source_bytes: Vec<u8>,
    polls: u32,
    status: CopyStatus,
}

#[derive(Default)]
struct State {
    blobs: BTreeMap<String, Blob>,
    copies: HashMap<String, CopyJob>,
}

/// Blob store held in memory, with scriptable copy progress and counters for
/// status polls and deletes.
#[derive(Default)]
pub struct InMemoryBlobStore {
    state: Mutex<State>,
    copy_behavior: CopyBehavior,
    status_polls: AtomicU32,
    deletes: AtomicU32,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_copy_behavior(mut self, behavior: CopyBehavior) -> Self {
        self.copy_behavior = behavior;
        self
    }

    pub async fn put_text(&self, path: &str, text: &str) {
        self.state.lock().await.blobs.insert(
            path.to_string(),
            Blob {
                bytes: text.as_bytes().to_vec(),
                metadata: Metadata::new(),
                content_encoding: None,
            },
        );
    }

    /// Declare a content encoding on an existing blob.
    pub async fn set_content_encoding(&self, path: &str, encoding: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        let blob = state
            .blobs
            .get_mut(path)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
        blob.content_encoding = Some(encoding.to_string());
        Ok(())
    }

    pub async fn metadata(&self, path: &str) -> Option<Metadata> {
        self.state.lock().await.blobs.get(path).map(|b| b.metadata.clone())
    }

    pub async fn paths(&self) -> Vec<String> {
        self.state.lock().await.blobs.keys().cloned().collect()
    }

    pub fn status_polls(&self) -> u32 {
        self.status_polls.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> u32 {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let state = self.state.lock().await;
        Ok(state.blobs.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }

    async fn download(&self, path: &str) -> Result<BlobContent, StorageError> {
        let state = self.state.lock().await;
        let blob = state
            .blobs
            .get(path)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
        Ok(BlobContent {
            bytes: blob.bytes.clone(),
            content_encoding: blob.content_encoding.clone(),
        })
    }

    async fn upload(&self, path: &str, bytes: Vec<u8>, metadata: Option<Metadata>) -> Result<(), StorageError> {
        self.state.lock().await.blobs.insert(
            path.to_string(),
            Blob {
                bytes,
                metadata: metadata.unwrap_or_default(),
                content_encoding: None,
            },
        );
        Ok(())
    }

    async fn start_copy(&self, source: &str, target: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        let src = state
            .blobs
            .get(source)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(source.to_string()))?;
        let status = match self.copy_behavior {
            CopyBehavior::Immediate => CopyStatus::Success,
            _ => CopyStatus::Pending,
        };
        // The target exists from the start; it only gets content once the copy succeeds.
        let placeholder = Blob {
            bytes: if status == CopyStatus::Success {
                src.bytes.clone()
            } else {
                Vec::new()
            },
            ..src.clone()
        };
        state.blobs.insert(target.to_string(), placeholder);
        state.copies.insert(
            target.to_string(),
            CopyJob {
                source_bytes: src.bytes,
                polls: 0,
                status,
            },
        );
        Ok(())
    }

    async fn copy_status(&self, target: &str) -> Result<CopyStatus, StorageError> {
        self.status_polls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        let job = state
            .copies
            .get_mut(target)
            .ok_or_else(|| StorageError::NotFound(target.to_string()))?;
        job.polls += 1;
        if job.status == CopyStatus::Pending {
            job.status = match self.copy_behavior {
                CopyBehavior::CompleteAfter(n) if job.polls >= n => CopyStatus::Success,
                CopyBehavior::Fail => CopyStatus::Failed,
                _ => CopyStatus::Pending,
            };
        }
        let status = job.status;
        if status == CopyStatus::Success {
            let bytes = job.source_bytes.clone();
            if let Some(blob) = state.blobs.get_mut(target) {
                blob.bytes = bytes;
            }
        }
        Ok(status)
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        if state.blobs.remove(path).is_none() {
            return Err(StorageError::NotFound(path.to_string()));
        }
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        Ok(self.state.lock().await.blobs.contains_key(path))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::storage::{MoveOptions, move_blob};

    fn fast(max_poll_attempts: u32) -> MoveOptions {
        MoveOptions {
            poll_interval: Duration::from_millis(1),
            max_poll_attempts,
        }
    }

    #[tokio::test]
    async fn move_deletes_source_after_success() {
        let store = InMemoryBlobStore::new().with_copy_behavior(CopyBehavior::CompleteAfter(3));
        store.put_text("raw/a.csv", "x,y\n1,2\n").await;
        let target = move_blob(&store, "raw/a.csv", "archive", &fast(10)).await.unwrap();
        assert_eq!(target, "archive/raw/a.csv");
        assert!(!store.exists("raw/a.csv").await.unwrap());
        assert_eq!(store.download(&target).await.unwrap().bytes, b"x,y\n1,2\n".to_vec());
        assert_eq!(store.status_polls(), 3);
        assert_eq!(store.deletes(), 1);
    }

    #[tokio::test]
    async fn failed_copy_keeps_source() {
        let store = InMemoryBlobStore::new().with_copy_behavior(CopyBehavior::Fail);
        store.put_text("raw/a.csv", "x").await;
        let err = move_blob(&store, "raw/a.csv", "archive", &fast(10)).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::CopyFailed {
                status: CopyStatus::Failed,
                ..
            }
        ));
        assert!(store.exists("raw/a.csv").await.unwrap());
        assert_eq!(store.deletes(), 0);
    }

    #[tokio::test]
    async fn copy_of_missing_source_is_not_found() {
        let store = InMemoryBlobStore::new();
        let err = move_blob(&store, "raw/none.csv", "archive", &fast(10)).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(p) if p == "raw/none.csv"));
    }
}

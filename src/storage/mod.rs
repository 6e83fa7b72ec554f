//! Blob storage collaborator used by pipeline activities.
//!
//! [`BlobStore`] is the raw interface (list, download, upload, server-side
//! copy, delete). [`BlobClient`] layers the pipeline conventions on top:
//! CSV discovery, text decoding with a default encoding, and the
//! copy-poll-delete [`move_blob`] protocol.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub mod fs;
pub mod memory;

/// Encoding assumed when a blob declares none. A leading BOM is dropped.
pub const DEFAULT_ENCODING: &str = "utf-8-sig";

pub type Metadata = BTreeMap<String, String>;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// State of a server-side copy as reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyStatus {
    Pending,
    Success,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobContent {
    pub bytes: Vec<u8>,
    /// Declared content encoding, if the blob has one.
    pub content_encoding: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("invalid blob path: {0}")]
    InvalidPath(String),
    #[error("copy of {source_path} to {target_path} still pending after {attempts} status polls")]
    MoveTimeout {
        source_path: String,
        target_path: String,
        attempts: u32,
    },
    #[error("copy of {source_path} to {target_path} ended as {status:?}")]
    CopyFailed {
        source_path: String,
        target_path: String,
        status: CopyStatus,
    },
    #[error("unsupported content encoding: {0}")]
    UnsupportedEncoding(String),
    #[error("blob {path} is not valid {encoding}")]
    Decode { path: String, encoding: String },
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage metadata error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Paths under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    async fn download(&self, path: &str) -> Result<BlobContent, StorageError>;

    async fn upload(&self, path: &str, bytes: Vec<u8>, metadata: Option<Metadata>) -> Result<(), StorageError>;

    /// Begin an asynchronous server-side copy. Completion is observed with
    /// [`copy_status`](Self::copy_status) on the target.
    async fn start_copy(&self, source: &str, target: &str) -> Result<(), StorageError>;

    async fn copy_status(&self, target: &str) -> Result<CopyStatus, StorageError>;

    async fn delete(&self, path: &str) -> Result<(), StorageError>;

    async fn exists(&self, path: &str) -> Result<bool, StorageError>;
}

/// Polling parameters for [`move_blob`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveOptions {
    pub poll_interval: Duration,
    /// Status polls allowed while the copy is pending.
    pub max_poll_attempts: u32,
}

impl Default for MoveOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_poll_attempts: 10,
        }
    }
}

/// Destination path used by [`move_blob`]: the full source path nested under `target_folder`.
pub fn move_target(source: &str, target_folder: &str) -> String {
    let folder = target_folder.trim_end_matches('/');
    let source = source.trim_start_matches('/');
    if folder.is_empty() {
        source.to_string()
    } else {
        format!("{folder}/{source}")
    }
}

/// Relocate `source` to `{target_folder}/{source}`.
///
/// Issues a copy, polls its status up to `max_poll_attempts` times while it
/// is pending, and deletes the source only once the copy succeeded. On
/// [`StorageError::MoveTimeout`] or [`StorageError::CopyFailed`] the source is
/// left where it was and a partial target may exist.
///
/// Not idempotent: a crash between copy success and delete leaves both copies.
pub async fn move_blob(
    store: &dyn BlobStore,
    source: &str,
    target_folder: &str,
    options: &MoveOptions,
) -> Result<String, StorageError> {
    let target = move_target(source, target_folder);
    if target == source {
        return Err(StorageError::InvalidPath(format!("{source} would be moved onto itself")));
    }
    store.start_copy(source, &target).await?;
    debug!(source_path = %source, target_path = %target, "copy started");

    for attempt in 1..=options.max_poll_attempts {
        match store.copy_status(&target).await? {
            CopyStatus::Success => {
                store.delete(source).await?;
                debug!(source_path = %source, target_path = %target, polls = attempt, "move completed");
                return Ok(target);
            }
            CopyStatus::Pending => {
                if attempt < options.max_poll_attempts {
                    tokio::time::sleep(options.poll_interval).await;
                }
            }
            status @ (CopyStatus::Failed | CopyStatus::Aborted) => {
                warn!(source_path = %source, target_path = %target, ?status, "copy did not succeed; source kept");
                return Err(StorageError::CopyFailed {
                    source_path: source.to_string(),
                    target_path: target,
                    status,
                });
            }
        }
    }

    warn!(
        source_path = %source,
        target_path = %target,
        attempts = options.max_poll_attempts,
        "copy still pending; source kept"
    );
    Err(StorageError::MoveTimeout {
        source_path: source.to_string(),
        target_path: target,
        attempts: options.max_poll_attempts,
    })
}

/// Decode blob bytes according to a declared encoding label.
pub fn decode_text(path: &str, bytes: Vec<u8>, encoding: &str) -> Result<String, StorageError> {
    let label = encoding.trim().to_ascii_lowercase();
    let decode_err = || StorageError::Decode {
        path: path.to_string(),
        encoding: label.clone(),
    };
    match label.as_str() {
        "utf-8-sig" | "utf8-sig" => {
            let body = bytes.strip_prefix(UTF8_BOM).unwrap_or(&bytes);
            String::from_utf8(body.to_vec()).map_err(|_| decode_err())
        }
        "utf-8" | "utf8" => String::from_utf8(bytes).map_err(|_| decode_err()),
        "ascii" | "us-ascii" => {
            if bytes.is_ascii() {
                String::from_utf8(bytes).map_err(|_| decode_err())
            } else {
                Err(decode_err())
            }
        }
        "latin-1" | "latin1" | "iso-8859-1" => Ok(bytes.iter().map(|&b| b as char).collect()),
        _ => Err(StorageError::UnsupportedEncoding(encoding.to_string())),
    }
}

/// Pipeline-facing wrapper around a [`BlobStore`].
#[derive(Clone)]
pub struct BlobClient {
    store: Arc<dyn BlobStore>,
    move_options: MoveOptions,
}

impl BlobClient {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            move_options: MoveOptions::default(),
        }
    }

    pub fn with_move_options(mut self, options: MoveOptions) -> Self {
        self.move_options = options;
        self
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    /// `.csv` files under `prefix`.
    pub async fn list_csv_files(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let files: Vec<String> = self
            .store
            .list(prefix)
            .await?
            .into_iter()
            .filter(|p| p.ends_with(".csv"))
            .collect();
        debug!(prefix = %prefix, count = files.len(), "listed csv files");
        Ok(files)
    }

    /// Download and decode with the blob's declared encoding, or
    /// [`DEFAULT_ENCODING`] when it declares none.
    pub async fn download_text(&self, path: &str) -> Result<String, StorageError> {
        let content = self.store.download(path).await?;
        let encoding = content.content_encoding.as_deref().unwrap_or(DEFAULT_ENCODING);
        decode_text(path, content.bytes, encoding)
    }

    pub async fn upload_text(&self, path: &str, text: &str, metadata: Option<Metadata>) -> Result<(), StorageError> {
        self.store.upload(path, text.as_bytes().to_vec(), metadata).await
    }

    pub async fn move_blob(&self, source: &str, target_folder: &str) -> Result<String, StorageError> {
        move_blob(self.store.as_ref(), source, target_folder, &self.move_options).await
    }
}

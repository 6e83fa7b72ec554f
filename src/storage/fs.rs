use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;

use super::{BlobContent, BlobStore, CopyStatus, Metadata, StorageError};

const SIDECAR_DIR: &str = ".blobmeta";

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Sidecar {
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    content_encoding: Option<String>,
}

/// Blob store backed by a local directory: `{root}/{container}/{path}`.
///
/// Metadata lives in sidecar files under a hidden directory that `list`
/// never reports. Copies complete synchronously, so the first status poll
/// after `start_copy` already reports the final state.
pub struct LocalBlobStore {
    root: PathBuf,
    copies: Mutex<HashMap<String, CopyStatus>>,
}

impl LocalBlobStore {
    pub fn new(connection: impl AsRef<Path>, container: &str) -> Self {
        Self {
            root: connection.as_ref().join(container),
            copies: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, path: &str) -> Result<PathBuf, StorageError> {
        let rel = Path::new(path.trim_start_matches('/'));
        let safe = !path.trim().is_empty() && rel.components().all(|c| matches!(c, Component::Normal(_)));
        if !safe || rel.starts_with(SIDECAR_DIR) {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(rel))
    }

    fn sidecar_path(&self, path: &str) -> Result<PathBuf, StorageError> {
        self.blob_path(path)?;
        Ok(self
            .root
            .join(SIDECAR_DIR)
            .join(format!("{}.json", path.trim_start_matches('/'))))
    }

    async fn read_sidecar(&self, path: &str) -> Result<Sidecar, StorageError> {
        match fs::read(self.sidecar_path(path)?).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Sidecar::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_sidecar(&self, path: &str, sidecar: &Sidecar) -> Result<(), StorageError> {
        let file = self.sidecar_path(path)?;
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(file, serde_json::to_vec(sidecar)?).await?;
        Ok(())
    }
}

fn not_found(path: &str) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(path.to_string())
        } else {
            StorageError::Io(e)
        }
    }
}

#[async_trait::async_trait]
impl BlobStore for LocalBlobStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut out = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut rd = match fs::read_dir(&dir).await {
                Ok(rd) => rd,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = rd.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    if dir == self.root && entry.file_name() == SIDECAR_DIR {
                        continue;
                    }
                    stack.push(path);
                    continue;
                }
                let Ok(rel) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let rel = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                if rel.starts_with(prefix) {
                    out.push(rel);
                }
            }
        }
        out.sort();
        Ok(out)
    }

    async fn download(&self, path: &str) -> Result<BlobContent, StorageError> {
        let bytes = fs::read(self.blob_path(path)?).await.map_err(not_found(path))?;
        let sidecar = self.read_sidecar(path).await?;
        Ok(BlobContent {
            bytes,
            content_encoding: sidecar.content_encoding,
        })
    }

    async fn upload(&self, path: &str, bytes: Vec<u8>, metadata: Option<Metadata>) -> Result<(), StorageError> {
        let file = self.blob_path(path)?;
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&file, bytes).await?;
        let sidecar = Sidecar {
            metadata: metadata.unwrap_or_default(),
            content_encoding: None,
        };
        self.write_sidecar(path, &sidecar).await
    }

    async fn start_copy(&self, source: &str, target: &str) -> Result<(), StorageError> {
        let from = self.blob_path(source)?;
        let to = self.blob_path(target)?;
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&from, &to).await.map_err(not_found(source))?;
        let sidecar = self.read_sidecar(source).await?;
        self.write_sidecar(target, &sidecar).await?;
        self.copies
            .lock()
            .await
            .insert(target.to_string(), CopyStatus::Success);
        Ok(())
    }

    async fn copy_status(&self, target: &str) -> Result<CopyStatus, StorageError> {
        self.copies
            .lock()
            .await
            .get(target)
            .copied()
            .ok_or_else(|| StorageError::NotFound(target.to_string()))
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        fs::remove_file(self.blob_path(path)?).await.map_err(not_found(path))?;
        match fs::remove_file(self.sidecar_path(path)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        Ok(fs::try_exists(self.blob_path(path)?).await?)
    }
}

//! Local filesystem blob store, content-hash versioned.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{sha256_hex, BlobStore, StoreError, StoredBlob, VersionToken};

/// Stores each path as a file under `root`. The version token is the SHA-256
/// of the file contents; writes land via temp file + atomic rename.
#[derive(Debug)]
pub struct FileBlobStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(path.trim_start_matches('/'));
        let clean = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !clean || relative.as_os_str().is_empty() {
            return Err(StoreError::InvalidPath {
                path: path.to_string(),
            });
        }
        Ok(self.root.join(relative))
    }

    async fn read_file(&self, path: &str, absolute: &Path) -> Result<Option<StoredBlob>, StoreError> {
        match fs::read(absolute).await {
            Ok(bytes) => {
                let version = VersionToken::new(sha256_hex(&bytes));
                Ok(Some(StoredBlob { bytes, version }))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io {
                path: path.to_string(),
                source,
            }),
        }
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

async fn stage_temp(temp_path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await
}

/// Writes `bytes` to `temp_path` and renames it over `target`. The temp file
/// never outlives a failure.
async fn replace_via_temp(temp_path: &Path, target: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let result = match stage_temp(temp_path, bytes).await {
        Ok(()) => fs::rename(temp_path, target).await.map_err(io_error(target)),
        Err(err) => Err(io_error(temp_path)(err)),
    };
    if result.is_err() {
        let _ = fs::remove_file(temp_path).await;
    }
    result
}

#[async_trait]
impl BlobStore for FileBlobStore {
    fn describe(&self) -> String {
        format!("file:{}", self.root.display())
    }

    async fn read(&self, path: &str) -> Result<Option<StoredBlob>, StoreError> {
        let absolute = self.resolve(path)?;
        self.read_file(path, &absolute).await
    }

    async fn write(
        &self,
        path: &str,
        bytes: Vec<u8>,
        expected: Option<&VersionToken>,
        _message: &str,
    ) -> Result<VersionToken, StoreError> {
        let absolute = self.resolve(path)?;
        let _guard = self.write_lock.lock().await;

        let current = self.read_file(path, &absolute).await?.map(|blob| blob.version);
        if current.as_ref() != expected {
            return Err(StoreError::Conflict {
                path: path.to_string(),
                expected: expected.cloned(),
            });
        }

        let parent = absolute
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent).await.map_err(io_error(&parent))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        replace_via_temp(&temp_path, &absolute, &bytes).await?;
        Ok(VersionToken::new(sha256_hex(&bytes)))
    }
}

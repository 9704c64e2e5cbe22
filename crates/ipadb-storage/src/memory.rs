//! In-memory blob store with write tracing, for tests and embedding.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::{BlobStore, StoreError, StoredBlob, VersionToken};

/// A write accepted by [`MemoryBlobStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub path: String,
    pub message: String,
    pub expected: Option<VersionToken>,
    pub version: VersionToken,
}

#[derive(Debug, Default)]
struct MemoryState {
    objects: HashMap<String, StoredBlob>,
    writes: Vec<RecordedWrite>,
    failing_reads: Vec<String>,
    next_version: u64,
}

impl MemoryState {
    fn mint(&mut self) -> VersionToken {
        self.next_version += 1;
        VersionToken::new(format!("v{}", self.next_version))
    }
}

/// Cloning shares the underlying state.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `bytes` unconditionally, as an out-of-band writer would.
    pub fn insert(&self, path: &str, bytes: Vec<u8>) -> VersionToken {
        let mut state = self.state();
        let version = state.mint();
        state.objects.insert(
            path.to_string(),
            StoredBlob {
                bytes,
                version: version.clone(),
            },
        );
        version
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.state().objects.get(path).map(|blob| blob.bytes.clone())
    }

    pub fn version(&self, path: &str) -> Option<VersionToken> {
        self.state()
            .objects
            .get(path)
            .map(|blob| blob.version.clone())
    }

    /// Writes accepted through [`BlobStore::write`], oldest first.
    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.state().writes.clone()
    }

    /// Makes reads of paths starting with `prefix` fail.
    pub fn fail_reads(&self, prefix: impl Into<String>) {
        self.state().failing_reads.push(prefix.into());
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn read(&self, path: &str) -> Result<Option<StoredBlob>, StoreError> {
        let state = self.state();
        if state.failing_reads.iter().any(|p| path.starts_with(p)) {
            return Err(StoreError::HttpStatus {
                status: 500,
                path: path.to_string(),
                message: "injected read failure".to_string(),
            });
        }
        Ok(state.objects.get(path).cloned())
    }

    async fn write(
        &self,
        path: &str,
        bytes: Vec<u8>,
        expected: Option<&VersionToken>,
        message: &str,
    ) -> Result<VersionToken, StoreError> {
        let mut state = self.state();
        let current = state.objects.get(path).map(|blob| &blob.version);
        if current != expected {
            return Err(StoreError::Conflict {
                path: path.to_string(),
                expected: expected.cloned(),
            });
        }

        let version = state.mint();
        state.objects.insert(
            path.to_string(),
            StoredBlob {
                bytes,
                version: version.clone(),
            },
        );
        state.writes.push(RecordedWrite {
            path: path.to_string(),
            message: message.to_string(),
            expected: expected.cloned(),
            version: version.clone(),
        });
        Ok(version)
    }
}

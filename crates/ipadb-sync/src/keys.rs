//! License-key ledger persisted through the blob store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ipadb_core::keys::{
    issue_key, normalize_code, redeem, revoke, KeyRejection, KeyStats, LicenseKey, NewKeyRequest, Redemption,
};
use ipadb_storage::{read_json_array, write_json_array, BlobStore, JsonSnapshot, StoreError, VersionToken};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Rejected(#[from] KeyRejection),
    #[error("failed to read key ledger: {0}")]
    Read(#[source] StoreError),
    #[error("key ledger at {path} changed concurrently; retry")]
    Conflict { path: String },
    #[error("failed to write key ledger: {0}")]
    Write(#[source] StoreError),
}

#[derive(Debug, Clone)]
pub struct KeyListing {
    pub keys: Vec<LicenseKey>,
    pub stats: KeyStats,
}

#[derive(Clone)]
pub struct KeyLedger {
    store: Arc<dyn BlobStore>,
    path: String,
}

impl KeyLedger {
    pub fn new(store: Arc<dyn BlobStore>, path: impl Into<String>) -> Self {
        Self {
            store,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    async fn load(&self) -> Result<JsonSnapshot<LicenseKey>, LedgerError> {
        read_json_array(self.store.as_ref(), &self.path)
            .await
            .map_err(LedgerError::Read)
    }

    async fn save(
        &self,
        keys: &[LicenseKey],
        expected: Option<&VersionToken>,
        message: &str,
    ) -> Result<VersionToken, LedgerError> {
        write_json_array(self.store.as_ref(), &self.path, keys, expected, message)
            .await
            .map_err(|err| {
                if err.is_conflict() {
                    LedgerError::Conflict {
                        path: self.path.clone(),
                    }
                } else {
                    LedgerError::Write(err)
                }
            })
    }

    /// Issues a new key at the front of the ledger.
    pub async fn create(
        &self,
        request: &NewKeyRequest,
        now: DateTime<Utc>,
    ) -> Result<LicenseKey, LedgerError> {
        let snapshot = self.load().await?;
        let key = issue_key(request, now, &mut rand::thread_rng());

        let mut keys = Vec::with_capacity(snapshot.items.len() + 1);
        keys.push(key.clone());
        keys.extend(snapshot.items);
        self.save(&keys, snapshot.version.as_ref(), &format!("Create key: {}", key.key))
            .await?;
        info!(key_id = %key.id, "license key created");
        Ok(key)
    }

    /// Consumes one use. Rejections that deactivate the key are persisted
    /// before being returned.
    pub async fn verify(&self, code: &str, now: DateTime<Utc>) -> Result<Redemption, LedgerError> {
        let mut snapshot = self.load().await?;
        match redeem(&mut snapshot.items, code, now) {
            Ok(redemption) => {
                self.save(
                    &snapshot.items,
                    snapshot.version.as_ref(),
                    &format!("Use key: {}", normalize_code(code)),
                )
                .await?;
                Ok(redemption)
            }
            Err(rejection) => {
                if rejection.mutates_ledger() {
                    self.save(
                        &snapshot.items,
                        snapshot.version.as_ref(),
                        &format!("Deactivate key: {}", normalize_code(code)),
                    )
                    .await?;
                }
                Err(rejection.into())
            }
        }
    }

    pub async fn delete(&self, code: &str) -> Result<LicenseKey, LedgerError> {
        let mut snapshot = self.load().await?;
        let removed = revoke(&mut snapshot.items, code).ok_or(KeyRejection::NotFound)?;
        self.save(
            &snapshot.items,
            snapshot.version.as_ref(),
            &format!("Delete key: {}", removed.key),
        )
        .await?;
        info!(key_id = %removed.id, "license key deleted");
        Ok(removed)
    }

    pub async fn list(&self, now: DateTime<Utc>) -> Result<KeyListing, LedgerError> {
        let keys = self.load().await?.items;
        let stats = KeyStats::collect(&keys, now);
        Ok(KeyListing { keys, stats })
    }
}

//! Hand-curated uploads that bypass the feed.

use ipadb_core::{CatalogRecord, Provenance};
use ipadb_storage::{read_json_array, write_json_array, BlobStore, StoreError, VersionToken};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::info;

pub const CURATED_KINDS: [&str; 3] = ["ipa", "dylib", "conf"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CurationError {
    #[error("unknown catalog type `{0}`")]
    UnknownKind(String),
    #[error("entry must be a JSON object")]
    NotAnObject,
    #[error("entry needs a non-empty name")]
    MissingName,
}

/// Store path for a curated catalog, e.g. `public/data/dylib.json`.
pub fn catalog_path_for_kind(data_dir: &str, kind: &str) -> Result<String, CurationError> {
    if !CURATED_KINDS.contains(&kind) {
        return Err(CurationError::UnknownKind(kind.to_string()));
    }
    Ok(format!("{}/{kind}.json", data_dir.trim_end_matches('/')))
}

/// Validates an uploaded entry. App entries are always marked curated so an
/// upload can never land in the partition the sync owns.
pub fn prepare_curated_entry(kind: &str, data: JsonValue) -> Result<CatalogRecord, CurationError> {
    if !CURATED_KINDS.contains(&kind) {
        return Err(CurationError::UnknownKind(kind.to_string()));
    }
    let JsonValue::Object(mut map) = data else {
        return Err(CurationError::NotAnObject);
    };
    let named = map
        .get("name")
        .and_then(JsonValue::as_str)
        .is_some_and(|n| !n.trim().is_empty());
    if !named {
        return Err(CurationError::MissingName);
    }
    if kind == "ipa" {
        map.insert(
            "source".to_string(),
            JsonValue::String(Provenance::CURATED_MARKER.to_string()),
        );
    }
    Ok(CatalogRecord::new(JsonValue::Object(map)))
}

pub fn prepend_entry(catalog: Vec<CatalogRecord>, entry: CatalogRecord) -> Vec<CatalogRecord> {
    let mut next = Vec::with_capacity(catalog.len() + 1);
    next.push(entry);
    next.extend(catalog);
    next
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Invalid(#[from] CurationError),
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: StoreError,
    },
    #[error("{path} changed while uploading; retry")]
    Conflict { path: String },
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReceipt {
    pub path: String,
    pub total: usize,
    pub version: String,
}

/// Validates `data` and prepends it to the `{kind}` catalog, conditional on
/// the revision that was read.
pub async fn upload_curated_entry(
    store: &dyn BlobStore,
    data_dir: &str,
    kind: &str,
    data: JsonValue,
) -> Result<UploadReceipt, UploadError> {
    let path = catalog_path_for_kind(data_dir, kind)?;
    let entry = prepare_curated_entry(kind, data)?;
    let name = entry.name().unwrap_or_default().to_string();

    let snapshot = read_json_array::<CatalogRecord>(store, &path)
        .await
        .map_err(|source| UploadError::Read {
            path: path.clone(),
            source,
        })?;
    let catalog = prepend_entry(snapshot.items, entry);
    let version: VersionToken = write_json_array(
        store,
        &path,
        &catalog,
        snapshot.version.as_ref(),
        &format!("Add {kind}: {name}"),
    )
    .await
    .map_err(|source| {
        if source.is_conflict() {
            UploadError::Conflict { path: path.clone() }
        } else {
            UploadError::Write {
                path: path.clone(),
                source,
            }
        }
    })?;
    info!(%path, %name, total = catalog.len(), "curated entry uploaded");

    Ok(UploadReceipt {
        path,
        total: catalog.len(),
        version: version.to_string(),
    })
}

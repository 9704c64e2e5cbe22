//! Feed listing -> catalog entry conversion.

use chrono::{DateTime, Utc};
use ipadb_core::{
    CatalogEntry, EntryKind, ListingRecord, Provenance, DEFAULT_DESCRIPTION, DEFAULT_DEVELOPER,
};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::classify::{Classifier, ClassifierInput};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionError {
    #[error("listing has no name")]
    MissingName,
    #[error("feed element could not be decoded: {0}")]
    Undecodable(String),
}

/// A listing that did not make it into the candidate batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedListing {
    pub index: usize,
    pub name: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedBatch {
    pub entries: Vec<CatalogEntry>,
    pub skipped: Vec<SkippedListing>,
}

fn slug(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}

/// `ipa-{bundle or name slug}-{version}`.
pub fn entry_id(record: &ListingRecord) -> String {
    let stem = record
        .bundle_identifier()
        .map(ToString::to_string)
        .unwrap_or_else(|| slug(record.display_name().unwrap_or_default()));
    format!(
        "ipa-{stem}-{}",
        record.version.as_deref().unwrap_or("unversioned")
    )
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Converts one listing. `now` becomes both the badge evaluation time and
/// `lastSync`.
pub fn normalize_listing(
    classifier: &Classifier,
    record: &ListingRecord,
    now: DateTime<Utc>,
) -> Result<CatalogEntry, ConversionError> {
    if record.display_name().is_none() {
        return Err(ConversionError::MissingName);
    }
    // Identity compares raw names, so keep the feed's spelling.
    let name = record.name.clone().unwrap_or_default();

    let classification = classifier.classify(
        ClassifierInput {
            name: Some(&name),
            description: record.localized_description.as_deref(),
            bundle_id: record.bundle_id.as_deref(),
            release_date: record.release_date(),
        },
        now,
    );

    Ok(CatalogEntry {
        id: entry_id(record),
        kind: EntryKind::Ipa,
        icon: record.icon_ref().map(ToString::to_string),
        desc: non_blank(record.localized_description.as_deref())
            .unwrap_or(DEFAULT_DESCRIPTION)
            .to_string(),
        tags: classification.tags,
        badge: classification.badge,
        file_link: record.download_ref().map(ToString::to_string),
        version: record.version.clone(),
        developer: non_blank(record.developer_name.as_deref())
            .unwrap_or(DEFAULT_DEVELOPER)
            .to_string(),
        date: record.version_date.clone(),
        source: Provenance::Automated,
        bundle_id: record.bundle_id.clone(),
        last_sync: now,
        name,
    })
}

/// Converts every listing, logging and collecting the ones that fail.
pub fn normalize_batch(
    classifier: &Classifier,
    records: &[ListingRecord],
    now: DateTime<Utc>,
) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    for (index, record) in records.iter().enumerate() {
        match normalize_listing(classifier, record, now) {
            Ok(entry) => batch.entries.push(entry),
            Err(err) => {
                warn!(index, bundle_id = ?record.bundle_id, error = %err, "skipping listing");
                batch.skipped.push(SkippedListing {
                    index,
                    name: record.name.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }
    batch
}

//! Final catalog layout.

use std::cmp::Reverse;

use chrono::{DateTime, Utc};
use ipadb_core::CatalogRecord;

use crate::partition::CatalogPartitions;

/// Newest first by `key`; records without a usable date go last. Stable.
pub fn sort_newest_first(
    records: &mut [CatalogRecord],
    key: impl Fn(&CatalogRecord) -> Option<DateTime<Utc>>,
) {
    records.sort_by_cached_key(|record| Reverse(key(record)));
}

/// automated (already ordered by reconciliation) ++ curated by `date` ++
/// unrecognized in stored order.
pub fn assemble_catalog(parts: CatalogPartitions) -> Vec<CatalogRecord> {
    let CatalogPartitions {
        automated,
        mut curated,
        unrecognized,
    } = parts;
    sort_newest_first(&mut curated, CatalogRecord::release_date);

    let mut catalog = Vec::with_capacity(automated.len() + curated.len() + unrecognized.len());
    catalog.extend(automated);
    catalog.extend(curated);
    catalog.extend(unrecognized);
    catalog
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names(records: &[CatalogRecord]) -> Vec<&str> {
        records.iter().map(|r| r.name().unwrap_or("?")).collect()
    }

    #[test]
    fn undated_records_sort_last_and_ties_are_stable() {
        let mut records: Vec<CatalogRecord> = vec![
            json!({"name": "nodate"}).into(),
            json!({"name": "old", "date": "2025-01-01"}).into(),
            json!({"name": "bad", "date": "soon"}).into(),
            json!({"name": "tie-a", "date": "2026-02-01"}).into(),
            json!({"name": "tie-b", "date": "2026-02-01T00:00:00Z"}).into(),
            json!({"name": "fallback", "lastSync": "2026-03-01T00:00:00Z"}).into(),
        ];
        sort_newest_first(&mut records, CatalogRecord::recency);
        assert_eq!(
            names(&records),
            vec!["fallback", "tie-a", "tie-b", "old", "nodate", "bad"]
        );
    }

    #[test]
    fn partitions_keep_their_blocks() {
        let parts = CatalogPartitions {
            automated: vec![json!({"name": "auto", "date": "2020-01-01"}).into()],
            curated: vec![
                json!({"name": "cur-old", "date": "2024-01-01", "source": "manual"}).into(),
                json!({"name": "cur-new", "date": "2026-01-01", "source": "manual"}).into(),
            ],
            unrecognized: vec![
                json!({"name": "z", "date": "2026-06-01"}).into(),
                json!({"name": "a"}).into(),
            ],
        };
        assert_eq!(
            names(&assemble_catalog(parts)),
            vec!["auto", "cur-new", "cur-old", "z", "a"]
        );
    }
}

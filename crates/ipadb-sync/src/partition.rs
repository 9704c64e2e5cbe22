//! Provenance split of a stored catalog.

use ipadb_core::{CatalogRecord, Provenance};

/// A stored catalog split by provenance. Relative order is preserved inside
/// each partition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogPartitions {
    pub automated: Vec<CatalogRecord>,
    pub curated: Vec<CatalogRecord>,
    pub unrecognized: Vec<CatalogRecord>,
}

impl CatalogPartitions {
    pub fn total(&self) -> usize {
        self.automated.len() + self.curated.len() + self.unrecognized.len()
    }
}

pub fn partition_catalog(records: Vec<CatalogRecord>) -> CatalogPartitions {
    let mut parts = CatalogPartitions::default();
    for record in records {
        match record.provenance() {
            Provenance::Automated => parts.automated.push(record),
            Provenance::Curated => parts.curated.push(record),
            Provenance::Unrecognized => parts.unrecognized.push(record),
        }
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn splits_by_marker_and_keeps_order() {
        let records: Vec<CatalogRecord> = vec![
            json!({"name": "A", "source": "apptesters"}).into(),
            json!({"name": "B", "source": "manual"}).into(),
            json!({"name": "C"}).into(),
            json!({"name": "D", "source": "apptesters"}).into(),
            json!({"name": "E", "source": "legacy-bot"}).into(),
            json!(42).into(),
        ];
        let parts = partition_catalog(records);
        let names = |v: &[CatalogRecord]| v.iter().map(|r| r.name().unwrap_or("?").to_string()).collect::<Vec<_>>();
        assert_eq!(names(&parts.automated), vec!["A", "D"]);
        assert_eq!(names(&parts.curated), vec!["B"]);
        assert_eq!(names(&parts.unrecognized), vec!["C", "E", "?"]);
        assert_eq!(parts.total(), 6);
    }
}

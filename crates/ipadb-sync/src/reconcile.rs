//! Merge of a candidate batch into the automated partition.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use ipadb_core::{CatalogEntry, CatalogRecord, IdentityKey, VersionKey};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::assemble::sort_newest_first;

/// What happens to older versions of an app when a new version arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VersionPolicy {
    /// Every distinct version stays in the catalog.
    #[default]
    RetainAll,
    /// A version update replaces the previous versions of that app.
    LatestOnly,
}

impl FromStr for VersionPolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "retain-all" | "all" => Ok(Self::RetainAll),
            "latest-only" | "latest" => Ok(Self::LatestOnly),
            other => Err(format!("unknown version policy `{other}`")),
        }
    }
}

impl fmt::Display for VersionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RetainAll => "retain-all",
            Self::LatestOnly => "latest-only",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeDecision {
    New,
    VersionUpdate,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionRecord {
    pub key: VersionKey,
    pub decision: MergeDecision,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub new: usize,
    pub version_updates: usize,
    pub duplicates: usize,
    /// Existing automated records carried into the result.
    pub retained: usize,
    /// Existing or same-batch records replaced under `LatestOnly`.
    pub superseded: usize,
}

impl MergeStats {
    pub fn changed(&self) -> bool {
        self.new + self.version_updates > 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    /// Automated partition after the merge, newest first.
    pub entries: Vec<CatalogRecord>,
    pub decisions: Vec<DecisionRecord>,
    pub stats: MergeStats,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconciliationEngine {
    policy: VersionPolicy,
}

impl ReconciliationEngine {
    pub fn new(policy: VersionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> VersionPolicy {
        self.policy
    }

    /// Merges `incoming` into `existing`. Existing records are never dropped
    /// under `RetainAll`; candidates whose version key is already present are
    /// discarded.
    pub fn reconcile(
        &self,
        existing: Vec<CatalogRecord>,
        incoming: Vec<CatalogEntry>,
    ) -> ReconcileOutcome {
        let mut known: HashMap<IdentityKey, HashSet<Option<String>>> = HashMap::new();
        let mut seen: HashSet<VersionKey> = HashSet::new();
        for record in &existing {
            let Some(key) = record.version_key() else {
                continue;
            };
            if !seen.insert(key.clone()) {
                warn!(key = %key, "stored catalog already holds this version twice; keeping both");
            }
            known
                .entry(key.identity)
                .or_default()
                .insert(key.version);
        }

        let mut stats = MergeStats::default();
        let mut decisions = Vec::with_capacity(incoming.len());
        let mut accepted: Vec<(IdentityKey, CatalogRecord)> = Vec::new();
        let mut updated: HashSet<IdentityKey> = HashSet::new();

        for candidate in &incoming {
            let key = candidate.version_key();
            let decision = match known.get(&key.identity) {
                None => MergeDecision::New,
                Some(versions) if versions.contains(&key.version) => MergeDecision::Duplicate,
                Some(_) => MergeDecision::VersionUpdate,
            };
            debug!(key = %key, ?decision, "reconciled candidate");

            match decision {
                MergeDecision::Duplicate => stats.duplicates += 1,
                MergeDecision::New | MergeDecision::VersionUpdate => {
                    if decision == MergeDecision::New {
                        stats.new += 1;
                    } else {
                        stats.version_updates += 1;
                        updated.insert(key.identity.clone());
                    }
                    known
                        .entry(key.identity.clone())
                        .or_default()
                        .insert(key.version.clone());
                    accepted.push((key.identity.clone(), CatalogRecord::from(candidate)));
                }
            }
            decisions.push(DecisionRecord { key, decision });
        }

        let mut entries = existing;
        if self.policy == VersionPolicy::LatestOnly && !updated.is_empty() {
            let before = entries.len() + accepted.len();
            entries.retain(|record| {
                record
                    .identity_key()
                    .map_or(true, |identity| !updated.contains(&identity))
            });
            // The last accepted version of an updated app wins.
            let mut latest: HashMap<&IdentityKey, usize> = HashMap::new();
            for (idx, (identity, _)) in accepted.iter().enumerate() {
                if updated.contains(identity) {
                    latest.insert(identity, idx);
                }
            }
            let keep: HashSet<usize> = latest.into_values().collect();
            let mut idx = 0;
            accepted.retain(|(identity, _)| {
                let kept = !updated.contains(identity) || keep.contains(&idx);
                idx += 1;
                kept
            });
            stats.superseded = before - entries.len() - accepted.len();
        }
        stats.retained = entries.len();

        entries.extend(accepted.into_iter().map(|(_, record)| record));
        sort_newest_first(&mut entries, CatalogRecord::recency);

        ReconcileOutcome {
            entries,
            decisions,
            stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use ipadb_core::{EntryKind, Provenance, Tag, DEFAULT_DESCRIPTION, DEFAULT_DEVELOPER};

    fn synced_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 0).single().unwrap()
    }

    fn candidate(name: &str, bundle: Option<&str>, version: &str, date: &str) -> CatalogEntry {
        CatalogEntry {
            id: format!("ipa-{}-{version}", bundle.unwrap_or(name)),
            kind: EntryKind::Ipa,
            name: name.to_string(),
            icon: None,
            desc: DEFAULT_DESCRIPTION.to_string(),
            tags: vec![Tag::Utility],
            badge: None,
            file_link: None,
            version: Some(version.to_string()),
            developer: DEFAULT_DEVELOPER.to_string(),
            date: Some(date.to_string()),
            source: Provenance::Automated,
            bundle_id: bundle.map(String::from),
            last_sync: synced_at(),
        }
    }

    fn stored(name: &str, bundle: Option<&str>, version: &str, date: &str) -> CatalogRecord {
        CatalogRecord::from(&candidate(name, bundle, version, date))
    }

    fn keys(records: &[CatalogRecord]) -> Vec<(String, String)> {
        records
            .iter()
            .map(|r| {
                (
                    r.name().unwrap_or_default().to_string(),
                    r.version().unwrap_or_default().to_string(),
                )
            })
            .collect()
    }

    #[test]
    fn foo_bar_scenario() {
        let engine = ReconciliationEngine::default();
        let existing = vec![stored("Foo", Some("com.foo"), "1.0", "2026-01-01")];
        let incoming = vec![
            candidate("Foo", Some("com.foo"), "1.0", "2026-01-01"),
            candidate("Foo", Some("com.foo"), "1.1", "2026-02-01"),
            candidate("Bar", Some("com.bar"), "2.0", "2026-01-15"),
        ];
        let outcome = engine.reconcile(existing, incoming);

        assert_eq!(
            outcome.decisions.iter().map(|d| d.decision).collect::<Vec<_>>(),
            vec![
                MergeDecision::Duplicate,
                MergeDecision::VersionUpdate,
                MergeDecision::New
            ]
        );
        assert_eq!(
            keys(&outcome.entries),
            vec![
                ("Foo".into(), "1.1".into()),
                ("Bar".into(), "2.0".into()),
                ("Foo".into(), "1.0".into()),
            ]
        );
        assert_eq!(
            outcome.stats,
            MergeStats {
                new: 1,
                version_updates: 1,
                duplicates: 1,
                retained: 1,
                superseded: 0,
            }
        );
    }

    #[test]
    fn second_run_changes_nothing() {
        let engine = ReconciliationEngine::default();
        let incoming = vec![
            candidate("Foo", Some("com.foo"), "1.1", "2026-02-01"),
            candidate("Bar", None, "2.0", "2026-01-15"),
        ];
        let first = engine.reconcile(Vec::new(), incoming.clone());
        let second = engine.reconcile(first.entries.clone(), incoming);
        assert_eq!(second.entries, first.entries);
        assert!(!second.stats.changed());
        assert_eq!(second.stats.duplicates, 2);
    }

    #[test]
    fn same_batch_duplicates_are_suppressed() {
        let engine = ReconciliationEngine::default();
        let incoming = vec![
            candidate("Foo", Some("com.foo"), "1.0", "2026-01-01"),
            candidate("Foo", Some("com.foo"), "1.0", "2026-01-01"),
            candidate("Foo", Some("com.foo"), "1.2", "2026-01-05"),
        ];
        let outcome = engine.reconcile(Vec::new(), incoming);
        assert_eq!(outcome.entries.len(), 2);
        assert_eq!(outcome.stats.new, 1);
        assert_eq!(outcome.stats.duplicates, 1);
        assert_eq!(outcome.stats.version_updates, 1);
    }

    #[test]
    fn bundle_identifier_is_part_of_identity() {
        let engine = ReconciliationEngine::default();
        let existing = vec![stored("Foo", Some("com.foo"), "1.0", "2026-01-01")];
        let outcome = engine.reconcile(
            existing,
            vec![
                candidate("Foo", Some("com.other"), "1.0", "2026-01-01"),
                candidate("Foo", None, "1.0", "2026-01-01"),
            ],
        );
        assert_eq!(outcome.stats.new, 2);
        assert_eq!(outcome.entries.len(), 3);
    }

    #[test]
    fn legacy_duplicates_are_never_removed() {
        let engine = ReconciliationEngine::default();
        let existing = vec![
            stored("Foo", Some("com.foo"), "1.0", "2026-01-01"),
            stored("Foo", Some("com.foo"), "1.0", "2026-01-01"),
        ];
        let outcome = engine.reconcile(existing, Vec::new());
        assert_eq!(outcome.entries.len(), 2);
        assert_eq!(outcome.stats.retained, 2);
    }

    #[test]
    fn latest_only_collapses_updated_groups() {
        let engine = ReconciliationEngine::new(VersionPolicy::LatestOnly);
        let existing = vec![
            stored("Foo", Some("com.foo"), "1.0", "2026-01-01"),
            stored("Foo", Some("com.foo"), "0.9", "2025-12-01"),
            stored("Baz", None, "3.0", "2026-01-03"),
        ];
        let outcome = engine.reconcile(
            existing,
            vec![
                candidate("Foo", Some("com.foo"), "1.1", "2026-02-01"),
                candidate("Foo", Some("com.foo"), "1.2", "2026-02-02"),
            ],
        );
        assert_eq!(
            keys(&outcome.entries),
            vec![("Foo".into(), "1.2".into()), ("Baz".into(), "3.0".into())]
        );
        assert_eq!(outcome.stats.superseded, 3);
        assert_eq!(outcome.stats.retained, 1);
    }

    #[test]
    fn policy_parses_from_config_strings() {
        assert_eq!("retain-all".parse::<VersionPolicy>(), Ok(VersionPolicy::RetainAll));
        assert_eq!(" Latest-Only ".parse::<VersionPolicy>(), Ok(VersionPolicy::LatestOnly));
        assert!("newest".parse::<VersionPolicy>().is_err());
        assert_eq!(VersionPolicy::LatestOnly.to_string(), "latest-only");
    }
}

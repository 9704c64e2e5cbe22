//! Catalog sync orchestration: feed -> normalize -> reconcile -> conditional write.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ipadb_adapters::{
    AdapterContext, AdapterError, AppTestersAdapter, FeedAdapter, APPTESTERS_FEED_URL,
};
use ipadb_core::{CatalogEntry, CatalogRecord, Provenance};
use ipadb_storage::{
    read_json_array, write_json_array, BlobStore, FileBlobStore, GitHubConfig,
    GitHubContentsStore, HttpClientConfig, HttpFetcher, StoreError,
};
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod assemble;
pub mod classify;
pub mod curated;
pub mod keys;
pub mod normalize;
pub mod partition;
pub mod reconcile;
pub mod window;

use crate::assemble::assemble_catalog;
use crate::classify::{Classifier, ClassifierRules};
use crate::normalize::{normalize_batch, ConversionError, SkippedListing};
use crate::partition::{partition_catalog, CatalogPartitions};
use crate::reconcile::{DecisionRecord, MergeStats, ReconciliationEngine, VersionPolicy};
pub use crate::window::SyncWindow;

pub const CRATE_NAME: &str = "ipadb-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub feed_url: String,
    pub data_dir: String,
    pub catalog_path: String,
    pub keys_path: String,
    /// Local directory backend; when unset the GitHub backend is used.
    pub store_dir: Option<PathBuf>,
    pub github_api_url: String,
    pub github_owner: String,
    pub github_repo: String,
    pub github_branch: String,
    pub github_token: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub scheduled_window: SyncWindow,
    pub conflict_retries: usize,
    pub version_policy: VersionPolicy,
    pub rules_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            feed_url: APPTESTERS_FEED_URL.to_string(),
            data_dir: "public/data".to_string(),
            catalog_path: "public/data/ipa.json".to_string(),
            keys_path: "public/data/keys.json".to_string(),
            store_dir: None,
            github_api_url: "https://api.github.com".to_string(),
            github_owner: "abcxyznd".to_string(),
            github_repo: "vipapp".to_string(),
            github_branch: "main".to_string(),
            github_token: None,
            user_agent: "ipadb-bot/0.1".to_string(),
            http_timeout_secs: 20,
            scheduler_enabled: false,
            sync_cron: "0 0 */6 * * *".to_string(),
            scheduled_window: SyncWindow::LastHours(24),
            conflict_retries: 2,
            version_policy: VersionPolicy::RetainAll,
            rules_path: None,
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_flag(key: &str) -> bool {
    env_string(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, SyncError> {
        let defaults = Self::default();
        let data_dir = env_string("IPADB_DATA_DIR").unwrap_or(defaults.data_dir);
        let data_dir = data_dir.trim_end_matches('/').to_string();
        let version_policy = match env_string("IPADB_VERSION_POLICY") {
            Some(raw) => raw.parse().map_err(SyncError::Config)?,
            None => defaults.version_policy,
        };
        let scheduled_window = match env_string("IPADB_SCHEDULED_WINDOW") {
            Some(raw) => raw.parse().map_err(SyncError::Config)?,
            None => defaults.scheduled_window,
        };

        Ok(Self {
            feed_url: env_string("IPADB_FEED_URL").unwrap_or(defaults.feed_url),
            catalog_path: env_string("IPADB_CATALOG_PATH")
                .unwrap_or_else(|| format!("{data_dir}/ipa.json")),
            keys_path: env_string("IPADB_KEYS_PATH")
                .unwrap_or_else(|| format!("{data_dir}/keys.json")),
            data_dir,
            store_dir: env_string("IPADB_STORE_DIR").map(PathBuf::from),
            github_api_url: env_string("GITHUB_API_URL").unwrap_or(defaults.github_api_url),
            github_owner: env_string("GITHUB_OWNER").unwrap_or(defaults.github_owner),
            github_repo: env_string("GITHUB_REPO").unwrap_or(defaults.github_repo),
            github_branch: env_string("GITHUB_BRANCH").unwrap_or(defaults.github_branch),
            github_token: env_string("GITHUB_TOKEN"),
            user_agent: env_string("IPADB_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_string("IPADB_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            scheduler_enabled: env_flag("IPADB_SCHEDULER_ENABLED"),
            sync_cron: env_string("IPADB_SYNC_CRON").unwrap_or(defaults.sync_cron),
            scheduled_window,
            conflict_retries: env_string("IPADB_CONFLICT_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.conflict_retries),
            version_policy,
            rules_path: env_string("IPADB_RULES_FILE").map(PathBuf::from),
        })
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// Builds the configured blob store: a local directory when `store_dir` is
/// set, the GitHub contents API otherwise.
pub fn build_store(config: &SyncConfig) -> Result<Arc<dyn BlobStore>, SyncError> {
    if let Some(dir) = &config.store_dir {
        return Ok(Arc::new(FileBlobStore::new(dir.clone())));
    }
    let token = config
        .github_token
        .clone()
        .ok_or_else(|| SyncError::Config("GITHUB_TOKEN not configured".to_string()))?;
    let store = GitHubContentsStore::new(GitHubConfig {
        api_base: config.github_api_url.clone(),
        owner: config.github_owner.clone(),
        repo: config.github_repo.clone(),
        branch: config.github_branch.clone(),
        token,
        user_agent: config.user_agent.clone(),
        timeout: config.http_timeout(),
    })
    .map_err(|err| SyncError::Config(format!("{err:#}")))?;
    Ok(Arc::new(store))
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("feed unavailable: {0}")]
    FeedUnavailable(#[source] AdapterError),
    #[error("invalid feed format: {0}")]
    FeedFormatInvalid(String),
    #[error("failed to read catalog: {0}")]
    StoreReadFailed(#[source] StoreError),
    #[error("catalog at {path} changed since it was read; retry the sync")]
    StoreWriteConflict { path: String },
    #[error("failed to write catalog: {0}")]
    StoreWriteFailed(#[source] StoreError),
    #[error("merge would shrink the catalog from {before} to {after} entries; refusing to write")]
    DataLossInvariant { before: usize, after: usize },
    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    fn from_adapter(err: AdapterError) -> Self {
        match err {
            AdapterError::Format(message) => Self::FeedFormatInvalid(message),
            other => Self::FeedUnavailable(other),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::FeedUnavailable(_) => "FeedUnavailable",
            Self::FeedFormatInvalid(_) => "FeedFormatInvalid",
            Self::StoreReadFailed(_) => "StoreReadFailed",
            Self::StoreWriteConflict { .. } => "StoreWriteConflict",
            Self::StoreWriteFailed(_) => "StoreWriteFailed",
            Self::DataLossInvariant { .. } => "DataLossInvariant",
            Self::Config(_) => "Config",
        }
    }

    /// Whether running the whole cycle again could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StoreWriteConflict { .. } => true,
            Self::FeedUnavailable(err) => err.is_transient(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub run_id: Uuid,
    pub window: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Feed elements seen, decodable or not.
    pub fetched: usize,
    pub in_window: usize,
    pub skipped: usize,
    pub new: usize,
    pub version_updates: usize,
    pub duplicates: usize,
    pub superseded: usize,
    pub automated_total: usize,
    pub curated_total: usize,
    pub unrecognized_total: usize,
    pub total_before: usize,
    pub total_after: usize,
    pub written: bool,
    pub version_token: Option<String>,
    pub skipped_listings: Vec<SkippedListing>,
}

/// Result of merging a candidate batch into a stored catalog.
#[derive(Debug, Clone)]
pub struct MergedCatalog {
    pub catalog: Vec<CatalogRecord>,
    pub decisions: Vec<DecisionRecord>,
    pub stats: MergeStats,
    pub automated_total: usize,
    pub curated_total: usize,
    pub unrecognized_total: usize,
    pub total_before: usize,
}

/// Records the guard counts for `policy`: every record under `RetainAll`,
/// automated identities plus everything else under `LatestOnly`.
pub fn retained_units(policy: VersionPolicy, records: &[CatalogRecord]) -> usize {
    match policy {
        VersionPolicy::RetainAll => records.len(),
        VersionPolicy::LatestOnly => {
            let mut identities = HashSet::new();
            let mut other = 0;
            for record in records {
                match (record.provenance(), record.identity_key()) {
                    (Provenance::Automated, Some(identity)) => {
                        identities.insert(identity);
                    }
                    _ => other += 1,
                }
            }
            identities.len() + other
        }
    }
}

pub fn ensure_no_loss(
    policy: VersionPolicy,
    before: &[CatalogRecord],
    after: &[CatalogRecord],
) -> Result<(), SyncError> {
    let before = retained_units(policy, before);
    let after = retained_units(policy, after);
    if after < before {
        return Err(SyncError::DataLossInvariant { before, after });
    }
    Ok(())
}

/// Pure merge step: partition, reconcile the automated partition, reassemble
/// and check nothing was lost.
pub fn merge_catalog(
    engine: &ReconciliationEngine,
    stored: Vec<CatalogRecord>,
    incoming: Vec<CatalogEntry>,
) -> Result<MergedCatalog, SyncError> {
    let total_before = stored.len();
    let before = stored.clone();
    let parts = partition_catalog(stored);
    let curated_total = parts.curated.len();
    let unrecognized_total = parts.unrecognized.len();

    let outcome = engine.reconcile(parts.automated, incoming);
    let automated_total = outcome.entries.len();
    let catalog = assemble_catalog(CatalogPartitions {
        automated: outcome.entries,
        curated: parts.curated,
        unrecognized: parts.unrecognized,
    });
    ensure_no_loss(engine.policy(), &before, &catalog)?;

    Ok(MergedCatalog {
        catalog,
        decisions: outcome.decisions,
        stats: outcome.stats,
        automated_total,
        curated_total,
        unrecognized_total,
        total_before,
    })
}

pub fn commit_message(stats: &MergeStats, window: SyncWindow) -> String {
    format!(
        "Sync: +{} new, ~{} version updates ({window})",
        stats.new, stats.version_updates
    )
}

pub struct SyncPipeline {
    config: SyncConfig,
    http: HttpFetcher,
    feed: Box<dyn FeedAdapter>,
    store: Arc<dyn BlobStore>,
    classifier: Classifier,
    engine: ReconciliationEngine,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        feed: Box<dyn FeedAdapter>,
        store: Arc<dyn BlobStore>,
    ) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout(),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let classifier = match &config.rules_path {
            Some(path) => Classifier::new(ClassifierRules::from_yaml_path(path)?),
            None => Classifier::default(),
        };
        let engine = ReconciliationEngine::new(config.version_policy);
        Ok(Self {
            config,
            http,
            feed,
            store,
            classifier,
            engine,
        })
    }

    /// Live feed plus the configured store.
    pub fn from_config(config: SyncConfig) -> Result<Self> {
        let store = build_store(&config)?;
        let feed = Box::new(AppTestersAdapter::new(config.feed_url.clone()));
        Self::new(config, feed, store)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn BlobStore> {
        Arc::clone(&self.store)
    }

    /// One read-modify-write cycle. Any error leaves the stored catalog as it
    /// was.
    pub async fn run_once(&self, window: SyncWindow) -> Result<SyncReport, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, %window, store = %self.store.describe());
        self.run_cycle(run_id, window).instrument(span).await
    }

    async fn run_cycle(&self, run_id: Uuid, window: SyncWindow) -> Result<SyncReport, SyncError> {
        let started_at = Utc::now();
        let ctx = AdapterContext {
            run_id,
            fetched_at: started_at,
        };
        let fetched = self
            .feed
            .fetch_feed(&self.http, &ctx)
            .await
            .map_err(SyncError::from_adapter)?;
        let parsed = self.feed.parse_feed(&fetched).map_err(SyncError::from_adapter)?;

        let mut skipped_listings: Vec<SkippedListing> = parsed
            .rejected
            .iter()
            .map(|rejected| {
                warn!(index = rejected.index, reason = %rejected.reason, "undecodable feed element");
                SkippedListing {
                    index: rejected.index,
                    name: rejected.name.clone(),
                    reason: ConversionError::Undecodable(rejected.reason.clone()).to_string(),
                }
            })
            .collect();
        let fetched_count = parsed.records.len() + parsed.rejected.len();

        let in_window = window.filter(parsed.records, started_at);
        let batch = normalize_batch(&self.classifier, &in_window, started_at);
        skipped_listings.extend(batch.skipped);

        let path = self.config.catalog_path.as_str();
        let snapshot = read_json_array::<CatalogRecord>(self.store.as_ref(), path)
            .await
            .map_err(SyncError::StoreReadFailed)?;
        let merged = merge_catalog(&self.engine, snapshot.items, batch.entries)?;

        let mut report = SyncReport {
            run_id,
            window: window.to_string(),
            started_at,
            finished_at: started_at,
            fetched: fetched_count,
            in_window: in_window.len(),
            skipped: skipped_listings.len(),
            new: merged.stats.new,
            version_updates: merged.stats.version_updates,
            duplicates: merged.stats.duplicates,
            superseded: merged.stats.superseded,
            automated_total: merged.automated_total,
            curated_total: merged.curated_total,
            unrecognized_total: merged.unrecognized_total,
            total_before: merged.total_before,
            total_after: merged.catalog.len(),
            written: false,
            version_token: snapshot.version.as_ref().map(ToString::to_string),
            skipped_listings,
        };

        if !merged.stats.changed() {
            info!(duplicates = report.duplicates, "catalog already up to date; nothing written");
            report.finished_at = Utc::now();
            return Ok(report);
        }

        let message = commit_message(&merged.stats, window);
        let token = write_json_array(
            self.store.as_ref(),
            path,
            &merged.catalog,
            snapshot.version.as_ref(),
            &message,
        )
        .await
        .map_err(|err| {
            if err.is_conflict() {
                SyncError::StoreWriteConflict {
                    path: path.to_string(),
                }
            } else {
                SyncError::StoreWriteFailed(err)
            }
        })?;

        report.written = true;
        report.version_token = Some(token.to_string());
        report.finished_at = Utc::now();
        info!(
            new = report.new,
            version_updates = report.version_updates,
            duplicates = report.duplicates,
            skipped = report.skipped,
            total = report.total_after,
            "catalog synced"
        );
        Ok(report)
    }

    /// Re-runs the cycle on write conflicts, up to `conflict_retries` extra
    /// attempts. Each attempt re-reads the catalog.
    pub async fn run_with_conflict_retry(&self, window: SyncWindow) -> Result<SyncReport, SyncError> {
        let mut attempt = 0usize;
        loop {
            match self.run_once(window).await {
                Err(err @ SyncError::StoreWriteConflict { .. })
                    if attempt < self.config.conflict_retries =>
                {
                    attempt += 1;
                    warn!(attempt, error = %err, "catalog changed underneath the sync; retrying");
                }
                other => return other,
            }
        }
    }
}

/// Registers the periodic sync job when the scheduler is enabled.
pub async fn maybe_build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config.sync_cron.clone();
    let window = pipeline.config.scheduled_window;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_with_conflict_retry(window).await {
                Ok(report) => info!(
                    run_id = %report.run_id,
                    new = report.new,
                    version_updates = report.version_updates,
                    "scheduled sync finished"
                ),
                Err(err) => error!(error = %err, kind = err.kind(), "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub async fn run_sync_once_from_env(window: SyncWindow) -> Result<SyncReport> {
    let config = SyncConfig::from_env()?;
    let pipeline = SyncPipeline::from_config(config)?;
    Ok(pipeline.run_with_conflict_retry(window).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ipadb_adapters::FixtureFeedAdapter;
    use ipadb_storage::{MemoryBlobStore, StoredBlob, VersionToken};
    use serde_json::{json, Value as JsonValue};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CATALOG: &str = "public/data/ipa.json";
    const FEED: &[u8] = include_bytes!("../../../fixtures/apptesters/sample/feed.json");

    fn pipeline_with(store: Arc<dyn BlobStore>, feed: &[u8]) -> SyncPipeline {
        SyncPipeline::new(
            SyncConfig::default(),
            Box::new(FixtureFeedAdapter::from_bytes("memory://feed", feed.to_vec())),
            store,
        )
        .unwrap()
    }

    fn stored_catalog(store: &MemoryBlobStore) -> Vec<JsonValue> {
        serde_json::from_slice(&store.get(CATALOG).unwrap()).unwrap()
    }

    fn names(catalog: &[JsonValue]) -> Vec<&str> {
        catalog
            .iter()
            .map(|v| v.get("name").and_then(JsonValue::as_str).unwrap_or("?"))
            .collect()
    }

    #[tokio::test]
    async fn first_run_creates_catalog_and_second_run_is_a_no_op() {
        let store = MemoryBlobStore::new();
        let pipeline = pipeline_with(Arc::new(store.clone()), FEED);

        let report = pipeline.run_once(SyncWindow::Full).await.unwrap();
        assert!(report.written);
        assert_eq!(report.fetched, 5);
        assert_eq!(report.in_window, 4);
        assert_eq!(report.new, 3);
        assert_eq!(report.skipped, 2);
        assert_eq!(store.writes().len(), 1);
        assert_eq!(store.writes()[0].expected, None);
        assert_eq!(
            store.writes()[0].message,
            "Sync: +3 new, ~0 version updates (full)"
        );

        let first = store.get(CATALOG).unwrap();
        assert_eq!(
            names(&stored_catalog(&store)),
            vec!["Spotify++", "Lightroom Photo Editor", "Calm Notes"]
        );

        let again = pipeline.run_once(SyncWindow::Full).await.unwrap();
        assert!(!again.written);
        assert_eq!(again.new + again.version_updates, 0);
        assert_eq!(again.duplicates, 3);
        assert_eq!(store.writes().len(), 1);
        assert_eq!(store.get(CATALOG).unwrap(), first);
    }

    #[tokio::test]
    async fn curated_and_unknown_entries_pass_through_untouched() {
        let store = MemoryBlobStore::new();
        let curated_old = json!({"name": "Hand Old", "source": "manual", "date": "2024-01-01", "custom": {"k": [1, 2]}});
        let curated_new = json!({"name": "Spotify++", "bundleID": "com.spotify.client", "version": "9.0.12", "source": "manual", "date": "2025-06-01"});
        let legacy = json!({"name": "Legacy", "source": "old-bot", "weird": null});
        let scalar = json!("not even an object");
        let automated = json!({"name": "Calm Notes", "version": "2.2", "source": "apptesters", "date": "2026-01-01"});
        store.insert(
            CATALOG,
            serde_json::to_vec(&json!([legacy, curated_old, automated, scalar, curated_new])).unwrap(),
        );

        let pipeline = pipeline_with(Arc::new(store.clone()), FEED);
        let report = pipeline.run_once(SyncWindow::Full).await.unwrap();
        // Curated Spotify++ does not count as present for the automated path.
        assert_eq!(report.new, 2);
        assert_eq!(report.version_updates, 1);
        assert_eq!(report.curated_total, 2);
        assert_eq!(report.unrecognized_total, 2);
        assert_eq!(report.total_before, 5);
        assert_eq!(report.total_after, 8);

        let catalog = stored_catalog(&store);
        assert_eq!(
            &catalog[4..],
            &[curated_new, curated_old, legacy, scalar][..]
        );
        assert_eq!(
            names(&catalog[..4]),
            vec!["Spotify++", "Lightroom Photo Editor", "Calm Notes", "Calm Notes"]
        );
        assert_eq!(catalog[3], automated);
    }

    #[tokio::test]
    async fn window_limits_candidates() {
        let store = MemoryBlobStore::new();
        let pipeline = pipeline_with(Arc::new(store.clone()), FEED);
        // Fixture dates are fixed, so nothing is "today".
        let report = pipeline.run_once(SyncWindow::LastHours(1)).await.unwrap();
        assert_eq!(report.in_window, 0);
        assert!(!report.written);
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn feed_without_apps_array_aborts_without_writing() {
        let store = MemoryBlobStore::new();
        store.insert(CATALOG, b"[]".to_vec());
        let pipeline = pipeline_with(Arc::new(store.clone()), br#"[{"name": "x"}]"#);
        let err = pipeline.run_once(SyncWindow::Full).await.unwrap_err();
        assert!(matches!(err, SyncError::FeedFormatInvalid(_)));
        assert!(err.to_string().contains("invalid feed format"));
        assert!(!err.is_retryable());
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn unreadable_catalog_aborts() {
        let store = MemoryBlobStore::new();
        store.fail_reads("public/");
        let pipeline = pipeline_with(Arc::new(store.clone()), FEED);
        let err = pipeline.run_once(SyncWindow::Full).await.unwrap_err();
        assert_eq!(err.kind(), "StoreReadFailed");
        assert!(store.writes().is_empty());
    }

    /// Lets another writer bump the catalog between our read and our write,
    /// `races` times.
    struct RacingStore {
        inner: MemoryBlobStore,
        races: AtomicUsize,
    }

    #[async_trait]
    impl BlobStore for RacingStore {
        fn describe(&self) -> String {
            "racing".into()
        }

        async fn read(&self, path: &str) -> Result<Option<StoredBlob>, StoreError> {
            let blob = self.inner.read(path).await?;
            if self
                .races
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                let other = json!([{"name": "Other Writer", "source": "manual"}]);
                self.inner.insert(path, serde_json::to_vec(&other).unwrap());
            }
            Ok(blob)
        }

        async fn write(
            &self,
            path: &str,
            bytes: Vec<u8>,
            expected: Option<&VersionToken>,
            message: &str,
        ) -> Result<VersionToken, StoreError> {
            self.inner.write(path, bytes, expected, message).await
        }
    }

    #[tokio::test]
    async fn stale_token_conflicts_and_leaves_blob_alone() {
        let inner = MemoryBlobStore::new();
        inner.insert(CATALOG, b"[]".to_vec());
        let store = Arc::new(RacingStore {
            inner: inner.clone(),
            races: AtomicUsize::new(1),
        });
        let pipeline = pipeline_with(store, FEED);

        let err = pipeline.run_once(SyncWindow::Full).await.unwrap_err();
        assert!(matches!(err, SyncError::StoreWriteConflict { .. }));
        assert!(err.is_retryable());
        assert_eq!(names(&stored_catalog(&inner)), vec!["Other Writer"]);
        assert!(inner.writes().is_empty());
    }

    #[tokio::test]
    async fn conflict_retry_rereads_and_keeps_the_other_write() {
        let inner = MemoryBlobStore::new();
        inner.insert(CATALOG, b"[]".to_vec());
        let store = Arc::new(RacingStore {
            inner: inner.clone(),
            races: AtomicUsize::new(1),
        });
        let pipeline = pipeline_with(store, FEED);

        let report = pipeline.run_with_conflict_retry(SyncWindow::Full).await.unwrap();
        assert!(report.written);
        let catalog = stored_catalog(&inner);
        assert_eq!(catalog.len(), 4);
        assert_eq!(names(&catalog)[3], "Other Writer");
    }

    #[tokio::test]
    async fn conflict_retries_are_bounded() {
        let inner = MemoryBlobStore::new();
        let store = Arc::new(RacingStore {
            inner: inner.clone(),
            races: AtomicUsize::new(10),
        });
        let pipeline = pipeline_with(store, FEED);
        let err = pipeline.run_with_conflict_retry(SyncWindow::Full).await.unwrap_err();
        assert_eq!(err.kind(), "StoreWriteConflict");
        assert!(inner.writes().is_empty());
    }

    #[tokio::test]
    async fn env_driven_run_rejects_bad_configuration() {
        std::env::set_var("IPADB_SCHEDULED_WINDOW", "fortnight");
        let err = run_sync_once_from_env(SyncWindow::Full).await.unwrap_err();
        std::env::remove_var("IPADB_SCHEDULED_WINDOW");
        let err = err.downcast_ref::<SyncError>().unwrap();
        assert_eq!(err.kind(), "Config");
    }

    #[test]
    fn merge_never_drops_stored_records() {
        let engine = ReconciliationEngine::default();
        let stored: Vec<CatalogRecord> = vec![
            json!({"name": "A", "version": "1", "source": "apptesters"}).into(),
            json!({"name": "A", "version": "1", "source": "apptesters"}).into(),
            json!({"version": "1", "source": "apptesters"}).into(),
            json!({"name": "B", "source": "manual"}).into(),
            json!(null).into(),
        ];
        let merged = merge_catalog(&engine, stored.clone(), Vec::new()).unwrap();
        assert_eq!(merged.catalog.len(), stored.len());
        for record in &stored {
            assert!(merged.catalog.contains(record));
        }
    }

    #[test]
    fn data_loss_guard_counts_by_policy() {
        let stored: Vec<CatalogRecord> = vec![
            json!({"name": "A", "version": "1", "source": "apptesters"}).into(),
            json!({"name": "A", "version": "2", "source": "apptesters"}).into(),
            json!({"name": "B", "source": "manual"}).into(),
        ];
        let shrunk = vec![stored[1].clone(), stored[2].clone()];
        let err = ensure_no_loss(VersionPolicy::RetainAll, &stored, &shrunk).unwrap_err();
        assert!(matches!(err, SyncError::DataLossInvariant { before: 3, after: 2 }));
        assert!(ensure_no_loss(VersionPolicy::LatestOnly, &stored, &shrunk).is_ok());
        assert!(ensure_no_loss(VersionPolicy::LatestOnly, &stored, &shrunk[1..]).is_err());
    }

    #[test]
    fn retryability_follows_error_kind() {
        assert!(SyncError::StoreWriteConflict { path: CATALOG.into() }.is_retryable());
        assert!(!SyncError::DataLossInvariant { before: 2, after: 1 }.is_retryable());
        assert!(!SyncError::Config("x".into()).is_retryable());
    }

    #[test]
    fn filesystem_backend_wins_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig {
            store_dir: Some(dir.path().to_path_buf()),
            ..SyncConfig::default()
        };
        let store = build_store(&config).unwrap();
        assert!(store.describe().starts_with("file:"));

        let err = build_store(&SyncConfig::default()).err().unwrap();
        assert_eq!(err.kind(), "Config");
    }
}

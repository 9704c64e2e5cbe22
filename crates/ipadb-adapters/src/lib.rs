//! Feed adapter contracts + the AppTesters feed adapter.

use std::fs;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipadb_core::ListingRecord;
use ipadb_storage::{FetchError, HttpFetcher, RetryDisposition};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ipadb-adapters";

pub const APPTESTERS_SOURCE_ID: &str = "apptesters";
pub const APPTESTERS_FEED_URL: &str = "https://repository.apptesters.org/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFeed {
    pub source_id: String,
    pub url: String,
    pub fetched_at: DateTime<Utc>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("feed unavailable: {0}")]
    Unavailable(#[from] FetchError),
    #[error("malformed feed body: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("invalid feed format: {0}")]
    Format(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    /// Whether retrying the whole fetch could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(err) if err.disposition() == RetryDisposition::Retryable)
    }
}

/// A feed element that could not be decoded as a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRecord {
    pub index: usize,
    pub name: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedFeed {
    pub records: Vec<ListingRecord>,
    pub rejected: Vec<RejectedRecord>,
}

#[async_trait]
pub trait FeedAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_feed(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<FetchedFeed, AdapterError>;

    fn parse_feed(&self, feed: &FetchedFeed) -> Result<ParsedFeed, AdapterError>;
}

/// Parses an `{ "apps": [...] }` document. Elements that do not decode are
/// reported in `rejected` instead of failing the whole document.
pub fn parse_apps_document(body: &[u8]) -> Result<ParsedFeed, AdapterError> {
    let document: JsonValue = serde_json::from_slice(body).map_err(AdapterError::Malformed)?;
    let apps = document
        .get("apps")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| AdapterError::Format("no `apps` array in feed document".to_string()))?;

    let mut parsed = ParsedFeed::default();
    for (index, app) in apps.iter().enumerate() {
        match serde_json::from_value::<ListingRecord>(app.clone()) {
            Ok(record) => parsed.records.push(record),
            Err(err) => parsed.rejected.push(RejectedRecord {
                index,
                name: app
                    .get("name")
                    .and_then(JsonValue::as_str)
                    .map(ToString::to_string),
                reason: err.to_string(),
            }),
        }
    }
    Ok(parsed)
}

/// Live AppTesters repository feed.
#[derive(Debug, Clone)]
pub struct AppTestersAdapter {
    feed_url: String,
}

impl AppTestersAdapter {
    pub fn new(feed_url: impl Into<String>) -> Self {
        Self {
            feed_url: feed_url.into(),
        }
    }
}

impl Default for AppTestersAdapter {
    fn default() -> Self {
        Self::new(APPTESTERS_FEED_URL)
    }
}

#[async_trait]
impl FeedAdapter for AppTestersAdapter {
    fn source_id(&self) -> &'static str {
        APPTESTERS_SOURCE_ID
    }

    async fn fetch_feed(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<FetchedFeed, AdapterError> {
        let resp = http
            .fetch_bytes(ctx.run_id, self.source_id(), &self.feed_url)
            .await?;
        debug!(bytes = resp.body.len(), url = %resp.final_url, "fetched feed");
        Ok(FetchedFeed {
            source_id: self.source_id().to_string(),
            url: resp.final_url,
            fetched_at: ctx.fetched_at,
            body: resp.body,
        })
    }

    fn parse_feed(&self, feed: &FetchedFeed) -> Result<ParsedFeed, AdapterError> {
        parse_apps_document(&feed.body)
    }
}

/// Serves a feed document captured on disk or in memory instead of the network.
#[derive(Debug, Clone)]
pub struct FixtureFeedAdapter {
    origin: String,
    body: Vec<u8>,
}

impl FixtureFeedAdapter {
    pub fn from_bytes(origin: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            origin: origin.into(),
            body: body.into(),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let body = fs::read(path).with_context(|| format!("reading feed fixture {}", path.display()))?;
        Ok(Self::from_bytes(format!("file://{}", path.display()), body))
    }
}

#[async_trait]
impl FeedAdapter for FixtureFeedAdapter {
    fn source_id(&self) -> &'static str {
        APPTESTERS_SOURCE_ID
    }

    async fn fetch_feed(
        &self,
        _http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<FetchedFeed, AdapterError> {
        Ok(FetchedFeed {
            source_id: self.source_id().to_string(),
            url: self.origin.clone(),
            fetched_at: ctx.fetched_at,
            body: self.body.clone(),
        })
    }

    fn parse_feed(&self, feed: &FetchedFeed) -> Result<ParsedFeed, AdapterError> {
        parse_apps_document(&feed.body)
    }
}

pub fn adapter_for_source(source_id: &str, feed_url: &str) -> Option<Box<dyn FeedAdapter>> {
    match source_id {
        APPTESTERS_SOURCE_ID => Some(Box::new(AppTestersAdapter::new(feed_url))),
        _ => None,
    }
}

//! HTTP fetch utilities and the versioned blob store gateway for ipadb.
//!
//! Every store write is conditional on the version token observed by the
//! preceding read, so two writers racing on the same path cannot silently
//! clobber each other.

use std::fmt;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

mod fs_store;
mod github;
mod memory;

pub use fs_store::FileBlobStore;
pub use github::{GitHubConfig, GitHubContentsStore};
pub use memory::{MemoryBlobStore, RecordedWrite};

pub const CRATE_NAME: &str = "ipadb-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// GET-only client for upstream feeds, with a request timeout and bounded
/// retries on transient failures.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request(err) => classify_reqwest_error(err),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .default_headers(headers)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let outcome = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }
                    FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    }
                }
                Err(err) => FetchError::Request(err),
            };

            if outcome.disposition() == RetryDisposition::NonRetryable
                || attempt >= self.backoff.max_retries
            {
                return Err(outcome);
            }
            debug!(attempt, error = %outcome, "retrying fetch");
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

/// Opaque revision marker of a stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(String);

impl VersionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub bytes: Vec<u8>,
    pub version: VersionToken,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("version conflict writing {path} (expected {expected:?})")]
    Conflict {
        path: String,
        expected: Option<VersionToken>,
    },
    #[error("store returned http status {status} for {path}: {message}")]
    HttpStatus {
        status: u16,
        path: String,
        message: String,
    },
    #[error("store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("undecodable content at {path}: {message}")]
    Decode { path: String, message: String },
    #[error("stored document at {path} is not a JSON array")]
    NotAnArray { path: String },
    #[error("invalid store path {path}")]
    InvalidPath { path: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Versioned key-value blob store addressed by path.
///
/// `write` with `expected == None` creates the blob and must fail with
/// [`StoreError::Conflict`] if it already exists; with `Some(token)` it must
/// fail unless the current revision is exactly `token`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    fn describe(&self) -> String;

    async fn read(&self, path: &str) -> Result<Option<StoredBlob>, StoreError>;

    async fn write(
        &self,
        path: &str,
        bytes: Vec<u8>,
        expected: Option<&VersionToken>,
        message: &str,
    ) -> Result<VersionToken, StoreError>;
}

/// A JSON array read from the store together with the revision it came from.
/// `version == None` means the document did not exist.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonSnapshot<T> {
    pub items: Vec<T>,
    pub version: Option<VersionToken>,
}

impl<T> JsonSnapshot<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            version: None,
        }
    }
}

/// Reads a JSON array document. A missing document is an empty snapshot.
pub async fn read_json_array<T: DeserializeOwned>(
    store: &dyn BlobStore,
    path: &str,
) -> Result<JsonSnapshot<T>, StoreError> {
    let Some(blob) = store.read(path).await? else {
        debug!(path, store = %store.describe(), "document not found, starting empty");
        return Ok(JsonSnapshot::empty());
    };

    let value: JsonValue = serde_json::from_slice(&blob.bytes).map_err(|e| StoreError::Decode {
        path: path.to_string(),
        message: e.to_string(),
    })?;
    if !value.is_array() {
        return Err(StoreError::NotAnArray {
            path: path.to_string(),
        });
    }
    let items = serde_json::from_value(value).map_err(|e| StoreError::Decode {
        path: path.to_string(),
        message: e.to_string(),
    })?;
    Ok(JsonSnapshot {
        items,
        version: Some(blob.version),
    })
}

/// Replaces a JSON array document, conditional on `expected`.
pub async fn write_json_array<T: Serialize>(
    store: &dyn BlobStore,
    path: &str,
    items: &[T],
    expected: Option<&VersionToken>,
    message: &str,
) -> Result<VersionToken, StoreError> {
    let bytes = serde_json::to_vec_pretty(items).map_err(|e| StoreError::Decode {
        path: path.to_string(),
        message: e.to_string(),
    })?;
    store.write(path, bytes, expected, message).await
}

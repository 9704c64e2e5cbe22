//! GitHub contents API backend.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::{BlobStore, StoreError, StoredBlob, VersionToken};

#[derive(Debug, Clone)]
pub struct GitHubConfig {
    pub api_base: String,
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub token: String,
    pub user_agent: String,
    pub timeout: Duration,
}

/// Reads and writes files in a repository through `/repos/{owner}/{repo}/contents`.
/// The blob `sha` doubles as the version token.
#[derive(Debug, Clone)]
pub struct GitHubContentsStore {
    client: reqwest::Client,
    config: GitHubConfig,
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    sha: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
}

#[derive(Debug, Serialize)]
struct PutContentsRequest<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct PutContentsResponse {
    content: PutContentsFile,
}

#[derive(Debug, Deserialize)]
struct PutContentsFile {
    sha: String,
}

impl GitHubContentsStore {
    pub fn new(config: GitHubConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github.v3+json"),
        );
        let mut auth = HeaderValue::from_str(&format!("token {}", config.token))
            .context("GitHub token is not a valid header value")?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout)
            .build()
            .context("building GitHub client")?;
        Ok(Self { client, config })
    }

    pub fn contents_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/contents/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.owner,
            self.config.repo,
            path.trim_start_matches('/')
        )
    }

    fn decode_content(path: &str, body: ContentsResponse) -> Result<StoredBlob, StoreError> {
        let decode_err = |message: String| StoreError::Decode {
            path: path.to_string(),
            message,
        };
        if let Some(encoding) = body.encoding.as_deref().filter(|e| *e != "base64") {
            return Err(decode_err(format!("unsupported content encoding {encoding}")));
        }
        let content = body
            .content
            .ok_or_else(|| decode_err("response carries no inline content".to_string()))?;
        let compact: String = content.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        let bytes = BASE64
            .decode(compact)
            .map_err(|e| decode_err(e.to_string()))?;
        Ok(StoredBlob {
            bytes,
            version: VersionToken::new(body.sha),
        })
    }
}

async fn error_body(resp: reqwest::Response) -> String {
    resp.text().await.unwrap_or_default()
}

#[async_trait]
impl BlobStore for GitHubContentsStore {
    fn describe(&self) -> String {
        format!(
            "github:{}/{}@{}",
            self.config.owner, self.config.repo, self.config.branch
        )
    }

    async fn read(&self, path: &str) -> Result<Option<StoredBlob>, StoreError> {
        let url = self.contents_url(path);
        let span = info_span!("store_read", path, backend = "github");
        let resp = self
            .client
            .get(&url)
            .query(&[("ref", self.config.branch.as_str())])
            .send()
            .instrument(span)
            .await?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(StoreError::HttpStatus {
                status: status.as_u16(),
                path: path.to_string(),
                message: error_body(resp).await,
            });
        }
        let body: ContentsResponse = resp.json().await?;
        Self::decode_content(path, body).map(Some)
    }

    async fn write(
        &self,
        path: &str,
        bytes: Vec<u8>,
        expected: Option<&VersionToken>,
        message: &str,
    ) -> Result<VersionToken, StoreError> {
        let url = self.contents_url(path);
        let request = PutContentsRequest {
            message,
            content: BASE64.encode(&bytes),
            branch: &self.config.branch,
            sha: expected.map(VersionToken::as_str),
        };
        let span = info_span!("store_write", path, backend = "github", bytes = bytes.len());
        let resp = self
            .client
            .put(&url)
            .json(&request)
            .send()
            .instrument(span)
            .await?;

        let status = resp.status();
        if status == StatusCode::CONFLICT || status == StatusCode::UNPROCESSABLE_ENTITY {
            return Err(StoreError::Conflict {
                path: path.to_string(),
                expected: expected.cloned(),
            });
        }
        if !status.is_success() {
            return Err(StoreError::HttpStatus {
                status: status.as_u16(),
                path: path.to_string(),
                message: error_body(resp).await,
            });
        }
        let body: PutContentsResponse = resp.json().await?;
        Ok(VersionToken::new(body.content.sha))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use axum::extract::{Path as AxumPath, State};
    use axum::http::StatusCode as AxumStatus;
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{json, Value as JsonValue};
    use tokio::net::TcpListener;

    type Files = Arc<Mutex<HashMap<String, (Vec<u8>, u64)>>>;

    async fn get_contents(
        State(files): State<Files>,
        AxumPath((_owner, _repo, path)): AxumPath<(String, String, String)>,
    ) -> Response {
        let files = files.lock().unwrap();
        match files.get(&path) {
            Some((bytes, rev)) => {
                let encoded = BASE64.encode(bytes);
                // GitHub wraps base64 bodies at 60 columns.
                let wrapped = encoded
                    .as_bytes()
                    .chunks(60)
                    .map(|c| std::str::from_utf8(c).unwrap())
                    .collect::<Vec<_>>()
                    .join("\n");
                Json(json!({"sha": format!("sha{rev}"), "content": wrapped, "encoding": "base64"}))
                    .into_response()
            }
            None => (AxumStatus::NOT_FOUND, "Not Found").into_response(),
        }
    }

    async fn put_contents(
        State(files): State<Files>,
        AxumPath((_owner, _repo, path)): AxumPath<(String, String, String)>,
        Json(body): Json<JsonValue>,
    ) -> Response {
        let mut files = files.lock().unwrap();
        let current = files.get(&path).map(|(_, rev)| format!("sha{rev}"));
        let supplied = body.get("sha").and_then(|v| v.as_str()).map(String::from);
        if current.is_some() && supplied.is_none() {
            return (AxumStatus::UNPROCESSABLE_ENTITY, "sha wasn't supplied").into_response();
        }
        if current != supplied {
            return (AxumStatus::CONFLICT, "does not match").into_response();
        }
        let bytes = BASE64
            .decode(body["content"].as_str().unwrap())
            .unwrap();
        let rev = current.map_or(1, |_| files[&path].1 + 1);
        files.insert(path, (bytes, rev));
        Json(json!({"content": {"sha": format!("sha{rev}")}})).into_response()
    }

    async fn spawn_fake_github() -> (String, Files) {
        let files: Files = Arc::default();
        let app = Router::new()
            .route(
                "/repos/{owner}/{repo}/contents/{*path}",
                get(get_contents).put(put_contents),
            )
            .with_state(files.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), files)
    }

    fn store_for(api_base: String) -> GitHubContentsStore {
        GitHubContentsStore::new(GitHubConfig {
            api_base,
            owner: "owner".into(),
            repo: "repo".into(),
            branch: "main".into(),
            token: "test-token".into(),
            user_agent: "ipadb-test".into(),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn round_trips_through_contents_api() {
        let (base, _files) = spawn_fake_github().await;
        let store = store_for(base);

        assert!(store.read("public/data/ipa.json").await.unwrap().is_none());

        let payload = serde_json::to_vec_pretty(&json!([{"name": "Foo", "desc": "x".repeat(200)}])).unwrap();
        let created = store
            .write("public/data/ipa.json", payload.clone(), None, "create")
            .await
            .unwrap();
        assert_eq!(created.as_str(), "sha1");

        let blob = store.read("public/data/ipa.json").await.unwrap().unwrap();
        assert_eq!(blob.bytes, payload);
        assert_eq!(blob.version, created);
    }

    #[tokio::test]
    async fn stale_sha_maps_to_conflict() {
        let (base, files) = spawn_fake_github().await;
        files
            .lock()
            .unwrap()
            .insert("public/data/ipa.json".into(), (b"[]".to_vec(), 4));
        let store = store_for(base);

        let err = store
            .write(
                "public/data/ipa.json",
                b"[1]".to_vec(),
                Some(&VersionToken::new("sha3")),
                "stale",
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let err = store
            .write("public/data/ipa.json", b"[1]".to_vec(), None, "blind create")
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(files.lock().unwrap()["public/data/ipa.json"].0, b"[]".to_vec());
    }

    #[test]
    fn contents_url_joins_segments() {
        let store = store_for("https://api.github.com/".into());
        assert_eq!(
            store.contents_url("/public/data/ipa.json"),
            "https://api.github.com/repos/owner/repo/contents/public/data/ipa.json"
        );
    }
}

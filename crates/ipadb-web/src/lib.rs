//! Axum JSON API for ipadb: sync triggers, license keys and curated uploads.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use ipadb_core::keys::{KeyRejection, NewKeyRequest};
use ipadb_storage::BlobStore;
use ipadb_sync::curated::{upload_curated_entry, UploadError};
use ipadb_sync::keys::{KeyLedger, LedgerError};
use ipadb_sync::{maybe_build_scheduler, SyncConfig, SyncError, SyncPipeline, SyncWindow};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "ipadb-web";

/// Shared secrets guarding the endpoints. An unset secret locks its
/// endpoints.
#[derive(Debug, Clone, Default)]
pub struct WebAuth {
    pub sync_token: Option<String>,
    pub cron_secret: Option<String>,
    pub bot_secret: Option<String>,
    pub admin_token: Option<String>,
}

impl WebAuth {
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        Self {
            sync_token: var("SYNC_TOKEN"),
            cron_secret: var("CRON_SECRET"),
            bot_secret: var("TELEGRAM_BOT_SECRET"),
            admin_token: var("ADMIN_TOKEN"),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
    pub keys: KeyLedger,
    pub store: Arc<dyn BlobStore>,
    pub data_dir: String,
    pub auth: WebAuth,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>, auth: WebAuth) -> Self {
        let store = pipeline.store();
        let config = pipeline.config();
        Self {
            keys: KeyLedger::new(Arc::clone(&store), config.keys_path.clone()),
            data_dir: config.data_dir.clone(),
            store,
            pipeline,
            auth,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/sync", post(sync_handler))
        .route("/api/cron/auto-sync", get(cron_sync_handler))
        .route("/api/keys/verify", post(verify_key_handler))
        .route("/api/keys/create", post(create_key_handler))
        .route("/api/keys/delete", post(delete_key_handler))
        .route("/api/keys/list", post(list_keys_handler))
        .route("/api/upload", post(upload_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("IPADB_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = SyncConfig::from_env()?;
    let pipeline = Arc::new(SyncPipeline::from_config(config)?);

    let scheduler = maybe_build_scheduler(Arc::clone(&pipeline)).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %pipeline.config().sync_cron, "sync scheduler started");
    }

    let state = AppState::new(pipeline, WebAuth::from_env());
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Error body shared by every endpoint.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: JsonValue,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({"success": false, "error": message.into()}),
        }
    }

    fn with(mut self, key: &str, value: JsonValue) -> Self {
        if let Some(map) = self.body.as_object_mut() {
            map.insert(key.to_string(), value);
        }
        self
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Unauthorized").with("code", json!("UNAUTHORIZED"))
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        let status = match &err {
            SyncError::StoreWriteConflict { .. } => StatusCode::CONFLICT,
            SyncError::FeedUnavailable(_) | SyncError::FeedFormatInvalid(_) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %err, kind = err.kind(), "sync failed");
        } else {
            warn!(error = %err, kind = err.kind(), "sync rejected");
        }
        let retryable = err.is_retryable();
        Self::new(status, err.to_string())
            .with("kind", json!(err.kind()))
            .with("retryable", json!(retryable))
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Rejected(rejection) => {
                let status = match rejection {
                    KeyRejection::NotFound => StatusCode::NOT_FOUND,
                    _ => StatusCode::FORBIDDEN,
                };
                let mut api = Self::new(status, rejection.to_string())
                    .with("code", json!(rejection.code()));
                match rejection {
                    KeyRejection::Expired { expired_at } => {
                        api = api.with("expiredAt", json!(expired_at));
                    }
                    KeyRejection::MaxUsesReached {
                        max_uses,
                        current_uses,
                    } => {
                        api = api
                            .with("maxUses", json!(max_uses))
                            .with("currentUses", json!(current_uses));
                    }
                    KeyRejection::NotFound | KeyRejection::Inactive => {}
                }
                api
            }
            LedgerError::Conflict { .. } => Self::new(StatusCode::CONFLICT, err.to_string())
                .with("retryable", json!(true)),
            LedgerError::Read(_) | LedgerError::Write(_) => {
                error!(error = %err, "key ledger failure");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        match &err {
            UploadError::Invalid(_) => Self::bad_request(err.to_string()),
            UploadError::Conflict { .. } => {
                Self::new(StatusCode::CONFLICT, err.to_string()).with("retryable", json!(true))
            }
            UploadError::Read { .. } | UploadError::Write { .. } => {
                error!(error = %err, "curated upload failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        }
    }
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

fn require_bearer(headers: &HeaderMap, accepted: &[Option<&String>]) -> Result<(), ApiError> {
    let supplied = bearer(headers).ok_or_else(ApiError::unauthorized)?;
    if accepted
        .iter()
        .flatten()
        .any(|secret| secret.as_str() == supplied)
    {
        Ok(())
    } else {
        Err(ApiError::unauthorized())
    }
}

fn require_bot_secret(state: &AppState, supplied: Option<&str>) -> Result<(), ApiError> {
    match (state.auth.bot_secret.as_deref(), supplied) {
        (Some(expected), Some(given)) if expected == given => Ok(()),
        _ => Err(ApiError::unauthorized()),
    }
}

/// Parses an optional JSON body; an empty body yields `T::default()`.
fn json_body<T: for<'de> Deserialize<'de> + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|err| ApiError::bad_request(format!("invalid JSON body: {err}")))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<JsonValue> {
    Json(json!({
        "ok": true,
        "store": state.store.describe(),
        "catalog": state.pipeline.config().catalog_path,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncRequest {
    #[serde(default)]
    sync_hours: Option<u32>,
    #[serde(default)]
    window: Option<String>,
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<JsonValue>, ApiError> {
    require_bearer(
        &headers,
        &[state.auth.sync_token.as_ref(), state.auth.cron_secret.as_ref()],
    )?;
    let request: SyncRequest = json_body(&body)?;
    let window = SyncWindow::from_request(request.sync_hours, request.window.as_deref())
        .map_err(ApiError::bad_request)?;

    let report = state.pipeline.run_with_conflict_retry(window).await?;
    Ok(Json(json!({"success": true, "report": report})))
}

async fn cron_sync_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<JsonValue>, ApiError> {
    require_bearer(&headers, &[state.auth.cron_secret.as_ref()])?;
    let window = state.pipeline.config().scheduled_window;
    let report = state.pipeline.run_with_conflict_retry(window).await?;
    Ok(Json(json!({"success": true, "report": report})))
}

#[derive(Debug, Default, Deserialize)]
struct VerifyRequest {
    #[serde(default)]
    key: Option<String>,
}

async fn verify_key_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<JsonValue>, ApiError> {
    let request: VerifyRequest = json_body(&body)?;
    let code = request
        .key
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("Key is required"))?;
    let redemption = state.keys.verify(&code, Utc::now()).await?;
    Ok(Json(json!({
        "success": true,
        "remainingUses": redemption.remaining_uses,
        "isUnlimited": redemption.is_unlimited,
        "expiresAt": redemption.expires_at,
    })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdminKeyRequest {
    #[serde(default)]
    telegram_secret: Option<String>,
    #[serde(default)]
    key: Option<String>,
    #[serde(flatten)]
    new_key: NewKeyRequest,
}

async fn create_key_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<JsonValue>, ApiError> {
    let request: AdminKeyRequest = json_body(&body)?;
    require_bot_secret(&state, request.telegram_secret.as_deref())?;
    let key = state.keys.create(&request.new_key, Utc::now()).await?;
    Ok(Json(json!({
        "success": true,
        "key": key.key,
        "expiresAt": key.expires_at,
        "maxUses": key.max_uses,
        "details": {
            "id": key.id,
            "createdAt": key.created_at,
            "isUnlimited": key.max_uses.is_none() && key.expires_at.is_none(),
        },
    })))
}

async fn delete_key_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<JsonValue>, ApiError> {
    let request: AdminKeyRequest = json_body(&body)?;
    require_bot_secret(&state, request.telegram_secret.as_deref())?;
    let code = request
        .key
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("Key is required"))?;
    let removed = state.keys.delete(&code).await?;
    Ok(Json(json!({"success": true, "deletedKey": removed})))
}

async fn list_keys_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<JsonValue>, ApiError> {
    let request: AdminKeyRequest = json_body(&body)?;
    require_bot_secret(&state, request.telegram_secret.as_deref())?;
    let listing = state.keys.list(Utc::now()).await?;
    Ok(Json(json!({
        "success": true,
        "keys": listing.keys,
        "stats": listing.stats,
    })))
}

#[derive(Debug, Default, Deserialize)]
struct UploadRequest {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    data: Option<JsonValue>,
}

async fn upload_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<JsonValue>, ApiError> {
    require_bearer(&headers, &[state.auth.admin_token.as_ref()])?;
    let request: UploadRequest = json_body(&body)?;
    let (Some(kind), Some(data)) = (request.kind, request.data) else {
        return Err(ApiError::bad_request("Invalid request data"));
    };
    let receipt = upload_curated_entry(state.store.as_ref(), &state.data_dir, &kind, data).await?;
    Ok(Json(json!({"success": true, "receipt": receipt})))
}

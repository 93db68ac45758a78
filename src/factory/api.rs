use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::ai::{ModelOption, ModelResolver, SETTING_AGENT_MODEL, SETTING_ASSESSMENT_MODEL};
use super::analyze::Analyzer;
use super::callback::{CallbackGateway, CallbackReport};
use super::cancel::CancellationController;
use super::db::DbHandle;
use super::launcher::RunLauncher;
use super::models::{NewRepo, RepoUpdate, Source};
use super::repos::{self, register_repo};
use super::sync::SyncEngine;
use crate::errors::{ErrorKind, ScoutError};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub launcher: Arc<RunLauncher>,
    pub gateway: Arc<CallbackGateway>,
    pub canceller: Arc<CancellationController>,
    pub sync: Arc<SyncEngine>,
    pub analyzer: Arc<Analyzer>,
    pub models: ModelResolver,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateRepoRequest {
    pub source: Source,
    pub source_id: String,
    pub name: Option<String>,
    pub local_path: Option<String>,
    pub default_branch: Option<String>,
    pub default_mode: Option<String>,
    #[serde(default)]
    pub auto_create_pr: bool,
}

#[derive(Deserialize)]
pub struct IssueListQuery {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

#[derive(Deserialize, Default)]
pub struct AnalyzeRequest {
    pub model: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct LaunchRequest {
    pub context: Option<String>,
}

/// Callback fields from either the query string or a JSON body. Agents
/// written against either naming convention are accepted.
#[derive(Deserialize, Default)]
pub struct CallbackPayload {
    #[serde(alias = "id", alias = "callbackId")]
    pub callback_id: Option<String>,
    pub status: Option<String>,
    #[serde(alias = "prUrl")]
    pub pr_url: Option<String>,
    pub error: Option<String>,
}

impl From<CallbackPayload> for CallbackReport {
    fn from(p: CallbackPayload) -> Self {
        CallbackReport {
            callback_id: p.callback_id.unwrap_or_default(),
            status: p.status.unwrap_or_default(),
            pr_url: p.pr_url,
            error: p.error,
        }
    }
}

#[derive(Serialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelOption>,
    pub assessment_model: String,
    pub agent_model: String,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError {
    kind: ErrorKind,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Validation,
            message: message.into(),
        }
    }

    fn status(&self) -> StatusCode {
        match self.kind {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Upstream => StatusCode::BAD_GATEWAY,
            ErrorKind::Resource | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ScoutError> for ApiError {
    fn from(err: ScoutError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ScoutError::Database(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.kind == ErrorKind::Internal || self.kind == ErrorKind::Resource {
            tracing::warn!(kind = %self.kind, error = %self.message, "request failed");
        }
        (
            self.status(),
            Json(serde_json::json!({"error": self.message, "kind": self.kind})),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/models", get(list_models))
        .route("/api/repos", get(list_repos).post(create_repo))
        .route("/api/repos/{id}", get(get_repo).patch(update_repo))
        .route("/api/repos/{id}/issues", get(list_issues))
        .route("/api/repos/{id}/sync", post(sync_repo))
        .route("/api/repos/{id}/sync/reset", post(reset_sync))
        .route("/api/repos/{id}/check-prs", post(check_prs))
        .route("/api/repos/{id}/analyze", post(analyze_repo))
        .route("/api/issues/{id}", get(get_issue))
        .route("/api/issues/{id}/analyze", post(analyze_issue))
        .route("/api/issues/{id}/launch", post(launch_issue))
        .route("/api/issues/{id}/cancel", post(cancel_issue))
        .route("/api/callback", get(callback_get).post(callback_post))
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Parse an optional JSON body; an empty body yields the default.
fn optional_json<T: DeserializeOwned + Default>(body: &Bytes) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("Invalid JSON body: {}", e)))
}

fn required_json<T: DeserializeOwned>(body: &Bytes) -> ApiResult<T> {
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("Invalid JSON body: {}", e)))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_models(State(state): State<SharedState>) -> ApiResult<impl IntoResponse> {
    let (assessment, agent) = state
        .db
        .call(|db| {
            Ok((
                db.get_setting(SETTING_ASSESSMENT_MODEL)?,
                db.get_setting(SETTING_AGENT_MODEL)?,
            ))
        })
        .await?;
    Ok(Json(ModelsResponse {
        models: state.models.available_models(),
        assessment_model: state.models.assessment_model(None, assessment.as_deref()),
        agent_model: state.models.agent_model(None, agent.as_deref()),
    }))
}

async fn list_repos(State(state): State<SharedState>) -> ApiResult<impl IntoResponse> {
    let repos = state.db.call(|db| db.list_repos()).await?;
    Ok(Json(repos))
}

async fn create_repo(State(state): State<SharedState>, body: Bytes) -> ApiResult<impl IntoResponse> {
    let req: CreateRepoRequest = required_json(&body)?;
    let new = NewRepo {
        source: req.source,
        source_id: req.source_id,
        name: req.name.unwrap_or_default(),
        local_path: req.local_path,
        default_branch: req.default_branch,
        default_mode: req.default_mode,
        auto_create_pr: req.auto_create_pr,
    };
    let repo = register_repo(&state.db, new).await?;
    Ok((StatusCode::CREATED, Json(repo)))
}

async fn get_repo(State(state): State<SharedState>, Path(id): Path<i64>) -> ApiResult<impl IntoResponse> {
    let repo = state
        .db
        .call(move |db| db.get_repo(id))
        .await?
        .ok_or_else(|| ScoutError::not_found("Repo", id))?;
    Ok(Json(repo))
}

async fn update_repo(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let update: RepoUpdate = required_json(&body)?;
    Ok(Json(repos::update_repo(&state.db, id, update).await?))
}

async fn list_issues(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(query): Query<IssueListQuery>,
) -> ApiResult<impl IntoResponse> {
    let page = query.page.unwrap_or(1).max(1);
    let per_page = query.per_page.unwrap_or(50);
    let issues = state
        .db
        .call(move |db| {
            if db.get_repo(id)?.is_none() {
                return Ok(None);
            }
            db.list_issues(id, page, per_page).map(Some)
        })
        .await?
        .ok_or_else(|| ScoutError::not_found("Repo", id))?;
    Ok(Json(issues))
}

async fn sync_repo(State(state): State<SharedState>, Path(id): Path<i64>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.sync.sync_page(id).await?))
}

async fn reset_sync(State(state): State<SharedState>, Path(id): Path<i64>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.sync.reset(id).await?))
}

async fn check_prs(State(state): State<SharedState>, Path(id): Path<i64>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.sync.detect_prs(id).await?))
}

async fn analyze_repo(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let req: AnalyzeRequest = optional_json(&body)?;
    let model = non_blank(req.model);
    Ok(Json(state.analyzer.analyze_batch(id, model.as_deref()).await?))
}

async fn get_issue(State(state): State<SharedState>, Path(id): Path<i64>) -> ApiResult<impl IntoResponse> {
    let issue = state
        .db
        .call(move |db| db.get_issue(id))
        .await?
        .ok_or_else(|| ScoutError::not_found("Issue", id))?;
    Ok(Json(issue))
}

async fn analyze_issue(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let req: AnalyzeRequest = optional_json(&body)?;
    let model = non_blank(req.model);
    Ok(Json(state.analyzer.analyze_issue(id, model.as_deref()).await?))
}

async fn launch_issue(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let req: LaunchRequest = optional_json(&body)?;
    let receipt = state.launcher.launch(id, non_blank(req.context)).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

async fn cancel_issue(State(state): State<SharedState>, Path(id): Path<i64>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.canceller.cancel(id).await?))
}

async fn callback_get(
    State(state): State<SharedState>,
    Query(payload): Query<CallbackPayload>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.gateway.handle_callback(payload.into()).await?))
}

async fn callback_post(State(state): State<SharedState>, body: Bytes) -> ApiResult<impl IntoResponse> {
    let payload: CallbackPayload = required_json(&body)?;
    Ok(Json(state.gateway.handle_callback(payload.into()).await?))
}

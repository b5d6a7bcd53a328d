//! HTTP surface for analysis jobs.
//!
//! A thin axum layer over [`JobController`]. Requests carry the caller's
//! identity in headers set by the outer layer: `x-lens-account` for signed-in
//! users, otherwise `x-lens-session` for anonymous sessions.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/analyze` | Admit and queue a job (202) |
//! | `GET`  | `/jobs/{id}` | Job state, history and progress |
//! | `GET`  | `/jobs/{id}/artifacts` | Artifacts of a completed job |
//! | `POST` | `/query` | Retrieve context from a repository's current index |
//! | `GET`  | `/admission` | Caller's quota and in-flight job |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "quota_exceeded", "message": "quota exceeded: 5 of 5 analyses used" } }
//! ```
//!
//! Admission rejections use their kind as the code: `quota_exceeded` (429)
//! and `already_in_progress` (409). Other codes: `bad_request` (400),
//! `not_found` (404), `not_indexed` (404), `internal` (500).

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use repo_lens_core::error::PipelineError;
use repo_lens_core::models::{RepositorySource, ResolvedSource, RetrievalResult};

use crate::config::Config;
use crate::generate::{Artifact, InstructionKind};
use crate::guard::{AdmissionError, Usage};
use crate::job::{Actor, AnalysisJob, JobError, JobProgress, JobState, StateChange};
use crate::jobs::JobController;

pub const ACCOUNT_HEADER: &str = "x-lens-account";
pub const SESSION_HEADER: &str = "x-lens-session";

#[derive(Clone)]
struct AppState {
    jobs: Arc<JobController>,
}

/// Build the router over an already started controller.
pub fn router(jobs: Arc<JobController>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/analyze", post(handle_analyze))
        .route("/jobs/{id}", get(handle_job))
        .route("/jobs/{id}/artifacts", get(handle_artifacts))
        .route("/query", post(handle_query))
        .route("/admission", get(handle_admission))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { jobs })
}

/// Start `jobs.workers` workers and serve on `[server].bind` until the
/// process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = crate::db::connect(config).await?;
    let jobs = Arc::new(JobController::from_config(config, pool)?);
    jobs.start(config.jobs.workers).await?;

    let bind_addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(bind = %bind_addr, workers = config.jobs.workers, "server listening");
    println!("repo-lens listening on http://{}", bind_addr);

    axum::serve(listener, router(jobs)).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn error(status: StatusCode, code: &str, message: impl Into<String>) -> AppError {
    AppError {
        status,
        code: code.to_string(),
        message: message.into(),
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    error(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    error(StatusCode::NOT_FOUND, "not_found", message)
}

fn internal(err: impl std::fmt::Display) -> AppError {
    tracing::error!(error = %err, "request failed");
    error(StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
}

impl From<AdmissionError> for AppError {
    fn from(err: AdmissionError) -> Self {
        let status = match err {
            AdmissionError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            AdmissionError::AlreadyInProgress { .. } => StatusCode::CONFLICT,
            AdmissionError::Internal(_) => return internal(err),
        };
        error(status, err.kind().as_str(), err.to_string())
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Internal(_) => internal(err),
            other => error(
                StatusCode::UNPROCESSABLE_ENTITY,
                other.kind().as_str(),
                other.to_string(),
            ),
        }
    }
}

fn actor_from_headers(headers: &HeaderMap) -> Result<Actor, AppError> {
    let value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    if let Some(id) = value(ACCOUNT_HEADER) {
        return Ok(Actor::Account { id });
    }
    if let Some(session) = value(SESSION_HEADER) {
        return Ok(Actor::Anonymous { session });
    }
    Err(bad_request(format!(
        "missing {} or {} header",
        ACCOUNT_HEADER, SESSION_HEADER
    )))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /analyze ============

#[derive(Deserialize)]
struct AnalyzeRequest {
    repo: String,
    #[serde(default, rename = "ref")]
    reference: Option<String>,
    /// Instruction names; empty uses the configured defaults.
    #[serde(default)]
    instructions: Vec<String>,
    /// Required when `instructions` contains `chat`.
    #[serde(default)]
    question: Option<String>,
}

#[derive(Serialize)]
struct AnalyzeResponse {
    job_id: String,
    state: JobState,
}

async fn handle_analyze(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<AnalyzeRequest>,
) -> Result<(StatusCode, Json<AnalyzeResponse>), AppError> {
    let actor = actor_from_headers(&headers)?;
    if req.repo.trim().is_empty() {
        return Err(bad_request("repo must not be empty"));
    }
    let instructions = req
        .instructions
        .iter()
        .map(|name| InstructionKind::parse(name, req.question.as_deref()))
        .collect::<anyhow::Result<Vec<_>>>()
        .map_err(|e| bad_request(e.to_string()))?;

    let source = RepositorySource::parse(req.repo.trim(), req.reference);
    let job = state.jobs.submit(actor, source, instructions).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(AnalyzeResponse {
            job_id: job.id,
            state: job.state,
        }),
    ))
}

// ============ GET /jobs/{id} ============

/// Job snapshot without artifact bodies.
#[derive(Serialize)]
struct JobView {
    id: String,
    actor: Actor,
    source: RepositorySource,
    resolved: Option<ResolvedSource>,
    instructions: Vec<InstructionKind>,
    state: JobState,
    history: Vec<StateChange>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    generation_id: Option<String>,
    error: Option<JobError>,
    progress: JobProgress,
}

impl From<AnalysisJob> for JobView {
    fn from(job: AnalysisJob) -> Self {
        Self {
            id: job.id,
            actor: job.actor,
            source: job.source,
            resolved: job.resolved,
            instructions: job.instructions,
            state: job.state,
            history: job.history,
            created_at: job.created_at,
            updated_at: job.updated_at,
            generation_id: job.generation_id,
            error: job.error,
            progress: job.progress,
        }
    }
}

async fn load_job(state: &AppState, id: &str) -> Result<AnalysisJob, AppError> {
    state
        .jobs
        .job(id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("job not found: {}", id)))
}

async fn handle_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobView>, AppError> {
    Ok(Json(load_job(&state, &id).await?.into()))
}

// ============ GET /jobs/{id}/artifacts ============

#[derive(Serialize)]
struct ArtifactsResponse {
    job_id: String,
    artifacts: Vec<Artifact>,
}

async fn handle_artifacts(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ArtifactsResponse>, AppError> {
    let job = load_job(&state, &id).await?;
    if job.state != JobState::Completed {
        return Err(not_found(format!(
            "job {} is {}; artifacts are available once it completes",
            id, job.state
        )));
    }
    Ok(Json(ArtifactsResponse {
        job_id: job.id,
        artifacts: job.artifacts,
    }))
}

// ============ POST /query ============

#[derive(Deserialize)]
struct QueryRequest {
    repo: String,
    query: String,
    #[serde(default)]
    generation_id: Option<String>,
}

async fn handle_query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<RetrievalResult>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let source = RepositorySource::parse(req.repo.trim(), None);
    state
        .jobs
        .pipeline()
        .query(&source, req.generation_id.as_deref(), &req.query)
        .await?
        .map(Json)
        .ok_or_else(|| {
            error(
                StatusCode::NOT_FOUND,
                "not_indexed",
                format!("no index for {}", source.repo_key()),
            )
        })
}

// ============ GET /admission ============

async fn handle_admission(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Usage>, AppError> {
    let actor = actor_from_headers(&headers)?;
    Ok(Json(state.jobs.usage(&actor).await?))
}

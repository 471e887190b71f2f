//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/ask` | Answer a query with evidence and an audit record |
//! | `GET`  | `/health` | Version, available modes, governance status, chain head |
//! | `GET`  | `/audit/verify` | Re-hash the audit log and check every link |
//! | `POST` | `/audit/snapshot` | Upload the local audit log to object storage |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "backend_timeout", "message": "vector backend timed out after 30s" } }
//! ```
//!
//! | Code | Status |
//! |------|--------|
//! | `bad_request` | 400 |
//! | `not_configured` | 400 |
//! | `backend_unavailable` | 502 |
//! | `backend_timeout` | 504 |
//! | `internal` | 500 |
//!
//! An audit write failure is not an error response: `/ask` still returns
//! 200 with `audit_not_recorded: true`.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::audit::{verify_chain, ChainProblem};
use crate::config::Config;
use crate::error::KbError;
use crate::governance::{self, GovernanceStatus};
use crate::models::{Filters, Mode, Query};
use crate::pipeline::{Pipeline, QueryOutcome};
use crate::s3::S3Client;
use crate::sink;

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    pipeline: Arc<Pipeline>,
    storage: Option<Arc<S3Client>>,
}

impl AppState {
    pub fn new(config: Config, pipeline: Pipeline, storage: Option<S3Client>) -> Self {
        Self {
            config: Arc::new(config),
            pipeline: Arc::new(pipeline),
            storage: storage.map(Arc::new),
        }
    }
}

/// Build the pipeline from `config`, bind `[server].bind`, and serve until
/// the process is stopped.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pipeline = Pipeline::from_config(config).await?;
    let storage = S3Client::from_config(config)?;
    let state = AppState::new(config.clone(), pipeline, storage);

    let bind_addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "HTTP server listening");
    axum::serve(listener, router(state)).await?;

    Ok(())
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ask", post(handle_ask))
        .route("/health", get(handle_health))
        .route("/audit/verify", get(handle_verify))
        .route("/audit/snapshot", post(handle_snapshot))
        .layer(cors)
        .with_state(state)
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

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

impl From<KbError> for AppError {
    fn from(err: KbError) -> Self {
        let status = match err {
            KbError::BackendUnavailable { .. } => StatusCode::BAD_GATEWAY,
            KbError::BackendTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            KbError::Configuration(_) => StatusCode::BAD_REQUEST,
            KbError::PersistenceFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let code = match err {
            KbError::PersistenceFailure(_) => "internal",
            ref other => other.code(),
        };
        AppError {
            status,
            code: code.to_string(),
            message: err.to_string(),
        }
    }
}

// ============ POST /ask ============

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    pub query: String,
    /// Falls back to `retrieval.default_mode`.
    #[serde(default)]
    pub mode: Option<Mode>,
    #[serde(default)]
    pub filters: Filters,
}

async fn handle_ask(
    State(state): State<AppState>,
    payload: Result<Json<AskRequest>, JsonRejection>,
) -> Result<Json<QueryOutcome>, AppError> {
    let Json(req) = payload.map_err(|rejection| bad_request(rejection.body_text()))?;
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let mode = req.mode.unwrap_or(state.config.retrieval.default_mode);
    let query = Query::new(req.query, mode).with_filters(req.filters);

    let outcome = state.pipeline.ask(query).await?;
    Ok(Json(outcome))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    modes: Vec<Mode>,
    governance: GovernanceStatus,
    audit_sink: String,
    audit_head: Option<String>,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let modes = [Mode::Vector, Mode::Assistant]
        .into_iter()
        .filter(|m| state.pipeline.supports(*m))
        .collect();
    let trail = state.pipeline.trail();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        modes,
        governance: governance::check(&state.config),
        audit_sink: trail.sink().describe(),
        audit_head: trail.head().await,
    })
}

// ============ GET /audit/verify ============

#[derive(Serialize)]
struct VerifyResponse {
    intact: bool,
    records: usize,
    head: Option<String>,
    problems: Vec<ChainProblem>,
}

async fn handle_verify(State(state): State<AppState>) -> Result<Json<VerifyResponse>, AppError> {
    let lines = state.pipeline.trail().sink().read_lines().await?;
    let report = verify_chain(lines.iter().map(String::as_str));
    Ok(Json(VerifyResponse {
        intact: report.is_intact(),
        records: report.records,
        head: report.head,
        problems: report.problems,
    }))
}

// ============ POST /audit/snapshot ============

#[derive(Serialize)]
struct SnapshotResponse {
    bucket: String,
    key: String,
}

async fn handle_snapshot(
    State(state): State<AppState>,
) -> Result<Json<SnapshotResponse>, AppError> {
    if state.config.audit.destination != "file" {
        return Err(bad_request(
            "snapshots upload the local audit log; audit.destination is not 'file'",
        ));
    }
    let client = state.storage.as_ref().ok_or_else(|| {
        AppError::from(KbError::Configuration(
            "snapshot needs [storage] and AWS credentials".into(),
        ))
    })?;
    let key = sink::snapshot(client, &state.config.audit.path)
        .await
        .map_err(|e| internal(format!("{:#}", e)))?;
    Ok(Json(SnapshotResponse {
        bucket: client.bucket().to_string(),
        key,
    }))
}

//! HTTP server.
//!
//! A thin JSON surface over the [`workflow`](crate::workflow) operations.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/nl2kql` | Translate a question into a validated KQL query |
//! | `POST` | `/feedback` | Record a verdict on a generated query |
//! | `GET`  | `/status` | Collection counts and provider status |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "natural_language must not be empty", "retryable": false } }
//! ```
//!
//! Error codes: `bad_request` (400), `generation_unavailable` (503),
//! `storage_error` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted for browser clients.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use nl2kql_core::models::FeedbackRecord;

use crate::config::Config;
use crate::workflow::{
    self, FeedbackAck, QueryRequest, QueryResponse, StatusReport, WorkflowContext, WorkflowError,
};

/// Starts the HTTP server on `[server].bind` and runs until the process
/// is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let ctx = WorkflowContext::open(config.clone()).await?;

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(bind = %bind_addr, "nl2kql server listening");
    println!("nl2kql server listening on http://{}", bind_addr);

    axum::serve(listener, router(ctx)).await?;
    Ok(())
}

/// Build the router over a prepared context.
pub fn router(ctx: WorkflowContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/nl2kql", post(handle_nl2kql))
        .route("/feedback", post(handle_feedback))
        .route("/status", get(handle_status))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(ctx)
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
    retryable: bool,
}

/// Converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
    retryable: bool,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
                retryable: self.retryable,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<WorkflowError> for AppError {
    fn from(e: WorkflowError) -> Self {
        let status = match &e {
            WorkflowError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            WorkflowError::GenerationUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            WorkflowError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %e, "request failed");
        }
        AppError {
            status,
            code: e.code().to_string(),
            retryable: e.is_retryable(),
            message: e.to_string(),
        }
    }
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

// ============ POST /nl2kql ============

async fn handle_nl2kql(
    State(ctx): State<WorkflowContext>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    Ok(Json(workflow::answer(&ctx, &request).await?))
}

// ============ POST /feedback ============

async fn handle_feedback(
    State(ctx): State<WorkflowContext>,
    Json(record): Json<FeedbackRecord>,
) -> Result<Json<FeedbackAck>, AppError> {
    Ok(Json(workflow::record_feedback(&ctx, &record).await?))
}

// ============ GET /status ============

async fn handle_status(State(ctx): State<WorkflowContext>) -> Result<Json<StatusReport>, AppError> {
    Ok(Json(workflow::status(&ctx).await?))
}

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use shuttle_axum::axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::trace::TraceLayer;

use crate::error::PipelineError;
use crate::queuer::Queuer;
use crate::state::PipelineState;
use crate::worker::Worker;

#[derive(Clone)]
pub struct AppState {
    pub queuer: Arc<Queuer>,
    pub worker: Arc<Worker>,
}

/// Orchestrator-facing routes: each POST takes the pipeline state and returns
/// the next one.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/queuer", post(run_queuer))
        .route("/worker", post(run_worker))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn run_queuer(
    State(app): State<AppState>,
    Json(state): Json<PipelineState>,
) -> Json<PipelineState> {
    Json(app.queuer.run(state, Utc::now()).await)
}

async fn run_worker(
    State(app): State<AppState>,
    Json(state): Json<PipelineState>,
) -> Result<Json<PipelineState>, ApiError> {
    Ok(Json(app.worker.run(state).await?))
}

/// Configuration errors surface as 422 so the orchestrator stops instead of
/// retrying.
pub struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self.0, "invocation rejected");
        (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

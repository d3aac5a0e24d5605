//! Job HTTP surface (feature `server`): routing and status-code translation
//! over `JobOrchestrator`'s `StartJob`/`GetStatus`/`CancelJob`/`GetResult`.
//! No business logic lives here.

use crate::job::{JobId, JobOrchestrator, JobState};
use crate::extract::RawTextExtractor;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn router(orchestrator: Arc<JobOrchestrator>) -> Router {
    Router::new()
        .route("/scrape/start", post(start))
        .route("/scrape/status/:id", get(status))
        .route("/scrape/cancel/:id", post(cancel))
        .route("/scrape/download/:id", get(download))
        .layer(TraceLayer::new_for_http())
        .with_state(orchestrator)
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    mode: String,
    input: StartInput,
}

#[derive(Debug, Deserialize)]
struct StartInput {
    urls: Vec<String>,
}

#[derive(Debug, Serialize)]
struct StartResponse {
    #[serde(rename = "jobId")]
    job_id: JobId,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    details: Vec<String>,
}

async fn start(State(orchestrator): State<Arc<JobOrchestrator>>, Json(request): Json<StartRequest>) -> Response {
    match orchestrator.start_job(&request.mode, request.input.urls, Arc::new(RawTextExtractor)) {
        Ok(job_id) => (StatusCode::CREATED, Json(StartResponse { job_id })).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: e.to_string(), details: vec![] })).into_response(),
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    id: JobId,
    status: String,
    progress: Option<crate::processor::ProgressEvent>,
    #[serde(rename = "startedAt")]
    started_at: u64,
    #[serde(rename = "endedAt")]
    ended_at: Option<u64>,
}

fn status_label(state: JobState) -> &'static str {
    match state {
        JobState::Pending => "pending",
        JobState::Running => "running",
        JobState::Completed => "completed",
        JobState::Failed => "failed",
        JobState::Cancelled => "cancelled",
    }
}

async fn status(State(orchestrator): State<Arc<JobOrchestrator>>, Path(id): Path<JobId>) -> Response {
    match orchestrator.get_status(id).await {
        Ok(status) => Json(StatusResponse {
            id: status.id,
            status: status_label(status.state).to_string(),
            progress: status.progress,
            started_at: status.started_at_millis,
            ended_at: status.ended_at_millis,
        })
        .into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    #[serde(rename = "jobId")]
    job_id: JobId,
    state: String,
}

async fn cancel(State(orchestrator): State<Arc<JobOrchestrator>>, Path(id): Path<JobId>) -> Response {
    match orchestrator.cancel_job(id).await {
        Ok(state) => Json(CancelResponse { job_id: id, state: status_label(state).to_string() }).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Returns the job's raw result as JSON. Any other export format (CSV,
/// XLSX, ...) is produced by the external exporter this surface hands off
/// to, not by this crate.
async fn download(
    State(orchestrator): State<Arc<JobOrchestrator>>,
    Path(id): Path<JobId>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let format = params.get("format").map(String::as_str).unwrap_or("json");
    if format != "json" {
        return (StatusCode::NOT_ACCEPTABLE, Json(ErrorResponse { error: "unsupported format".into(), details: vec![format.to_string()] }))
            .into_response();
    }

    match orchestrator.get_result(id).await {
        Ok(result) => {
            let body = serde_json::to_string(&result.items.iter().map(|i| &i.record).collect::<Vec<_>>()).unwrap_or_default();
            ([("content-disposition", "attachment; filename=\"result.json\""), ("content-type", "application/json")], body).into_response()
        }
        Err(crate::error::JobError::NotCompleted(_)) => StatusCode::BAD_REQUEST.into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

use axum::{
    extract::{Path, State},
    response::Json,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::error::{ApiResult, AppError};
use crate::jobs::{run_job_now, JobError, JobExecutionLog};
use crate::AppState;

pub fn job_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/logs", get(execution_logs))
        .route("/:name/run", post(run_job))
}

async fn execution_logs(State(state): State<Arc<AppState>>) -> Json<Vec<JobExecutionLog>> {
    Json(state.job_logs.read().await.clone())
}

/// Trigger a job immediately; the execution is recorded like a scheduled run.
async fn run_job(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<JobExecutionLog>> {
    let log = run_job_now(&name, &state.poller, &state.job_logs)
        .await
        .map_err(|e| match e {
            JobError::ConfigError(_) => AppError::NotFound(format!("Job '{}'", name)),
            JobError::SequenceError(e) => AppError::from(e),
            JobError::SchedulerError(e) => AppError::InternalError(e.to_string()),
        })?;

    Ok(Json(log))
}

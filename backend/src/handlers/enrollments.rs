use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use crm_shared::Enrollment;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct EnrollRequest {
    pub sequence_id: Uuid,
    pub lead_id: Uuid,
    pub contact_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnrollmentRef {
    pub enrollment_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LeadRef {
    pub lead_id: Uuid,
}

pub fn enrollment_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/enroll", post(enroll))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .route("/unenroll-by-lead", post(unenroll_by_lead))
        .route("/:id", get(get_enrollment))
}

async fn enroll(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<EnrollRequest>,
) -> ApiResult<(StatusCode, Json<Enrollment>)> {
    let enrollment = state
        .enrollments
        .enroll(payload.sequence_id, payload.lead_id, payload.contact_id)
        .await?;

    Ok((StatusCode::CREATED, Json(enrollment)))
}

async fn pause(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<EnrollmentRef>,
) -> ApiResult<Json<Enrollment>> {
    Ok(Json(state.enrollments.pause(payload.enrollment_id).await?))
}

async fn resume(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<EnrollmentRef>,
) -> ApiResult<Json<Enrollment>> {
    Ok(Json(state.enrollments.resume(payload.enrollment_id).await?))
}

async fn unenroll_by_lead(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<LeadRef>,
) -> ApiResult<Json<Vec<Enrollment>>> {
    Ok(Json(state.enrollments.unenroll_by_lead(payload.lead_id).await?))
}

async fn get_enrollment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Enrollment>> {
    Ok(Json(state.enrollments.get(id).await?))
}

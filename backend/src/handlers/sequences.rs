use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
    Router,
};
use crm_shared::{Enrollment, Sequence, StepKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::error::ApiResult;
use crate::sequences::NewSequence;
use crate::validation::{non_blank, ValidatedJson};
use crate::AppState;

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CreateSequenceRequest {
    #[validate(length(min = 1, max = 200, message = "name must be 1-200 characters"))]
    pub name: String,
    pub from_name: Option<String>,
    #[validate(email(message = "from_email must be a valid email address"))]
    pub from_email: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepKind>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReplaceStepsRequest {
    pub steps: Vec<StepKind>,
}

pub fn sequence_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_sequence))
        .route("/:id", get(get_sequence))
        .route("/:id/steps", put(replace_steps))
        .route("/:id/enrollments", get(list_enrollments))
}

async fn create_sequence(
    State(state): State<Arc<AppState>>,
    ValidatedJson(payload): ValidatedJson<CreateSequenceRequest>,
) -> ApiResult<(StatusCode, Json<Sequence>)> {
    let sequence = state
        .admin
        .create_sequence(NewSequence {
            name: payload.name,
            from_name: non_blank(payload.from_name),
            from_email: non_blank(payload.from_email),
            steps: payload.steps,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(sequence)))
}

async fn get_sequence(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Sequence>> {
    Ok(Json(state.admin.get_sequence(id).await?))
}

async fn replace_steps(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ReplaceStepsRequest>,
) -> ApiResult<Json<Sequence>> {
    Ok(Json(state.admin.replace_steps(id, payload.steps).await?))
}

async fn list_enrollments(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<Enrollment>>> {
    Ok(Json(state.admin.list_enrollments(id).await?))
}

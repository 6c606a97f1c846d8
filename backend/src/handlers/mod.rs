use axum::{http::StatusCode, response::Json};
use serde_json::json;

pub mod enrollments;
pub mod jobs;
pub mod sequences;

pub use enrollments::enrollment_routes;
pub use jobs::job_routes;
pub use sequences::sequence_routes;

pub async fn health_check() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({"status": "healthy", "service": "crm-sequences"})))
}

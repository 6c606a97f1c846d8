use axum::http::StatusCode;
use serde_json::json;
use uuid::Uuid;

use crate::build_router;
use crate::tests::fixtures::*;
use crate::tests::helpers::send_json;

#[tokio::test]
async fn test_health() {
    let app = build_router(Harness::new().app_state());
    let (status, body) = send_json(app, "GET", "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_create_and_fetch_sequence() {
    let h = Harness::new();
    let template = h.store.add_template("Hi {{contact.first_name}}", "<p>Hi</p>");
    let app = build_router(h.app_state());

    let body = json!({
        "name": "Q3 outbound",
        "from_name": "Sam Rep",
        "from_email": "sam@example.com",
        "steps": [
            { "type": "email", "template_id": template.id },
            { "type": "delay", "delay_minutes": 4320 },
            { "type": "wait_until", "condition": { "rule": "next_week", "hour": 10 } },
            { "type": "condition", "branch": { "tagId": Uuid::new_v4(), "thenStepIndex": 4, "elseStepIndex": 0 } },
            { "type": "webhook", "url": "https://hooks.example.com/seq" }
        ]
    });

    let (status, created) = send_json(app.clone(), "POST", "/api/v1/sequences", Some(body)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["steps"].as_array().unwrap().len(), 5);
    assert_eq!(created["steps"][1]["type"], "delay");
    assert_eq!(created["steps"][3]["branch"]["present"], true);

    let uri = format!("/api/v1/sequences/{}", created["id"].as_str().unwrap());
    let (status, fetched) = send_json(app.clone(), "GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["from_email"], "sam@example.com");

    let (status, enrollments) = send_json(app, "GET", &format!("{}/enrollments", uri), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(enrollments.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_sequence_body_is_rejected() {
    let app = build_router(Harness::new().app_state());

    let (status, error) = send_json(
        app.clone(),
        "POST",
        "/api/v1/sequences",
        Some(json!({ "name": "", "from_email": "not-an-email", "steps": [] })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(error["details"]["name"].is_array());
    assert!(error["details"]["from_email"].is_array());

    let (status, _) = send_json(
        app,
        "POST",
        "/api/v1/sequences",
        Some(json!({ "name": "Bad delay", "steps": [{ "type": "delay", "delay_minutes": -1 }] })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_replace_steps_on_missing_sequence() {
    let app = build_router(Harness::new().app_state());
    let uri = format!("/api/v1/sequences/{}/steps", Uuid::new_v4());

    let (status, _) = send_json(app, "PUT", &uri, Some(json!({ "steps": [] }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

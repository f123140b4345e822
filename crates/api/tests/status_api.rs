mod common;

use axum::http::StatusCode;
use common::{body_json, get};
use uuid::Uuid;

#[tokio::test]
async fn unknown_job_returns_404() {
    let test = common::build_test_app();
    let response = get(test.router(), &format!("/status/{}", Uuid::new_v4())).await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], "NOT_FOUND");
}

#[tokio::test]
async fn malformed_job_id_returns_404() {
    let test = common::build_test_app();
    let response = get(test.router(), "/status/not-a-uuid").await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn completed_job_reports_full_snapshot() {
    let test = common::build_test_app();
    let id = common::seed_completed_job(&test).await;

    let response = get(test.router(), &format!("/api/status/{id}")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["id"], id.to_string());
    assert_eq!(json["status"], "completed");
    assert_eq!(json["progress"], 100);
    assert_eq!(json["originalFilename"], "clip.mp4");

    let stages = json["stages"].as_array().unwrap();
    let names: Vec<&str> = stages.iter().map(|s| s["name"].as_str().unwrap()).collect();
    assert_eq!(names, ["depth", "stereo", "outpainting", "blur", "upscaling"]);
    assert!(stages.iter().all(|s| s["status"] == "completed" && s["progress"] == 100));
    assert!(json.get("error").is_none());
}

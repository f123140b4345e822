mod common;

use std::time::Duration;

use axum::http::StatusCode;
use common::{body_json, post_empty, post_multipart, Part};
use uuid::Uuid;
use vr180_core::job::JobStatus;
use vr180_pipeline::testing::{FakeBackend, FakeTranscoder};

fn slow_app() -> common::TestApp {
    common::build_test_app_with(
        FakeBackend::new().with_delay(Duration::from_millis(200)),
        FakeTranscoder::new(3),
        |_| {},
    )
}

#[tokio::test]
async fn cancel_running_job_fails_it_as_cancelled() {
    let test = slow_app();
    let response = post_multipart(test.router(), "/upload", &[Part::video(b"fake video")]).await;
    let id: Uuid = body_json(response).await["jobId"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();

    let response = post_empty(test.router(), &format!("/cancel/{id}")).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = body_json(response).await;
    assert_eq!(json["jobId"], id.to_string());
    assert_eq!(json["status"], "cancelling");

    let job = common::wait_for_terminal(&test.store, id).await;
    common::assert_status(&job, JobStatus::Failed);

    let status = body_json(common::get(test.router(), &format!("/status/{id}")).await).await;
    assert_eq!(status["error"]["code"], "CANCELLED");
}

#[tokio::test]
async fn cancel_finished_job_returns_409() {
    let test = common::build_test_app();
    let id = common::seed_completed_job(&test).await;

    let response = post_empty(test.router(), &format!("/api/cancel/{id}")).await;

    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await["code"], "CONFLICT");
}

#[tokio::test]
async fn cancel_unknown_job_returns_404() {
    let test = common::build_test_app();
    let response = post_empty(test.router(), &format!("/cancel/{}", Uuid::new_v4())).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = post_empty(test.router(), "/cancel/garbage").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

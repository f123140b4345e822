mod common;

use std::time::Duration;

use axum::http::StatusCode;
use common::{body_bytes, get, get_with_range, post_multipart, Part};
use uuid::Uuid;
use vr180_pipeline::testing::{fake_output_bytes, FakeBackend, FakeTranscoder, FAKE_OUTPUT_BYTES};

fn header<'a>(response: &'a axum::http::Response<axum::body::Body>, name: &str) -> &'a str {
    response.headers().get(name).unwrap().to_str().unwrap()
}

#[tokio::test]
async fn unknown_job_returns_404() {
    let test = common::build_test_app();
    let response = get(test.router(), &format!("/download/{}", Uuid::new_v4())).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unfinished_job_returns_404() {
    let test = common::build_test_app_with(
        FakeBackend::new().with_delay(Duration::from_millis(100)),
        FakeTranscoder::new(3),
        |_| {},
    );
    let response = post_multipart(test.router(), "/upload", &[Part::video(b"fake video")]).await;
    let json = common::body_json(response).await;
    let id = json["jobId"].as_str().unwrap();

    let response = get(test.router(), &format!("/download/{id}")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    test.runner.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn output_missing_from_disk_returns_404() {
    let test = common::build_test_app();
    let id = common::seed_completed_job(&test).await;
    let output = test.store.get(id).await.unwrap().output.unwrap();
    std::fs::remove_file(output).unwrap();

    let response = get(test.router(), &format!("/download/{id}")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn full_download_returns_whole_file() {
    let test = common::build_test_app();
    let id = common::seed_completed_job(&test).await;

    let response = get(test.router(), &format!("/download/{id}")).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "content-type"), "video/mp4");
    assert_eq!(header(&response, "accept-ranges"), "bytes");
    assert_eq!(header(&response, "content-length"), FAKE_OUTPUT_BYTES.to_string());
    assert_eq!(
        header(&response, "content-disposition"),
        format!("inline; filename=\"vr180_{id}.mp4\"")
    );
    assert_eq!(body_bytes(response).await, fake_output_bytes());
}

#[tokio::test]
async fn explicit_range_returns_partial_content() {
    let test = common::build_test_app();
    let id = common::seed_completed_job(&test).await;

    let response = get_with_range(test.router(), &format!("/download/{id}"), "bytes=0-99").await;

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        header(&response, "content-range"),
        format!("bytes 0-99/{FAKE_OUTPUT_BYTES}")
    );
    assert_eq!(header(&response, "content-length"), "100");
    assert_eq!(body_bytes(response).await, fake_output_bytes()[..100]);
}

#[tokio::test]
async fn open_ended_range_runs_to_end_of_file() {
    let test = common::build_test_app();
    let id = common::seed_completed_job(&test).await;

    let response =
        get_with_range(test.router(), &format!("/api/download/{id}"), "bytes=4000-").await;

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        header(&response, "content-range"),
        format!("bytes 4000-{}/{FAKE_OUTPUT_BYTES}", FAKE_OUTPUT_BYTES - 1)
    );
    assert_eq!(body_bytes(response).await, fake_output_bytes()[4000..]);
}

#[tokio::test]
async fn suffix_range_returns_tail() {
    let test = common::build_test_app();
    let id = common::seed_completed_job(&test).await;

    let response = get_with_range(test.router(), &format!("/download/{id}"), "bytes=-10").await;

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    let bytes = body_bytes(response).await;
    assert_eq!(bytes, fake_output_bytes()[FAKE_OUTPUT_BYTES - 10..]);
}

#[tokio::test]
async fn range_past_end_returns_416() {
    let test = common::build_test_app();
    let id = common::seed_completed_job(&test).await;

    let response =
        get_with_range(test.router(), &format!("/download/{id}"), "bytes=999999-").await;

    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(
        header(&response, "content-range"),
        format!("bytes */{FAKE_OUTPUT_BYTES}")
    );
}

#[tokio::test]
async fn malformed_range_is_ignored() {
    let test = common::build_test_app();
    let id = common::seed_completed_job(&test).await;

    let response =
        get_with_range(test.router(), &format!("/download/{id}"), "bytes=banana").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await.len(), FAKE_OUTPUT_BYTES);
}

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;
use uuid::Uuid;
use vr180_api::config::ServerConfig;
use vr180_api::router::build_app_router;
use vr180_api::state::AppState;
use vr180_core::job::{Job, JobStatus};
use vr180_core::types::JobId;
use vr180_pipeline::orchestrator::PipelineOrchestrator;
use vr180_pipeline::runner::JobRunner;
use vr180_pipeline::store::JobStore;
use vr180_pipeline::testing::{fake_output_bytes, fast_config, FakeBackend, FakeTranscoder};

pub const BOUNDARY: &str = "vr180-test-boundary";

/// A router wired to in-process fakes, plus handles for inspecting it.
pub struct TestApp {
    pub app: Router,
    pub store: JobStore,
    pub runner: Arc<JobRunner>,
    pub config: ServerConfig,
    _storage: tempfile::TempDir,
}

impl TestApp {
    pub fn router(&self) -> Router {
        self.app.clone()
    }
}

/// Build a test `ServerConfig` rooted at `storage`.
pub fn test_config(storage: &Path) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 5,
        storage_dir: storage.to_path_buf(),
        pipeline: fast_config(&storage.join("jobs")),
        ..ServerConfig::default()
    }
}

/// Build the full application router with all middleware layers over the
/// default fakes.
pub fn build_test_app() -> TestApp {
    build_test_app_with(FakeBackend::new(), FakeTranscoder::new(3), |_| {})
}

/// Like [`build_test_app`] with custom fakes and config tweaks.
pub fn build_test_app_with(
    backend: FakeBackend,
    transcoder: FakeTranscoder,
    configure: impl FnOnce(&mut ServerConfig),
) -> TestApp {
    let storage = tempfile::tempdir().unwrap();
    let mut config = test_config(storage.path());
    configure(&mut config);

    let store = JobStore::new();
    let orchestrator = PipelineOrchestrator::new(
        store.clone(),
        Arc::new(backend),
        Arc::new(transcoder),
        config.pipeline.clone(),
    );
    let runner = Arc::new(JobRunner::new(
        Arc::new(orchestrator),
        config.pipeline.max_concurrent_jobs,
    ));

    let state = AppState::new(config.clone(), store.clone(), Arc::clone(&runner));
    let app = build_app_router(state, &config);

    TestApp {
        app,
        store,
        runner,
        config,
        _storage: storage,
    }
}

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn get_with_range(app: Router, uri: &str, range: &str) -> Response<Body> {
    let request = Request::builder()
        .uri(uri)
        .header("range", range)
        .body(Body::empty())
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn post_empty(app: Router, uri: &str) -> Response<Body> {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.oneshot(request).await.unwrap()
}

/// One part of a multipart form.
pub struct Part<'a> {
    pub name: &'a str,
    pub filename: Option<&'a str>,
    pub content_type: Option<&'a str>,
    pub data: &'a [u8],
}

impl<'a> Part<'a> {
    pub fn video(data: &'a [u8]) -> Self {
        Self {
            name: "video",
            filename: Some("clip.mp4"),
            content_type: Some("video/mp4"),
            data,
        }
    }
}

pub fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        let disposition = match part.filename {
            Some(filename) => format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{filename}\"\r\n",
                part.name
            ),
            None => format!("Content-Disposition: form-data; name=\"{}\"\r\n", part.name),
        };
        body.extend_from_slice(disposition.as_bytes());
        if let Some(content_type) = part.content_type {
            body.extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
        }
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(part.data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub async fn post_multipart(app: Router, uri: &str, parts: &[Part<'_>]) -> Response<Body> {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(parts)))
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// Put a completed job whose output holds the fake encoder's bytes.
pub async fn seed_completed_job(test: &TestApp) -> JobId {
    let id = Uuid::new_v4();
    let workspace = test.runner.orchestrator().workspace(id);
    let input = test.config.uploads_dir().join(format!("{id}.mp4"));
    std::fs::create_dir_all(test.config.uploads_dir()).unwrap();
    std::fs::write(&input, b"source").unwrap();

    let mut job = Job::new(id, input, "clip.mp4", 6);
    job.start().unwrap();
    for stage in vr180_core::job::StageName::ALL {
        job.begin_stage(stage).unwrap();
        job.complete_stage(stage).unwrap();
    }
    let output = workspace.output_path();
    std::fs::create_dir_all(output.parent().unwrap()).unwrap();
    std::fs::write(&output, fake_output_bytes()).unwrap();
    job.complete(output).unwrap();

    test.store.put(job).await;
    id
}

/// Poll the store until the job reaches a terminal status.
pub async fn wait_for_terminal(store: &JobStore, id: JobId) -> Job {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(job) = store.get(id).await {
            if job.status.is_terminal() {
                return job;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {id} did not finish in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn assert_status(job: &Job, status: JobStatus) {
    assert_eq!(job.status, status, "unexpected job state: {job:?}");
}

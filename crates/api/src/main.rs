use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vr180_api::background;
use vr180_api::config::ServerConfig;
use vr180_api::router::build_app_router;
use vr180_api::state::AppState;
use vr180_pipeline::backend::HttpBackend;
use vr180_pipeline::orchestrator::PipelineOrchestrator;
use vr180_pipeline::runner::JobRunner;
use vr180_pipeline::snapshot;
use vr180_pipeline::store::JobStore;
use vr180_pipeline::transcoder::FfmpegTranscoder;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "vr180_api=debug,vr180_pipeline=debug,tower_http=debug".into()
            }),
        )
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(|| tracing_subscriber::fmt::layer()))
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env();
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    tokio::fs::create_dir_all(config.uploads_dir())
        .await
        .expect("Failed to create uploads directory");
    tokio::fs::create_dir_all(&config.pipeline.jobs_dir)
        .await
        .expect("Failed to create jobs directory");

    // --- Job store ---
    let store = match &config.snapshot_path {
        Some(path) => match snapshot::restore_store(path).await {
            Ok(store) => {
                tracing::info!(path = %path.display(), jobs = store.len().await, "Job store restored");
                store
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Failed to restore job store, starting empty");
                JobStore::new()
            }
        },
        None => JobStore::new(),
    };

    let snapshot_cancel = CancellationToken::new();
    let snapshot_handle = config.snapshot_path.clone().map(|path| {
        tokio::spawn(snapshot::run_snapshot_writer(
            store.clone(),
            path,
            Duration::from_millis(config.snapshot_debounce_ms),
            snapshot_cancel.clone(),
        ))
    });

    // --- Pipeline ---
    let backend = HttpBackend::new(
        config.processing_backend_url.clone(),
        config.pipeline.backend_poll_interval,
        config.pipeline.backend_retry.clone(),
    );
    let transcoder = FfmpegTranscoder::new(config.ffmpeg_path.clone(), config.ffprobe_path.clone());
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
    tracing::info!(
        backend = %config.processing_backend_url,
        max_concurrent_jobs = config.pipeline.max_concurrent_jobs,
        "Pipeline runner started"
    );

    // --- Retention ---
    let retention_cancel = CancellationToken::new();
    let retention_handle = tokio::spawn(background::retention::run(
        store.clone(),
        Arc::clone(&runner),
        Duration::from_secs(config.retention_ttl_secs),
        Duration::from_secs(config.sweep_interval_secs),
        retention_cancel.clone(),
    ));

    // --- Router ---
    let state = AppState::new(config.clone(), store, Arc::clone(&runner));
    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    retention_cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), retention_handle).await;
    tracing::info!("Retention sweeper stopped");

    // Runs record their CANCELLED outcome before the final snapshot.
    runner
        .shutdown(Duration::from_secs(config.shutdown_timeout_secs))
        .await;
    tracing::info!("Pipeline runner shut down");

    snapshot_cancel.cancel();
    if let Some(handle) = snapshot_handle {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        tracing::info!("Snapshot writer stopped");
    }

    tracing::info!("Graceful shutdown complete");
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}

use std::path::{Path, PathBuf};

use axum::extract::multipart::Field;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;
use vr180_core::error::CoreError;
use vr180_core::job::Job;
use vr180_core::media::{extension_for_media_type, resolve_upload_media_type, validate_upload_size};
use vr180_core::types::JobId;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// Multipart field names accepted for the video, most preferred first.
const VIDEO_FIELD: &str = "video";
const FALLBACK_FIELD: &str = "file";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub job_id: JobId,
}

/// An upload written to disk.
struct StoredUpload {
    field: String,
    path: PathBuf,
    filename: String,
    size: u64,
}

/// POST /upload
///
/// Accepts a multipart form with the video in a `video` field (or `file`,
/// if no `video` field is sent). The upload is streamed to storage, a job
/// is registered and its pipeline run is started. Responds 202 with the
/// new job id; progress is polled through `/status/{job_id}`.
pub async fn upload_video(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<UploadResponse>)> {
    let job_id = Uuid::new_v4();
    let uploads_dir = state.config.uploads_dir();
    tokio::fs::create_dir_all(&uploads_dir)
        .await
        .map_err(AppError::internal)?;

    let mut stored: Option<StoredUpload> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                discard(stored.take()).await;
                return Err(AppError::BadRequest(e.to_string()));
            }
        };

        let name = field.name().unwrap_or("").to_string();
        let wanted = match (name.as_str(), stored.as_ref().map(|s| s.field.as_str())) {
            (VIDEO_FIELD, None | Some(FALLBACK_FIELD)) => true,
            (FALLBACK_FIELD, None) => true,
            _ => false,
        };
        if !wanted {
            continue;
        }

        // A later `video` part replaces an earlier `file` part.
        discard(stored.take()).await;
        let upload = store_field(
            field,
            name,
            &uploads_dir,
            job_id,
            state.config.max_upload_bytes,
        )
        .await?;
        stored = Some(upload);
    }

    let upload = stored.ok_or_else(|| {
        AppError::Core(CoreError::Validation(
            "Missing required 'video' field".into(),
        ))
    })?;

    let job = Job::new(job_id, upload.path.clone(), upload.filename.clone(), upload.size);
    state.store.put(job).await;

    if let Err(e) = state.runner.submit(job_id) {
        state.store.remove(job_id).await;
        discard(Some(upload)).await;
        return Err(e.into());
    }

    tracing::info!(
        job_id = %job_id,
        filename = %upload.filename,
        size_bytes = upload.size,
        "Upload accepted, job queued",
    );

    Ok((StatusCode::ACCEPTED, Json(UploadResponse { job_id })))
}

/// Stream one multipart part to `<uploads_dir>/<job_id>.<ext>`.
///
/// The partial file is removed if the part is rejected or unreadable.
async fn store_field(
    mut field: Field<'_>,
    name: String,
    uploads_dir: &Path,
    job_id: JobId,
    max_bytes: u64,
) -> AppResult<StoredUpload> {
    let filename = field.file_name().unwrap_or("upload.mp4").to_string();
    let media_type = resolve_upload_media_type(field.content_type(), &filename)?;
    let path = uploads_dir.join(format!(
        "{job_id}.{}",
        extension_for_media_type(media_type)
    ));

    let mut file = tokio::fs::File::create(&path)
        .await
        .map_err(AppError::internal)?;

    let written = async {
        let mut size: u64 = 0;
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| AppError::BadRequest(e.to_string()))?
        {
            size += chunk.len() as u64;
            validate_upload_size(size, max_bytes)?;
            file.write_all(&chunk).await.map_err(AppError::internal)?;
        }
        file.flush().await.map_err(AppError::internal)?;
        if size == 0 {
            return Err(AppError::Core(CoreError::Validation(
                "Uploaded file is empty".into(),
            )));
        }
        Ok::<u64, AppError>(size)
    }
    .await;
    drop(file);

    match written {
        Ok(size) => Ok(StoredUpload {
            field: name,
            path,
            filename,
            size,
        }),
        Err(e) => {
            remove_file_quietly(&path).await;
            Err(e)
        }
    }
}

async fn discard(upload: Option<StoredUpload>) {
    if let Some(upload) = upload {
        remove_file_quietly(&upload.path).await;
    }
}

async fn remove_file_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove upload");
        }
    }
}

//! Streaming of rendered outputs with HTTP range support.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{self, HeaderMap};
use axum::http::StatusCode;
use axum::response::Response;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use vr180_core::error::CoreError;
use vr180_core::job::JobStatus;
use vr180_core::media::content_type_for_path;

use crate::error::{parse_job_id, AppError, AppResult};
use crate::state::AppState;

/// A single `Range: bytes=...` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `bytes=start-` or `bytes=start-end`.
    FromTo { start: u64, end: Option<u64> },
    /// `bytes=-n`: the last `n` bytes.
    Suffix(u64),
}

impl ByteRange {
    /// Inclusive `(start, end)` window within a file of `size` bytes, or
    /// `None` if the range cannot be satisfied.
    pub fn resolve(self, size: u64) -> Option<(u64, u64)> {
        if size == 0 {
            return None;
        }
        let last = size - 1;
        match self {
            ByteRange::FromTo { start, .. } if start > last => None,
            ByteRange::FromTo { start, end } => Some((start, end.map_or(last, |e| e.min(last)))),
            ByteRange::Suffix(0) => None,
            ByteRange::Suffix(len) => Some((size.saturating_sub(len), last)),
        }
    }
}

/// Parse a `Range` header value.
///
/// Returns `None` for anything other than one well-formed byte range,
/// including multi-range requests; callers then serve the whole file.
pub fn parse_range_header(value: &str) -> Option<ByteRange> {
    let spec = value.trim().strip_prefix("bytes=")?.trim();
    if spec.contains(',') {
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    let (start, end) = (start.trim(), end.trim());

    if start.is_empty() {
        return end.parse().ok().map(ByteRange::Suffix);
    }
    let start: u64 = start.parse().ok()?;
    let end = if end.is_empty() {
        None
    } else {
        let end: u64 = end.parse().ok()?;
        if end < start {
            return None;
        }
        Some(end)
    };
    Some(ByteRange::FromTo { start, end })
}

/// GET /download/{job_id}
///
/// Streams a completed job's output. Honors a single `Range: bytes=...`
/// request with 206; an unsatisfiable range gets 416. Unknown jobs, jobs
/// that have not completed, and outputs missing from disk are all 404.
pub async fn download_output(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let id = parse_job_id(&job_id)?;
    let not_found = || {
        AppError::Core(CoreError::NotFound {
            entity: "Output",
            id: id.to_string(),
        })
    };

    let job = state.store.get(id).await.ok_or_else(not_found)?;
    if job.status != JobStatus::Completed {
        return Err(not_found());
    }
    let path = job.output.ok_or_else(not_found)?;

    let metadata = match tokio::fs::metadata(&path).await {
        Ok(m) if m.is_file() => m,
        Ok(_) => return Err(not_found()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
        Err(e) => return Err(AppError::internal(e)),
    };
    let file_size = metadata.len();
    let content_type = content_type_for_path(&path);
    let disposition = format!("inline; filename=\"vr180_{id}.mp4\"");

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range_header);

    let mut file = tokio::fs::File::open(&path).await.map_err(AppError::internal)?;

    if let Some(range) = range {
        let Some((start, end)) = range.resolve(file_size) else {
            return Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(header::CONTENT_RANGE, format!("bytes */{file_size}"))
                .header(header::ACCEPT_RANGES, "bytes")
                .body(Body::empty())
                .map_err(AppError::internal);
        };

        let length = end - start + 1;
        file.seek(std::io::SeekFrom::Start(start))
            .await
            .map_err(AppError::internal)?;
        let stream = ReaderStream::new(file.take(length));

        return Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CONTENT_LENGTH, length.to_string())
            .header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{file_size}"))
            .header(header::ACCEPT_RANGES, "bytes")
            .header(header::CONTENT_DISPOSITION, disposition)
            .body(Body::from_stream(stream))
            .map_err(AppError::internal);
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, file_size.to_string())
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_DISPOSITION, disposition)
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(AppError::internal)
}

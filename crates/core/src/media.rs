//! Upload acceptance rules and media-type lookups.

use std::path::Path;

use crate::error::CoreError;

/// Bytes in a decimal megabyte, the unit upload limits are stated in.
pub const MB: u64 = 1_000_000;

/// Largest accepted upload (500 MB).
pub const MAX_UPLOAD_BYTES: u64 = 500 * MB;

pub const MEDIA_TYPE_MP4: &str = "video/mp4";
pub const MEDIA_TYPE_QUICKTIME: &str = "video/quicktime";
pub const MEDIA_TYPE_AVI: &str = "video/x-msvideo";

/// Media types accepted by `POST /upload`.
pub const ALLOWED_MEDIA_TYPES: &[&str] = &[MEDIA_TYPE_MP4, MEDIA_TYPE_QUICKTIME, MEDIA_TYPE_AVI];

/// Map an accepted upload extension to its media type.
pub fn media_type_for_extension(filename: &str) -> Option<&'static str> {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())?
        .to_lowercase();
    match ext.as_str() {
        "mp4" | "m4v" => Some(MEDIA_TYPE_MP4),
        "mov" | "qt" => Some(MEDIA_TYPE_QUICKTIME),
        "avi" => Some(MEDIA_TYPE_AVI),
        _ => None,
    }
}

/// File extension used when storing an upload of the given media type.
pub fn extension_for_media_type(media_type: &str) -> &'static str {
    match media_type {
        MEDIA_TYPE_QUICKTIME => "mov",
        MEDIA_TYPE_AVI => "avi",
        _ => "mp4",
    }
}

/// Decide the media type of an uploaded part.
///
/// The part's declared content type wins. Browsers and CLI clients often
/// omit it or send `application/octet-stream`; only then is the file
/// extension consulted.
pub fn resolve_upload_media_type(
    content_type: Option<&str>,
    filename: &str,
) -> Result<&'static str, CoreError> {
    let declared = content_type
        .map(|ct| ct.split(';').next().unwrap_or("").trim().to_lowercase())
        .filter(|ct| !ct.is_empty() && ct != "application/octet-stream");

    let resolved = match declared {
        Some(ct) => ALLOWED_MEDIA_TYPES.iter().copied().find(|allowed| *allowed == ct),
        None => media_type_for_extension(filename),
    };

    resolved.ok_or_else(|| {
        CoreError::Validation(format!(
            "Unsupported media type for '{filename}'. Allowed: {}",
            ALLOWED_MEDIA_TYPES.join(", ")
        ))
    })
}

/// Reject uploads larger than `max_bytes`.
pub fn validate_upload_size(size_bytes: u64, max_bytes: u64) -> Result<(), CoreError> {
    if size_bytes > max_bytes {
        return Err(CoreError::Validation(format!(
            "File exceeds the maximum upload size of {} bytes ({} MB)",
            max_bytes,
            max_bytes / MB
        )));
    }
    Ok(())
}

/// Guess a Content-Type for a stored artifact from its extension.
pub fn content_type_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        _ => "application/octet-stream",
    }
}

use crate::common::response::ApiError;
use crate::state::AppState;
use axum::{
    body::Body,
    extract::{Path, State},
    http::header,
    response::IntoResponse,
};
use std::path::{Component, PathBuf};
use tokio_util::io::ReaderStream;

/// A single normal path component: no separators, no `.`/`..`.
fn is_plain_name(name: &str) -> bool {
    let mut components = std::path::Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(first)), None) if first == name
    )
}

fn content_type(file: &str) -> String {
    match file.rsplit_once('.').map(|(_, ext)| ext) {
        Some("m3u8") => "application/vnd.apple.mpegurl".to_string(),
        Some("ts") => "video/mp2t".to_string(),
        Some("vtt") => "text/vtt; charset=utf-8".to_string(),
        Some("aac") => "audio/aac".to_string(),
        _ => mime_guess::from_path(file)
            .first_or_octet_stream()
            .to_string(),
    }
}

/// Stream a published artifact from a job's output directory
#[utoipa::path(
    get,
    path = "/api/v1/transcode/media/{job_id}/{file}",
    params(
        ("job_id" = String, Path, description = "Job ID"),
        ("file" = String, Path, description = "File inside the job's output directory")
    ),
    responses(
        (status = 200, description = "File content"),
        (status = 400, description = "Invalid file name"),
        (status = 404, description = "Not Found")
    ),
    tag = "Transcode"
)]
pub async fn serve_media(
    State(state): State<AppState>,
    Path((job_id, file)): Path<(String, String)>,
) -> impl IntoResponse {
    if !is_plain_name(&job_id) || !is_plain_name(&file) {
        return ApiError::bad_request("Invalid media path").into_response();
    }

    let job = match state.jobs.find(&job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => return ApiError::not_found("Job not found").into_response(),
        Err(e) => return ApiError::from(e).into_response(),
    };
    let dir = job
        .output_path
        .map(PathBuf::from)
        .unwrap_or_else(|| state.jobs.settings().job_output_dir(&job_id));

    let handle = match tokio::fs::File::open(dir.join(&file)).await {
        Ok(handle) => handle,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return ApiError::not_found("Media not found").into_response();
        }
        Err(e) => {
            tracing::error!(job_id = %job_id, file = %file, "Failed to open media: {}", e);
            return ApiError::internal("Failed to open media").into_response();
        }
    };

    (
        [
            (header::CONTENT_TYPE, content_type(&file)),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        Body::from_stream(ReaderStream::new(handle)),
    )
        .into_response()
}

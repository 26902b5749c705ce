use super::dto::{
    CheckFingerprintQuery, CreateJobRequest, CreateSubtitleJobRequest, DeleteAllResponse,
    FingerprintCheckResponse, JobPageResponse, JobResponse, OperationResponse, PageQuery,
    ProgressResponse, StatisticsResponse,
};
use super::error::TranscodeError;
use crate::common::response::{ApiError, ApiResponse, ApiSuccess};
use crate::middleware::auth::Claims;
use crate::state::AppState;
use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use validator::Validate;

fn invalid(errors: validator::ValidationErrors) -> Response {
    ApiError::from(TranscodeError::Invalid(errors.to_string())).into_response()
}

/// Create a video transcode job
///
/// Returns the existing job when the same source is already queued, running
/// or finished for this user.
#[utoipa::path(
    post,
    path = "/api/v1/transcode/jobs",
    request_body = CreateJobRequest,
    responses(
        (status = 200, description = "Job created or reused", body = ApiResponse<JobResponse>),
        (status = 400, description = "Bad Request"),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Source not found")
    ),
    security(("bearer_auth" = [])),
    tag = "Transcode"
)]
pub async fn create_job(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<CreateJobRequest>,
) -> impl IntoResponse {
    if let Err(e) = payload.validate() {
        return invalid(e);
    }

    match state.jobs.create_video_job(&claims.sub, payload).await {
        Ok(job) => ApiSuccess(
            ApiResponse::success(JobResponse::from(job), "Transcode job accepted"),
            StatusCode::OK,
        )
        .into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// Create a subtitle extraction job
#[utoipa::path(
    post,
    path = "/api/v1/transcode/subtitle-jobs",
    request_body = CreateSubtitleJobRequest,
    responses(
        (status = 200, description = "Job created or reused", body = ApiResponse<JobResponse>),
        (status = 400, description = "Bad Request"),
        (status = 404, description = "Source not found")
    ),
    security(("bearer_auth" = [])),
    tag = "Transcode"
)]
pub async fn create_subtitle_job(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<CreateSubtitleJobRequest>,
) -> impl IntoResponse {
    if let Err(e) = payload.validate() {
        return invalid(e);
    }

    match state.jobs.create_subtitle_job(&claims.sub, payload).await {
        Ok(job) => ApiSuccess(
            ApiResponse::success(JobResponse::from(job), "Subtitle job accepted"),
            StatusCode::OK,
        )
        .into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// Check whether a finished output exists for a source file
#[utoipa::path(
    get,
    path = "/api/v1/transcode/jobs/check-fingerprint",
    params(CheckFingerprintQuery),
    responses(
        (status = 200, description = "Lookup result", body = ApiResponse<FingerprintCheckResponse>),
        (status = 404, description = "Source not found")
    ),
    security(("bearer_auth" = [])),
    tag = "Transcode"
)]
pub async fn check_fingerprint(
    State(state): State<AppState>,
    Query(query): Query<CheckFingerprintQuery>,
) -> impl IntoResponse {
    if let Err(e) = query.validate() {
        return invalid(e);
    }

    match state.jobs.check_fingerprint(&query.path).await {
        Ok(result) => ApiSuccess(
            ApiResponse::success(result, "Fingerprint checked"),
            StatusCode::OK,
        )
        .into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// Get a job with its live progress
#[utoipa::path(
    get,
    path = "/api/v1/transcode/jobs/{job_id}",
    params(("job_id" = String, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Job details", body = ApiResponse<JobResponse>),
        (status = 404, description = "Job not found")
    ),
    security(("bearer_auth" = [])),
    tag = "Transcode"
)]
pub async fn get_job(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    match state.jobs.snapshot(&job_id, &claims.sub).await {
        Ok(job) => ApiSuccess(ApiResponse::success(job, "Job retrieved"), StatusCode::OK)
            .into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/transcode/jobs/{job_id}/progress",
    params(("job_id" = String, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Job progress", body = ApiResponse<ProgressResponse>),
        (status = 404, description = "Job not found")
    ),
    security(("bearer_auth" = [])),
    tag = "Transcode"
)]
pub async fn get_progress(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    match state.jobs.progress(&job_id, &claims.sub).await {
        Ok(progress) => ApiSuccess(
            ApiResponse::success(progress, "Progress retrieved"),
            StatusCode::OK,
        )
        .into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// List the caller's jobs, newest first
#[utoipa::path(
    get,
    path = "/api/v1/transcode/jobs",
    params(PageQuery),
    responses(
        (status = 200, description = "Page of jobs", body = ApiResponse<JobPageResponse>)
    ),
    security(("bearer_auth" = [])),
    tag = "Transcode"
)]
pub async fn list_jobs(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<PageQuery>,
) -> impl IntoResponse {
    match state.jobs.list(&claims.sub, query.into_request()).await {
        Ok(page) => ApiSuccess(ApiResponse::success(page, "Jobs retrieved"), StatusCode::OK)
            .into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/transcode/jobs/all",
    responses(
        (status = 200, description = "All jobs", body = ApiResponse<Vec<JobResponse>>)
    ),
    security(("bearer_auth" = [])),
    tag = "Transcode"
)]
pub async fn list_all_jobs(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> impl IntoResponse {
    match state.jobs.list_all(&claims.sub).await {
        Ok(jobs) => ApiSuccess(ApiResponse::success(jobs, "Jobs retrieved"), StatusCode::OK)
            .into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// Stop a queued or running job
#[utoipa::path(
    post,
    path = "/api/v1/transcode/jobs/{job_id}/stop",
    params(("job_id" = String, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Whether the job was stopped", body = ApiResponse<OperationResponse>),
        (status = 404, description = "Job not found")
    ),
    security(("bearer_auth" = [])),
    tag = "Transcode"
)]
pub async fn stop_job(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    match state.jobs.stop(&job_id, &claims.sub).await {
        Ok(success) => ApiSuccess(
            ApiResponse::success(OperationResponse { success }, "Stop processed"),
            StatusCode::OK,
        )
        .into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// Retry a failed or cancelled job
#[utoipa::path(
    post,
    path = "/api/v1/transcode/jobs/{job_id}/retry",
    params(("job_id" = String, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Whether the job was requeued", body = ApiResponse<OperationResponse>),
        (status = 404, description = "Job not found")
    ),
    security(("bearer_auth" = [])),
    tag = "Transcode"
)]
pub async fn retry_job(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    match state.jobs.retry(&job_id, &claims.sub).await {
        Ok(success) => ApiSuccess(
            ApiResponse::success(OperationResponse { success }, "Retry processed"),
            StatusCode::OK,
        )
        .into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

#[utoipa::path(
    delete,
    path = "/api/v1/transcode/jobs/{job_id}",
    params(("job_id" = String, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Whether the job was deleted", body = ApiResponse<OperationResponse>)
    ),
    security(("bearer_auth" = [])),
    tag = "Transcode"
)]
pub async fn delete_job(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    match state.jobs.delete(&job_id, &claims.sub).await {
        Ok(success) => ApiSuccess(
            ApiResponse::success(OperationResponse { success }, "Delete processed"),
            StatusCode::OK,
        )
        .into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// Delete every job of the caller
#[utoipa::path(
    delete,
    path = "/api/v1/transcode/jobs",
    responses(
        (status = 200, description = "Number of jobs deleted", body = ApiResponse<DeleteAllResponse>)
    ),
    security(("bearer_auth" = [])),
    tag = "Transcode"
)]
pub async fn delete_all_jobs(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> impl IntoResponse {
    match state.jobs.delete_all(&claims.sub).await {
        Ok(deleted) => ApiSuccess(
            ApiResponse::success(DeleteAllResponse { deleted }, "Jobs deleted"),
            StatusCode::OK,
        )
        .into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/transcode/statistics",
    responses(
        (status = 200, description = "Job counts by status", body = ApiResponse<StatisticsResponse>)
    ),
    security(("bearer_auth" = [])),
    tag = "Transcode"
)]
pub async fn statistics(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> impl IntoResponse {
    match state.jobs.statistics(&claims.sub).await {
        Ok(stats) => ApiSuccess(
            ApiResponse::success(stats, "Statistics retrieved"),
            StatusCode::OK,
        )
        .into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

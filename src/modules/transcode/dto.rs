use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;
use utoipa::{IntoParams, ToSchema};
use validator::Validate;

use super::model::{CachedStatus, Job, JobStatus, JobType};
use super::repository::PageRequest;

const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateJobRequest {
    #[validate(length(min = 1, message = "Source path is required"))]
    pub source_path: String,
    #[validate(range(min = 0, message = "Audio track index cannot be negative"))]
    pub audio_track_index: Option<i32>,
    /// Negative (or absent) skips subtitle extraction.
    pub subtitle_track_index: Option<i32>,
    #[serde(default)]
    pub immediate: bool,
    /// Precomputed source fingerprint; computed from the file when absent.
    pub fingerprint: Option<String>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateSubtitleJobRequest {
    #[validate(length(min = 1, message = "Source path is required"))]
    pub source_path: String,
    #[validate(range(min = 0, message = "Subtitle track index cannot be negative"))]
    pub subtitle_track_index: i32,
    pub fingerprint: Option<String>,
}

#[derive(Debug, Deserialize, Validate, IntoParams)]
pub struct CheckFingerprintQuery {
    #[validate(length(min = 1, message = "Path is required"))]
    pub path: String,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct PageQuery {
    pub page: Option<i64>,
    pub size: Option<i64>,
}

impl PageQuery {
    pub fn into_request(self) -> PageRequest {
        PageRequest {
            page: self.page.unwrap_or(1).max(1),
            size: self
                .size
                .unwrap_or(DEFAULT_PAGE_SIZE)
                .clamp(1, MAX_PAGE_SIZE),
        }
    }
}

/// Job snapshot returned to clients: the durable record with the ephemeral
/// progress overlaid.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct JobResponse {
    pub job_id: String,
    pub job_type: JobType,
    pub source_path: String,
    pub fingerprint: Option<String>,
    pub status: JobStatus,
    pub progress: f64,
    pub current_stage: i32,
    pub total_stages: i32,
    pub published_path: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub immediate: bool,
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String)]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String)]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    #[schema(value_type = Option<String>)]
    pub completed_at: Option<OffsetDateTime>,
}

impl JobResponse {
    /// The mirror only contributes while it agrees with the durable status.
    pub fn snapshot(job: Job, cached: Option<&CachedStatus>) -> Self {
        let mut response = Self::from(job);
        if let Some(cached) = cached.filter(|c| c.state == response.status) {
            response.progress = cached.progress;
            response.current_stage = cached.current_stage;
            if cached.message.is_some() {
                response.error_message = cached.message.clone();
            }
        }
        response
    }
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.job_id,
            job_type: job.job_type,
            source_path: job.source_path,
            fingerprint: job.fingerprint,
            status: job.status,
            progress: job.progress,
            current_stage: job.current_stage,
            total_stages: job.total_stages,
            published_path: job.published_path,
            error_message: job.error_message,
            retry_count: job.retry_count,
            immediate: job.immediate,
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct JobPageResponse {
    pub items: Vec<JobResponse>,
    pub total: i64,
    pub page: i64,
    pub size: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct ProgressResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: f64,
    pub current_stage: i32,
    pub total_stages: i32,
    pub published_path: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct FingerprintCheckResponse {
    pub existed: bool,
    pub fingerprint: String,
    pub job_id: Option<String>,
    pub published_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct StatisticsResponse {
    pub total: i64,
    /// Every status is present, zero included.
    pub by_status: BTreeMap<String, i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OperationResponse {
    pub success: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DeleteAllResponse {
    pub deleted: usize,
}

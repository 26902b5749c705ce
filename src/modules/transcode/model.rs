use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// States in which an existing job satisfies a duplicate request.
    pub fn is_reusable(&self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::Processing | JobStatus::Completed
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "PROCESSING" => Ok(JobStatus::Processing),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            other => Err(anyhow::anyhow!("unknown job status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    Video,
    Subtitle,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Video => "VIDEO",
            JobType::Subtitle => "SUBTITLE",
        }
    }

    /// Automatic re-publish attempts before a task is dead-lettered.
    pub fn retry_ceiling(&self) -> i32 {
        match self {
            JobType::Video => 3,
            JobType::Subtitle => 2,
        }
    }

    pub fn total_stages(&self) -> i32 {
        match self {
            JobType::Video => 2,
            JobType::Subtitle => 1,
        }
    }

    /// Cache key of the ephemeral status mirror.
    pub fn status_key(&self, job_id: &str) -> String {
        match self {
            JobType::Video => format!("job:{}", job_id),
            JobType::Subtitle => format!("subtitle_job:{}", job_id),
        }
    }
}

impl FromStr for JobType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "VIDEO" => Ok(JobType::Video),
            "SUBTITLE" => Ok(JobType::Subtitle),
            other => Err(anyhow::anyhow!("unknown job type '{}'", other)),
        }
    }
}

/// Durable job record. The authoritative state of a transcode job.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub job_id: String,
    pub creator_id: String,
    pub source_path: String,
    pub fingerprint: Option<String>,
    pub job_type: JobType,
    pub audio_track_index: i32,
    pub subtitle_track_index: i32,
    pub status: JobStatus,
    pub progress: f64,
    pub current_stage: i32,
    pub total_stages: i32,
    pub output_path: Option<String>,
    pub published_path: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub immediate: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
}

impl Job {
    /// Timestamp the retention window is measured from.
    pub fn retention_anchor(&self) -> OffsetDateTime {
        self.completed_at.unwrap_or(self.updated_at)
    }
}

/// Row shape of `transcode_jobs`; enums are stored as text.
#[derive(Debug, FromRow)]
pub struct JobRow {
    pub job_id: String,
    pub creator_id: String,
    pub source_path: String,
    pub fingerprint: Option<String>,
    pub job_type: String,
    pub audio_track_index: i32,
    pub subtitle_track_index: i32,
    pub status: String,
    pub progress: f64,
    pub current_stage: i32,
    pub total_stages: i32,
    pub output_path: Option<String>,
    pub published_path: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub immediate: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
}

impl TryFrom<JobRow> for Job {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            job_type: row.job_type.parse()?,
            status: row.status.parse()?,
            job_id: row.job_id,
            creator_id: row.creator_id,
            source_path: row.source_path,
            fingerprint: row.fingerprint,
            audio_track_index: row.audio_track_index,
            subtitle_track_index: row.subtitle_track_index,
            progress: row.progress,
            current_stage: row.current_stage,
            total_stages: row.total_stages,
            output_path: row.output_path,
            published_path: row.published_path,
            error_message: row.error_message,
            retry_count: row.retry_count,
            immediate: row.immediate,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

/// Ephemeral status mirror kept in the TTL store for cheap polling.
/// May lag the durable record; never ahead of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedStatus {
    #[serde(default)]
    pub creator_id: String,
    pub state: JobStatus,
    pub progress: f64,
    pub stages: i32,
    pub current_stage: i32,
    pub published_path: Option<String>,
    pub message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl CachedStatus {
    pub fn from_job(job: &Job) -> Self {
        Self {
            creator_id: job.creator_id.clone(),
            state: job.status,
            progress: job.progress,
            stages: job.total_stages,
            current_stage: job.current_stage,
            published_path: job.published_path.clone(),
            message: job.error_message.clone(),
            created_at: job.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text_column() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<JobStatus>().is_err());
    }

    #[test]
    fn terminal_and_reusable_sets() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Completed.is_reusable());
        assert!(!JobStatus::Failed.is_reusable());
        assert!(!JobStatus::Cancelled.is_reusable());
    }

    #[test]
    fn job_type_drives_keys_and_ceilings() {
        assert_eq!(JobType::Video.status_key("a"), "job:a");
        assert_eq!(JobType::Subtitle.status_key("a"), "subtitle_job:a");
        assert_eq!(JobType::Video.retry_ceiling(), 3);
        assert_eq!(JobType::Subtitle.retry_ceiling(), 2);
    }

    #[test]
    fn cached_status_serializes_state_in_upper_case() {
        let status = CachedStatus {
            creator_id: "u1".into(),
            state: JobStatus::Pending,
            progress: 0.0,
            stages: 2,
            current_stage: 0,
            published_path: None,
            message: None,
            created_at: OffsetDateTime::UNIX_EPOCH,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "PENDING");
        assert_eq!(json["stages"], 2);
        assert_eq!(json["created_at"], "1970-01-01T00:00:00Z");
    }
}

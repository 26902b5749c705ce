use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;

use super::model::{Job, JobRow, JobStatus, JobType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// 1-based page number.
    pub page: i64,
    pub size: i64,
}

impl PageRequest {
    pub fn offset(&self) -> i64 {
        (self.page.max(1) - 1) * self.size
    }
}

/// Durable keyed store of transcode jobs.
///
/// Every status-changing method is conditional on the current status and
/// reports whether a row actually moved, so concurrent writers converge
/// instead of stepping backwards.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn insert(&self, job: &Job) -> Result<()>;

    async fn find(&self, job_id: &str) -> Result<Option<Job>>;

    /// Most recent job of `job_type` for this source fingerprint and creator.
    async fn find_latest_by_fingerprint(
        &self,
        fingerprint: &str,
        creator_id: &str,
        job_type: JobType,
    ) -> Result<Option<Job>>;

    async fn find_completed_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Job>>;

    /// Newest first. `None` returns every job of the creator.
    async fn list_by_creator(&self, creator_id: &str, page: Option<PageRequest>) -> Result<Vec<Job>>;

    async fn count_by_creator(&self, creator_id: &str) -> Result<i64>;

    async fn count_by_status(&self, creator_id: &str) -> Result<Vec<(JobStatus, i64)>>;

    async fn list_all(&self) -> Result<Vec<Job>>;

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>>;

    /// PENDING -> PROCESSING at stage 1, only for the attempt the row is
    /// waiting on (`retry_count`). A PROCESSING row is claimed again only by
    /// a broker redelivery of that same attempt.
    async fn mark_processing(&self, job_id: &str, retry_count: i32, redelivered: bool) -> Result<bool>;

    /// Only moves PROCESSING rows; returns false once the job left that state.
    async fn update_progress(&self, job_id: &str, progress: f64, current_stage: i32) -> Result<bool>;

    /// PROCESSING -> COMPLETED.
    async fn mark_completed(&self, job_id: &str, published_path: &str) -> Result<bool>;

    /// PENDING | PROCESSING -> FAILED.
    async fn mark_failed(&self, job_id: &str, message: &str) -> Result<bool>;

    /// PENDING | PROCESSING -> CANCELLED.
    async fn mark_cancelled(&self, job_id: &str, message: &str) -> Result<bool>;

    /// PROCESSING -> PENDING for an automatic retry of the consumer.
    async fn requeue(&self, job_id: &str, retry_count: i32, last_error: &str) -> Result<bool>;

    /// FAILED | CANCELLED -> PENDING for an explicit retry.
    async fn reset_for_retry(&self, job_id: &str, retry_count: i32) -> Result<bool>;

    async fn delete(&self, job_id: &str) -> Result<bool>;
}

const JOB_COLUMNS: &str = r#"
    job_id, creator_id, source_path, fingerprint, job_type, audio_track_index,
    subtitle_track_index, status, progress, current_stage, total_stages, output_path,
    published_path, error_message, retry_count, immediate, created_at, updated_at, completed_at
"#;

#[derive(Clone)]
pub struct PgJobRepository {
    pool: PgPool,
}

impl PgJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn into_jobs(rows: Vec<JobRow>) -> Result<Vec<Job>> {
        rows.into_iter().map(Job::try_from).collect()
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn insert(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transcode_jobs (
                job_id, creator_id, source_path, fingerprint, job_type, audio_track_index,
                subtitle_track_index, status, progress, current_stage, total_stages, output_path,
                published_path, error_message, retry_count, immediate, created_at, updated_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(&job.job_id)
        .bind(&job.creator_id)
        .bind(&job.source_path)
        .bind(&job.fingerprint)
        .bind(job.job_type.as_str())
        .bind(job.audio_track_index)
        .bind(job.subtitle_track_index)
        .bind(job.status.as_str())
        .bind(job.progress)
        .bind(job.current_stage)
        .bind(job.total_stages)
        .bind(&job.output_path)
        .bind(&job.published_path)
        .bind(&job.error_message)
        .bind(job.retry_count)
        .bind(job.immediate)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to insert job {}", job.job_id))?;
        Ok(())
    }

    async fn find(&self, job_id: &str) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM transcode_jobs WHERE job_id = $1",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Job::try_from).transpose()
    }

    async fn find_latest_by_fingerprint(
        &self,
        fingerprint: &str,
        creator_id: &str,
        job_type: JobType,
    ) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {} FROM transcode_jobs
            WHERE fingerprint = $1 AND creator_id = $2 AND job_type = $3
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            JOB_COLUMNS
        ))
        .bind(fingerprint)
        .bind(creator_id)
        .bind(job_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Job::try_from).transpose()
    }

    async fn find_completed_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {} FROM transcode_jobs
            WHERE fingerprint = $1 AND status = 'COMPLETED'
            ORDER BY completed_at DESC
            LIMIT 1
            "#,
            JOB_COLUMNS
        ))
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Job::try_from).transpose()
    }

    async fn list_by_creator(&self, creator_id: &str, page: Option<PageRequest>) -> Result<Vec<Job>> {
        let rows = match page {
            Some(page) => {
                sqlx::query_as::<_, JobRow>(&format!(
                    r#"
                    SELECT {} FROM transcode_jobs
                    WHERE creator_id = $1
                    ORDER BY created_at DESC
                    LIMIT $2 OFFSET $3
                    "#,
                    JOB_COLUMNS
                ))
                .bind(creator_id)
                .bind(page.size)
                .bind(page.offset())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, JobRow>(&format!(
                    "SELECT {} FROM transcode_jobs WHERE creator_id = $1 ORDER BY created_at DESC",
                    JOB_COLUMNS
                ))
                .bind(creator_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Self::into_jobs(rows)
    }

    async fn count_by_creator(&self, creator_id: &str) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM transcode_jobs WHERE creator_id = $1")
                .bind(creator_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn count_by_status(&self, creator_id: &str) -> Result<Vec<(JobStatus, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM transcode_jobs WHERE creator_id = $1 GROUP BY status",
        )
        .bind(creator_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(status, count)| Ok((status.parse()?, count)))
            .collect()
    }

    async fn list_all(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM transcode_jobs ORDER BY created_at ASC",
            JOB_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Self::into_jobs(rows)
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM transcode_jobs WHERE status = $1 ORDER BY created_at ASC",
            JOB_COLUMNS
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        Self::into_jobs(rows)
    }

    async fn mark_processing(&self, job_id: &str, retry_count: i32, redelivered: bool) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE transcode_jobs
            SET status = 'PROCESSING', progress = 0, current_stage = 1, updated_at = NOW()
            WHERE job_id = $1 AND retry_count = $2
              AND (status = 'PENDING' OR ($3 AND status = 'PROCESSING'))
            "#,
        )
        .bind(job_id)
        .bind(retry_count)
        .bind(redelivered)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_progress(&self, job_id: &str, progress: f64, current_stage: i32) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE transcode_jobs
            SET progress = $2, current_stage = $3, updated_at = NOW()
            WHERE job_id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(job_id)
        .bind(progress)
        .bind(current_stage)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_completed(&self, job_id: &str, published_path: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE transcode_jobs
            SET status = 'COMPLETED', progress = 100, current_stage = total_stages,
                published_path = $2, error_message = NULL, completed_at = NOW(), updated_at = NOW()
            WHERE job_id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(job_id)
        .bind(published_path)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(&self, job_id: &str, message: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE transcode_jobs
            SET status = 'FAILED', error_message = $2, updated_at = NOW()
            WHERE job_id = $1 AND status IN ('PENDING', 'PROCESSING')
            "#,
        )
        .bind(job_id)
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_cancelled(&self, job_id: &str, message: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE transcode_jobs
            SET status = 'CANCELLED', error_message = $2, updated_at = NOW()
            WHERE job_id = $1 AND status IN ('PENDING', 'PROCESSING')
            "#,
        )
        .bind(job_id)
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn requeue(&self, job_id: &str, retry_count: i32, last_error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE transcode_jobs
            SET status = 'PENDING', progress = 0, current_stage = 0, retry_count = $2,
                error_message = $3, updated_at = NOW()
            WHERE job_id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(job_id)
        .bind(retry_count)
        .bind(last_error)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn reset_for_retry(&self, job_id: &str, retry_count: i32) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE transcode_jobs
            SET status = 'PENDING', progress = 0, current_stage = 0, retry_count = $2,
                error_message = NULL, published_path = NULL, completed_at = NULL, updated_at = NOW()
            WHERE job_id = $1 AND status IN ('FAILED', 'CANCELLED')
            "#,
        )
        .bind(job_id)
        .bind(retry_count)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, job_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM transcode_jobs WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

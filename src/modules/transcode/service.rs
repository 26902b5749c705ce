use std::collections::BTreeMap;
use std::path::{Component, Path};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::cache::TtlStore;
use super::dto::{
    CreateJobRequest, CreateSubtitleJobRequest, FingerprintCheckResponse, JobPageResponse,
    JobResponse, ProgressResponse, StatisticsResponse,
};
use super::error::{TranscodeError, TranscodeResult};
use super::events::{CleanupTask, SubtitleTranscodeTask, TranscodeTask};
use super::fingerprint::FingerprintService;
use super::model::{CachedStatus, Job, JobStatus, JobType};
use super::publisher::{OutboundMessage, TaskPublisher};
use super::repository::{JobRepository, PageRequest};
use crate::config::settings::TranscodeSettings;
use crate::supervisor::ProcessRegistry;

/// Extra slack past the encode timeout before a PROCESSING job counts as orphaned.
const STALE_GRACE: Duration = Duration::from_secs(5 * 60);
/// How long stop, retry and delete wait for a killed encode to exit.
const STOP_WAIT: Duration = Duration::from_secs(15);

pub const WORKER_LOST: &str = "interrupted: worker lost";
const CANCELLED_BY_USER: &str = "Cancelled by user";
const CANCELLED_BY_DELETE: &str = "Cancelled by delete";

/// Job lifecycle operations shared by the HTTP handlers, the queue consumers
/// and the scavenger. Every transition writes the durable record first and
/// the status mirror second.
#[derive(Clone)]
pub struct JobService {
    jobs: Arc<dyn JobRepository>,
    cache: Arc<dyn TtlStore>,
    publisher: Arc<dyn TaskPublisher>,
    fingerprints: FingerprintService,
    registry: ProcessRegistry,
    settings: Arc<TranscodeSettings>,
}

impl JobService {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        cache: Arc<dyn TtlStore>,
        publisher: Arc<dyn TaskPublisher>,
        registry: ProcessRegistry,
        settings: Arc<TranscodeSettings>,
    ) -> Self {
        Self {
            fingerprints: FingerprintService::new(cache.clone()),
            jobs,
            cache,
            publisher,
            registry,
            settings,
        }
    }

    pub fn settings(&self) -> &TranscodeSettings {
        &self.settings
    }

    pub fn retention(&self, job_type: JobType) -> Duration {
        match job_type {
            JobType::Video => self.settings.video_retention(),
            JobType::Subtitle => self.settings.subtitle_retention(),
        }
    }

    fn output_dir_of(&self, job: &Job) -> String {
        job.output_path.clone().unwrap_or_else(|| {
            self.settings
                .job_output_dir(&job.job_id)
                .to_string_lossy()
                .into_owned()
        })
    }

    // --- status mirror ---

    async fn write_mirror(&self, job: &Job) {
        let key = job.job_type.status_key(&job.job_id);
        let written = match serde_json::to_string(&CachedStatus::from_job(job)) {
            Ok(json) => self.cache.set(&key, &json, self.settings.status_ttl()).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = written {
            warn!(job_id = %job.job_id, "Failed to mirror job status: {}", e);
        }
    }

    async fn read_mirror(&self, key: &str) -> Option<CachedStatus> {
        match self.cache.get(key).await {
            Ok(Some(json)) => serde_json::from_str(&json)
                .map_err(|e| warn!(key, "Discarding unreadable status mirror: {}", e))
                .ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(key, "Status mirror unavailable: {}", e);
                None
            }
        }
    }

    async fn drop_mirror(&self, job_id: &str) {
        for job_type in [JobType::Video, JobType::Subtitle] {
            if let Err(e) = self.cache.delete(&job_type.status_key(job_id)).await {
                warn!(job_id, "Failed to drop status mirror: {}", e);
            }
        }
    }

    /// Re-reads the row after a transition and mirrors what was stored.
    async fn refresh_mirror(&self, job_id: &str) -> TranscodeResult<Option<Job>> {
        let job = self.jobs.find(job_id).await?;
        if let Some(job) = &job {
            self.write_mirror(job).await;
        }
        Ok(job)
    }

    async fn bind_fingerprint(&self, job: &Job) {
        if let Some(fingerprint) = &job.fingerprint {
            let ttl = self.retention(job.job_type);
            if let Err(e) = self.fingerprints.bind(fingerprint, &job.job_id, ttl).await {
                warn!(job_id = %job.job_id, "Failed to bind fingerprint: {}", e);
            }
        }
    }

    async fn release_fingerprint(&self, job: &Job) {
        if let Some(fingerprint) = &job.fingerprint {
            if let Err(e) = self.fingerprints.release(fingerprint, &job.job_id).await {
                warn!(job_id = %job.job_id, "Failed to release fingerprint: {}", e);
            }
        }
    }

    // --- creation ---

    async fn source_fingerprint(
        &self,
        path: &str,
        supplied: Option<String>,
    ) -> TranscodeResult<String> {
        match supplied.filter(|fp| !fp.trim().is_empty()) {
            Some(fingerprint) => {
                if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                    return Err(TranscodeError::NotFound(format!(
                        "source {} does not exist",
                        path
                    )));
                }
                Ok(fingerprint)
            }
            None => self.fingerprints.fingerprint(path).await,
        }
    }

    async fn reusable(
        &self,
        fingerprint: &str,
        creator_id: &str,
        job_type: JobType,
    ) -> TranscodeResult<Option<Job>> {
        let existing = self
            .jobs
            .find_latest_by_fingerprint(fingerprint, creator_id, job_type)
            .await?;
        Ok(existing
            .filter(|job| job.status.is_reusable())
            .inspect(|job| {
                info!(job_id = %job.job_id, status = %job.status, "Reusing job for identical source");
            }))
    }

    fn new_job(&self, creator_id: &str, source_path: String, job_type: JobType) -> Job {
        let job_id = Uuid::new_v4().to_string();
        let now = OffsetDateTime::now_utc();
        Job {
            output_path: Some(
                self.settings
                    .job_output_dir(&job_id)
                    .to_string_lossy()
                    .into_owned(),
            ),
            job_id,
            creator_id: creator_id.to_string(),
            source_path,
            fingerprint: None,
            job_type,
            audio_track_index: -1,
            subtitle_track_index: -1,
            status: JobStatus::Pending,
            progress: 0.0,
            current_stage: 0,
            total_stages: job_type.total_stages(),
            published_path: None,
            error_message: None,
            retry_count: 0,
            immediate: false,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Stores a new PENDING job, mirrors and binds it, then publishes its task.
    async fn admit(&self, job: &Job, message: OutboundMessage) -> TranscodeResult<()> {
        self.jobs.insert(job).await?;
        self.write_mirror(job).await;
        self.bind_fingerprint(job).await;

        if let Err(e) = self.publisher.publish(&message).await {
            error!(job_id = %job.job_id, "Failed to enqueue job: {}", e);
            self.transition_failed(&job.job_id, &format!("Failed to enqueue: {}", e))
                .await?;
            return Err(e.into());
        }

        info!(
            job_id = %job.job_id,
            job_type = job.job_type.as_str(),
            routing_key = message.routing_key,
            "Job created"
        );
        Ok(())
    }

    pub async fn create_video_job(
        &self,
        creator_id: &str,
        request: CreateJobRequest,
    ) -> TranscodeResult<Job> {
        let fingerprint = self
            .source_fingerprint(&request.source_path, request.fingerprint)
            .await?;
        if let Some(existing) = self.reusable(&fingerprint, creator_id, JobType::Video).await? {
            return Ok(existing);
        }

        let mut job = self.new_job(creator_id, request.source_path, JobType::Video);
        job.fingerprint = Some(fingerprint);
        job.audio_track_index = request.audio_track_index.unwrap_or(0);
        job.subtitle_track_index = request
            .subtitle_track_index
            .filter(|index| *index >= 0)
            .unwrap_or(-1);
        job.immediate = request.immediate;

        let task = TranscodeTask::from_job(&job, self.output_dir_of(&job), 0);
        self.admit(&job, OutboundMessage::transcode(&task)?).await?;
        Ok(job)
    }

    pub async fn create_subtitle_job(
        &self,
        creator_id: &str,
        request: CreateSubtitleJobRequest,
    ) -> TranscodeResult<Job> {
        let source = self
            .source_fingerprint(&request.source_path, request.fingerprint)
            .await?;
        let fingerprint = FingerprintService::derive(
            &source,
            &format!("subtitle:{}", request.subtitle_track_index),
        );
        if let Some(existing) = self
            .reusable(&fingerprint, creator_id, JobType::Subtitle)
            .await?
        {
            return Ok(existing);
        }

        let mut job = self.new_job(creator_id, request.source_path, JobType::Subtitle);
        job.fingerprint = Some(fingerprint);
        job.subtitle_track_index = request.subtitle_track_index;

        let task = SubtitleTranscodeTask::from_job(&job, self.output_dir_of(&job), 0);
        self.admit(&job, OutboundMessage::subtitle(&task)?).await?;
        Ok(job)
    }

    // --- queries ---

    pub async fn find(&self, job_id: &str) -> TranscodeResult<Option<Job>> {
        Ok(self.jobs.find(job_id).await?)
    }

    pub async fn all_jobs(&self) -> TranscodeResult<Vec<Job>> {
        Ok(self.jobs.list_all().await?)
    }

    async fn owned(&self, job_id: &str, creator_id: &str) -> TranscodeResult<Job> {
        match self.jobs.find(job_id).await? {
            Some(job) if job.creator_id == creator_id => Ok(job),
            _ => Err(TranscodeError::NotFound(format!("job {}", job_id))),
        }
    }

    async fn overlay(&self, jobs: Vec<Job>) -> Vec<JobResponse> {
        let mut responses = Vec::with_capacity(jobs.len());
        for job in jobs {
            let cached = if job.status == JobStatus::Processing {
                self.read_mirror(&job.job_type.status_key(&job.job_id)).await
            } else {
                None
            };
            responses.push(JobResponse::snapshot(job, cached.as_ref()));
        }
        responses
    }

    pub async fn snapshot(&self, job_id: &str, creator_id: &str) -> TranscodeResult<JobResponse> {
        let job = self.owned(job_id, creator_id).await?;
        let cached = self.read_mirror(&job.job_type.status_key(job_id)).await;
        Ok(JobResponse::snapshot(job, cached.as_ref()))
    }

    /// Served from the status mirror; the durable store is only read on a miss.
    pub async fn progress(&self, job_id: &str, creator_id: &str) -> TranscodeResult<ProgressResponse> {
        for job_type in [JobType::Video, JobType::Subtitle] {
            if let Some(cached) = self.read_mirror(&job_type.status_key(job_id)).await {
                if cached.creator_id == creator_id {
                    return Ok(ProgressResponse {
                        job_id: job_id.to_string(),
                        status: cached.state,
                        progress: cached.progress,
                        current_stage: cached.current_stage,
                        total_stages: cached.stages,
                        published_path: cached.published_path,
                        message: cached.message,
                    });
                }
            }
        }

        let job = self.owned(job_id, creator_id).await?;
        Ok(ProgressResponse {
            job_id: job.job_id,
            status: job.status,
            progress: job.progress,
            current_stage: job.current_stage,
            total_stages: job.total_stages,
            published_path: job.published_path,
            message: job.error_message,
        })
    }

    pub async fn list(&self, creator_id: &str, page: PageRequest) -> TranscodeResult<JobPageResponse> {
        let jobs = self.jobs.list_by_creator(creator_id, Some(page)).await?;
        let total = self.jobs.count_by_creator(creator_id).await?;
        Ok(JobPageResponse {
            items: self.overlay(jobs).await,
            total,
            page: page.page,
            size: page.size,
        })
    }

    pub async fn list_all(&self, creator_id: &str) -> TranscodeResult<Vec<JobResponse>> {
        let jobs = self.jobs.list_by_creator(creator_id, None).await?;
        Ok(self.overlay(jobs).await)
    }

    pub async fn statistics(&self, creator_id: &str) -> TranscodeResult<StatisticsResponse> {
        let mut by_status: BTreeMap<String, i64> = JobStatus::ALL
            .iter()
            .map(|status| (status.as_str().to_string(), 0))
            .collect();
        let mut total = 0;
        for (status, count) in self.jobs.count_by_status(creator_id).await? {
            by_status.insert(status.as_str().to_string(), count);
            total += count;
        }
        Ok(StatisticsResponse { total, by_status })
    }

    pub async fn find_completed_by_fingerprint(&self, fingerprint: &str) -> TranscodeResult<Option<Job>> {
        Ok(self.jobs.find_completed_by_fingerprint(fingerprint).await?)
    }

    /// Whether a finished output already exists for the file at `path`.
    pub async fn check_fingerprint(&self, path: &str) -> TranscodeResult<FingerprintCheckResponse> {
        let fingerprint = self.fingerprints.fingerprint(path).await?;

        let bound = match self.fingerprints.resolve(&fingerprint).await {
            Ok(bound) => bound,
            Err(e) => {
                warn!("Fingerprint lookup failed: {}", e);
                None
            }
        };
        let mut completed = match bound {
            Some(job_id) => self
                .jobs
                .find(&job_id)
                .await?
                .filter(|job| job.status == JobStatus::Completed),
            None => None,
        };
        if completed.is_none() {
            completed = self.find_completed_by_fingerprint(&fingerprint).await?;
        }

        Ok(FingerprintCheckResponse {
            existed: completed.is_some(),
            fingerprint,
            job_id: completed.as_ref().map(|job| job.job_id.clone()),
            published_path: completed.and_then(|job| job.published_path),
        })
    }

    // --- transitions driven by consumers ---

    /// Never changes status; ignored once the job left PROCESSING.
    pub async fn update_progress(&self, job_id: &str, progress: f64, stage: i32) -> TranscodeResult<()> {
        let progress = progress.clamp(0.0, 100.0);
        if self.jobs.update_progress(job_id, progress, stage).await? {
            self.refresh_mirror(job_id).await?;
        }
        Ok(())
    }

    /// `None` when the job is gone, terminal, or waiting on a different
    /// attempt than `retry_count` (a stale message).
    pub async fn transition_processing(
        &self,
        job_id: &str,
        retry_count: i32,
        redelivered: bool,
    ) -> TranscodeResult<Option<Job>> {
        if !self.jobs.mark_processing(job_id, retry_count, redelivered).await? {
            return Ok(None);
        }
        debug!(job_id, "Job processing");
        self.refresh_mirror(job_id).await
    }

    /// Keeps the fingerprint bound for the retention window so duplicates reuse the output.
    pub async fn transition_completed(
        &self,
        job_id: &str,
        published_path: &str,
    ) -> TranscodeResult<Option<Job>> {
        if !self.jobs.mark_completed(job_id, published_path).await? {
            return Ok(None);
        }
        let job = self.refresh_mirror(job_id).await?;
        if let Some(job) = &job {
            self.bind_fingerprint(job).await;
            info!(job_id, published_path, "Job completed");
        }
        Ok(job)
    }

    pub async fn transition_failed(&self, job_id: &str, message: &str) -> TranscodeResult<bool> {
        if !self.jobs.mark_failed(job_id, message).await? {
            return Ok(false);
        }
        if let Some(job) = self.refresh_mirror(job_id).await? {
            self.release_fingerprint(&job).await;
        }
        warn!(job_id, message, "Job failed");
        Ok(true)
    }

    /// PROCESSING -> PENDING ahead of an automatic re-publish.
    pub async fn requeue_for_retry(
        &self,
        job_id: &str,
        retry_count: i32,
        last_error: &str,
    ) -> TranscodeResult<bool> {
        if !self.jobs.requeue(job_id, retry_count, last_error).await? {
            return Ok(false);
        }
        self.refresh_mirror(job_id).await?;
        Ok(true)
    }

    pub async fn enqueue(&self, message: &OutboundMessage) -> TranscodeResult<()> {
        Ok(self.publisher.publish(message).await?)
    }

    /// Publishes the delayed cleanup of a completed job.
    pub async fn schedule_cleanup(&self, job: &Job) -> TranscodeResult<()> {
        let task = CleanupTask {
            job_id: job.job_id.clone(),
            output_dir: self.output_dir_of(job),
            fingerprint: job.fingerprint.clone(),
        };
        self.enqueue(&OutboundMessage::delayed_cleanup(&task, job.job_type)?)
            .await?;
        debug!(
            job_id = %job.job_id,
            delay_secs = self.retention(job.job_type).as_secs(),
            "Cleanup scheduled"
        );
        Ok(())
    }

    // --- user operations ---

    async fn cancel(&self, job: &Job, reason: &str) -> TranscodeResult<bool> {
        if job.status.is_terminal() {
            return Ok(false);
        }
        // The row goes terminal first so a completion racing the kill is dropped.
        let cancelled = self.jobs.mark_cancelled(&job.job_id, reason).await?;
        self.settle_encoder(&job.job_id).await;
        if !cancelled {
            return Ok(false);
        }
        if let Some(job) = self.refresh_mirror(&job.job_id).await? {
            self.release_fingerprint(&job).await;
        }
        info!(job_id = %job.job_id, reason, "Job cancelled");
        Ok(true)
    }

    /// PENDING | PROCESSING -> CANCELLED. A running encoder is killed first.
    pub async fn stop(&self, job_id: &str, creator_id: &str) -> TranscodeResult<bool> {
        let job = self.owned(job_id, creator_id).await?;
        self.cancel(&job, CANCELLED_BY_USER).await
    }

    /// FAILED | CANCELLED -> PENDING with a fresh task carrying `retry_count + 1`.
    pub async fn retry(&self, job_id: &str, creator_id: &str) -> TranscodeResult<bool> {
        let job = self.owned(job_id, creator_id).await?;
        if !matches!(job.status, JobStatus::Failed | JobStatus::Cancelled) {
            return Ok(false);
        }

        self.settle_encoder(job_id).await;
        let output_dir = self.output_dir_of(&job);
        self.remove_output(&output_dir).await?;

        let retry_count = job.retry_count + 1;
        if !self.jobs.reset_for_retry(job_id, retry_count).await? {
            return Ok(false);
        }
        let Some(job) = self.refresh_mirror(job_id).await? else {
            return Ok(false);
        };
        self.bind_fingerprint(&job).await;

        let message = match job.job_type {
            JobType::Video => {
                OutboundMessage::transcode(&TranscodeTask::from_job(&job, output_dir, retry_count))?
            }
            JobType::Subtitle => OutboundMessage::subtitle(&SubtitleTranscodeTask::from_job(
                &job,
                output_dir,
                retry_count,
            ))?,
        };
        if let Err(e) = self.enqueue(&message).await {
            self.transition_failed(job_id, &format!("Failed to enqueue retry: {}", e))
                .await?;
            return Err(e);
        }

        info!(job_id, retry_count, "Job retried");
        Ok(true)
    }

    /// Stops the job if needed, then removes every trace of it.
    pub async fn delete(&self, job_id: &str, creator_id: &str) -> TranscodeResult<bool> {
        match self.jobs.find(job_id).await? {
            Some(job) if job.creator_id == creator_id => self.remove(job).await,
            _ => Ok(false),
        }
    }

    /// Not atomic across jobs; failures are logged and left in place.
    pub async fn delete_all(&self, creator_id: &str) -> TranscodeResult<usize> {
        let jobs = self.jobs.list_by_creator(creator_id, None).await?;
        let mut deleted = 0;
        for job in jobs {
            let job_id = job.job_id.clone();
            match self.remove(job).await {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(e) => warn!(job_id = %job_id, "Failed to delete job: {}", e),
            }
        }
        info!(creator_id, deleted, "Deleted jobs");
        Ok(deleted)
    }

    async fn remove(&self, job: Job) -> TranscodeResult<bool> {
        self.cancel(&job, CANCELLED_BY_DELETE).await?;
        self.settle_encoder(&job.job_id).await;
        let output_dir = self.output_dir_of(&job);
        self.purge(&job.job_id, &output_dir, job.fingerprint.as_deref())
            .await
    }

    /// Kills any encode still registered for the job and waits for it to
    /// exit, so no process is writing into the output directory afterwards.
    async fn settle_encoder(&self, job_id: &str) {
        if self.registry.is_running(job_id)
            && !self.registry.terminate_and_wait(job_id, STOP_WAIT).await
        {
            warn!(job_id, "Encode did not exit in time, continuing");
        }
    }

    // --- cleanup ---

    /// Deletes output files, the fingerprint binding (if it still points at
    /// this job), the durable row and both mirror entries. Repeatable;
    /// returns whether a row was removed.
    pub async fn purge(
        &self,
        job_id: &str,
        output_dir: &str,
        fingerprint: Option<&str>,
    ) -> TranscodeResult<bool> {
        self.remove_output(output_dir).await?;
        if let Some(fingerprint) = fingerprint {
            self.fingerprints.release(fingerprint, job_id).await?;
        }
        let removed = self.jobs.delete(job_id).await?;
        self.drop_mirror(job_id).await;
        debug!(job_id, removed, "Job purged");
        Ok(removed)
    }

    pub async fn purge_job(&self, job: &Job) -> TranscodeResult<bool> {
        let output_dir = self.output_dir_of(job);
        self.purge(&job.job_id, &output_dir, job.fingerprint.as_deref())
            .await
    }

    fn is_managed_output(&self, path: &Path) -> bool {
        let root = self.settings.output_dir.as_path();
        path.starts_with(root)
            && path != root
            && !path.components().any(|c| matches!(c, Component::ParentDir))
    }

    async fn remove_output(&self, output_dir: &str) -> TranscodeResult<()> {
        let path = Path::new(output_dir);
        if !self.is_managed_output(path) {
            warn!(path = output_dir, "Not deleting directory outside the output root");
            return Ok(());
        }
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {
                debug!(path = output_dir, "Removed job output");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Fails PROCESSING jobs nobody has touched for longer than an encode
    /// may run. Jobs with a live encode in this process are skipped.
    pub async fn recover_stale_processing(&self, now: OffsetDateTime) -> TranscodeResult<usize> {
        let cutoff = now - (self.settings.encode_timeout() + STALE_GRACE);
        let mut recovered = 0;
        for job in self.jobs.list_by_status(JobStatus::Processing).await? {
            if job.updated_at > cutoff || self.registry.is_running(&job.job_id) {
                continue;
            }
            if self.transition_failed(&job.job_id, WORKER_LOST).await? {
                recovered += 1;
            }
        }
        if recovered > 0 {
            warn!(recovered, "Recovered orphaned PROCESSING jobs");
        }
        Ok(recovered)
    }
}

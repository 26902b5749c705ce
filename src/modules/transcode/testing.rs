//! In-memory stand-ins for the durable store, the TTL cache and the broker.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use time::OffsetDateTime;

use super::cache::TtlStore;
use super::dto::{CreateJobRequest, CreateSubtitleJobRequest};
use super::model::{CachedStatus, Job, JobStatus, JobType};
use super::publisher::{OutboundMessage, TaskPublisher};
use super::repository::{JobRepository, PageRequest};
use super::service::JobService;
use crate::config::settings::TranscodeSettings;
use crate::supervisor::ProcessRegistry;

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (String, Duration, Instant)>>,
}

impl MemoryStore {
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        self.entries.lock().unwrap().get(key).map(|(_, ttl, _)| *ttl)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .map(|(value, _, _)| value.clone())
    }
}

#[async_trait]
impl TtlStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().unwrap();
        let expired = matches!(entries.get(key), Some((_, ttl, at)) if at.elapsed() >= *ttl);
        if expired {
            entries.remove(key);
        }
        Ok(entries.get(key).map(|(value, _, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (value.to_string(), ttl, Instant::now()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        if entries.get(key).is_some_and(|(value, _, _)| value == expected) {
            entries.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}

#[derive(Default)]
pub struct MemoryJobRepository {
    jobs: Mutex<Vec<Job>>,
}

impl MemoryJobRepository {
    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .find(|j| j.job_id == job_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    /// Direct row edit for arranging fixtures (e.g. back-dating timestamps).
    pub fn edit(&self, job_id: &str, f: impl FnOnce(&mut Job)) {
        if let Some(job) = self
            .jobs
            .lock()
            .unwrap()
            .iter_mut()
            .find(|j| j.job_id == job_id)
        {
            f(job);
        }
    }

    fn update(&self, job_id: &str, from: &[JobStatus], f: impl FnOnce(&mut Job)) -> bool {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs
            .iter_mut()
            .find(|j| j.job_id == job_id && from.contains(&j.status))
        {
            Some(job) => {
                f(job);
                job.updated_at = OffsetDateTime::now_utc();
                true
            }
            None => false,
        }
    }

    fn sorted_newest_first(mut jobs: Vec<Job>) -> Vec<Job> {
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn insert(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.iter().any(|j| j.job_id == job.job_id) {
            return Err(anyhow!("duplicate job id {}", job.job_id));
        }
        jobs.push(job.clone());
        Ok(())
    }

    async fn find(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(self.get(job_id))
    }

    async fn find_latest_by_fingerprint(
        &self,
        fingerprint: &str,
        creator_id: &str,
        job_type: JobType,
    ) -> Result<Option<Job>> {
        let jobs = self.jobs.lock().unwrap().clone();
        Ok(Self::sorted_newest_first(jobs).into_iter().find(|j| {
            j.fingerprint.as_deref() == Some(fingerprint)
                && j.creator_id == creator_id
                && j.job_type == job_type
        }))
    }

    async fn find_completed_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|j| {
                j.fingerprint.as_deref() == Some(fingerprint) && j.status == JobStatus::Completed
            })
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        Ok(jobs.into_iter().next())
    }

    async fn list_by_creator(&self, creator_id: &str, page: Option<PageRequest>) -> Result<Vec<Job>> {
        let jobs: Vec<Job> = self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|j| j.creator_id == creator_id)
            .cloned()
            .collect();
        let jobs = Self::sorted_newest_first(jobs);
        Ok(match page {
            Some(page) => jobs
                .into_iter()
                .skip(page.offset() as usize)
                .take(page.size as usize)
                .collect(),
            None => jobs,
        })
    }

    async fn count_by_creator(&self, creator_id: &str) -> Result<i64> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|j| j.creator_id == creator_id)
            .count() as i64)
    }

    async fn count_by_status(&self, creator_id: &str) -> Result<Vec<(JobStatus, i64)>> {
        let jobs = self.jobs.lock().unwrap();
        Ok(JobStatus::ALL
            .iter()
            .map(|status| {
                let count = jobs
                    .iter()
                    .filter(|j| j.creator_id == creator_id && j.status == *status)
                    .count() as i64;
                (*status, count)
            })
            .filter(|(_, count)| *count > 0)
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<Job>> {
        Ok(self.jobs.lock().unwrap().clone())
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|j| j.status == status)
            .cloned()
            .collect())
    }

    async fn mark_processing(&self, job_id: &str, retry_count: i32, redelivered: bool) -> Result<bool> {
        let from: &[JobStatus] = if redelivered {
            &[JobStatus::Pending, JobStatus::Processing]
        } else {
            &[JobStatus::Pending]
        };
        let current = self.get(job_id).map(|j| j.retry_count);
        if current != Some(retry_count) {
            return Ok(false);
        }
        Ok(self.update(job_id, from, |job| {
            job.status = JobStatus::Processing;
            job.progress = 0.0;
            job.current_stage = 1;
        }))
    }

    async fn update_progress(&self, job_id: &str, progress: f64, current_stage: i32) -> Result<bool> {
        Ok(self.update(job_id, &[JobStatus::Processing], |job| {
            job.progress = progress;
            job.current_stage = current_stage;
        }))
    }

    async fn mark_completed(&self, job_id: &str, published_path: &str) -> Result<bool> {
        Ok(self.update(job_id, &[JobStatus::Processing], |job| {
            job.status = JobStatus::Completed;
            job.progress = 100.0;
            job.current_stage = job.total_stages;
            job.published_path = Some(published_path.to_string());
            job.error_message = None;
            job.completed_at = Some(OffsetDateTime::now_utc());
        }))
    }

    async fn mark_failed(&self, job_id: &str, message: &str) -> Result<bool> {
        Ok(self.update(
            job_id,
            &[JobStatus::Pending, JobStatus::Processing],
            |job| {
                job.status = JobStatus::Failed;
                job.error_message = Some(message.to_string());
            },
        ))
    }

    async fn mark_cancelled(&self, job_id: &str, message: &str) -> Result<bool> {
        Ok(self.update(
            job_id,
            &[JobStatus::Pending, JobStatus::Processing],
            |job| {
                job.status = JobStatus::Cancelled;
                job.error_message = Some(message.to_string());
            },
        ))
    }

    async fn requeue(&self, job_id: &str, retry_count: i32, last_error: &str) -> Result<bool> {
        Ok(self.update(job_id, &[JobStatus::Processing], |job| {
            job.status = JobStatus::Pending;
            job.progress = 0.0;
            job.current_stage = 0;
            job.retry_count = retry_count;
            job.error_message = Some(last_error.to_string());
        }))
    }

    async fn reset_for_retry(&self, job_id: &str, retry_count: i32) -> Result<bool> {
        Ok(self.update(
            job_id,
            &[JobStatus::Failed, JobStatus::Cancelled],
            |job| {
                job.status = JobStatus::Pending;
                job.progress = 0.0;
                job.current_stage = 0;
                job.retry_count = retry_count;
                job.error_message = None;
                job.published_path = None;
                job.completed_at = None;
            },
        ))
    }

    async fn delete(&self, job_id: &str) -> Result<bool> {
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|j| j.job_id != job_id);
        Ok(jobs.len() != before)
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    messages: Mutex<Vec<OutboundMessage>>,
    failing: AtomicBool,
}

impl RecordingPublisher {
    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.messages.lock().unwrap().clone()
    }

    pub fn routed_to(&self, routing_key: &str) -> Vec<OutboundMessage> {
        self.messages()
            .into_iter()
            .filter(|m| m.routing_key == routing_key)
            .collect()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl TaskPublisher for RecordingPublisher {
    async fn publish(&self, message: &OutboundMessage) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("broker unavailable"));
        }
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// A `JobService` wired to in-memory collaborators and a scratch directory.
pub struct Harness {
    pub service: JobService,
    pub repo: Arc<MemoryJobRepository>,
    pub store: Arc<MemoryStore>,
    pub publisher: Arc<RecordingPublisher>,
    pub registry: ProcessRegistry,
    pub dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(|_| {})
    }

    pub fn with_settings(configure: impl FnOnce(&mut TranscodeSettings)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut settings = TranscodeSettings {
            output_dir: dir.path().join("out"),
            ..TranscodeSettings::default()
        };
        configure(&mut settings);

        let repo = Arc::new(MemoryJobRepository::default());
        let store = Arc::new(MemoryStore::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let registry = ProcessRegistry::default();
        let service = JobService::new(
            repo.clone(),
            store.clone(),
            publisher.clone(),
            registry.clone(),
            Arc::new(settings),
        );

        Self {
            service,
            repo,
            store,
            publisher,
            registry,
            dir,
        }
    }

    /// Writes a small source file and returns its path.
    pub fn source(&self, name: &str) -> String {
        let path = self.dir.path().join(name);
        std::fs::write(&path, format!("media:{}", name)).unwrap();
        path.to_string_lossy().into_owned()
    }

    pub fn video_request(&self, source: &str, immediate: bool) -> CreateJobRequest {
        CreateJobRequest {
            source_path: source.to_string(),
            audio_track_index: Some(0),
            subtitle_track_index: None,
            immediate,
            fingerprint: None,
        }
    }

    pub fn subtitle_request(&self, source: &str, track: i32) -> CreateSubtitleJobRequest {
        CreateSubtitleJobRequest {
            source_path: source.to_string(),
            subtitle_track_index: track,
            fingerprint: None,
        }
    }

    pub fn mirror(&self, job: &Job) -> Option<CachedStatus> {
        self.store
            .value(&job.job_type.status_key(&job.job_id))
            .map(|json| serde_json::from_str(&json).unwrap())
    }

    /// Creates a file inside the job's output directory.
    pub fn output_file(&self, job: &Job, name: &str) -> PathBuf {
        let dir = PathBuf::from(job.output_path.clone().unwrap());
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, b"artifact").unwrap();
        path
    }

    pub fn published<T: serde::de::DeserializeOwned>(&self, routing_key: &str) -> Vec<T> {
        self.publisher
            .routed_to(routing_key)
            .iter()
            .map(|m| serde_json::from_slice(&m.payload).unwrap())
            .collect()
    }
}

use serde::{Deserialize, Serialize};

use super::model::Job;

/// Video transcode work item published to `transcode.normal` / `transcode.priority`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeTask {
    pub job_id: String,
    pub source_path: String,
    pub audio_track_index: i32,
    pub subtitle_track_index: i32,
    pub output_dir: String,
    pub immediate: bool,
    pub retry_count: i32,
    pub fingerprint: Option<String>,
}

impl TranscodeTask {
    pub fn from_job(job: &Job, output_dir: String, retry_count: i32) -> Self {
        Self {
            job_id: job.job_id.clone(),
            source_path: job.source_path.clone(),
            audio_track_index: job.audio_track_index,
            subtitle_track_index: job.subtitle_track_index,
            output_dir,
            immediate: job.immediate,
            retry_count,
            fingerprint: job.fingerprint.clone(),
        }
    }

    /// Copy of this task for the next attempt. Published messages are never mutated.
    pub fn next_attempt(&self) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleTranscodeTask {
    pub job_id: String,
    pub source_path: String,
    pub subtitle_track_index: i32,
    pub output_dir: String,
    pub retry_count: i32,
    pub fingerprint: Option<String>,
}

impl SubtitleTranscodeTask {
    pub fn from_job(job: &Job, output_dir: String, retry_count: i32) -> Self {
        Self {
            job_id: job.job_id.clone(),
            source_path: job.source_path.clone(),
            subtitle_track_index: job.subtitle_track_index,
            output_dir,
            retry_count,
            fingerprint: job.fingerprint.clone(),
        }
    }

    pub fn next_attempt(&self) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            ..self.clone()
        }
    }
}

/// Delay-queue payload. Enough to remove a job's artifacts without reading the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupTask {
    pub job_id: String,
    pub output_dir: String,
    pub fingerprint: Option<String>,
}

/// Minimal view of anything landing in the dead-letter queue.
#[derive(Debug, Clone, Deserialize)]
pub struct DeadLetterEnvelope {
    pub job_id: String,
    #[serde(default)]
    pub retry_count: i32,
}

use crate::config::env::{self, EnvKey};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

const DAY_SECS: u64 = 24 * 60 * 60;

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    pub server_port: u16,
    pub database_url: String,
    pub redis_url: String,
    pub rabbitmq_url: String,
    pub jwt_secret: String,
    pub transcode: TranscodeSettings,
}

impl AppConfig {
    pub fn new() -> Result<Self, std::env::VarError> {
        Ok(Self {
            server_port: env::get_parsed(EnvKey::ServerPort, 3000),
            database_url: env::get(EnvKey::DatabaseUrl)?,
            redis_url: env::get(EnvKey::RedisUrl)?,
            rabbitmq_url: env::get(EnvKey::RabbitMqUrl)?,
            jwt_secret: env::get(EnvKey::JwtSecret)?,
            transcode: TranscodeSettings::from_env(),
        })
    }
}

/// Knobs for the transcode pipeline, the supervisor and the cleanup loops.
#[derive(Clone, Debug, Deserialize)]
pub struct TranscodeSettings {
    pub output_dir: PathBuf,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    /// Global ceiling on concurrently running encoder processes.
    pub max_concurrent: usize,
    pub acquire_timeout_secs: u64,
    /// Hard wall-clock budget for a single encoder invocation.
    pub encode_timeout_secs: u64,
    pub worker_backlog: usize,
    pub transcode_consumers: usize,
    pub subtitle_consumers: usize,
    pub video_retention_secs: u64,
    pub subtitle_retention_secs: u64,
    pub status_ttl_secs: u64,
    pub scavenger_cron: String,
}

impl Default for TranscodeSettings {
    fn default() -> Self {
        Self {
            output_dir: std::env::temp_dir().join("foxnas").join("transcode"),
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            max_concurrent: 2,
            acquire_timeout_secs: 30,
            encode_timeout_secs: 60 * 60,
            worker_backlog: 10,
            transcode_consumers: 2,
            subtitle_consumers: 3,
            video_retention_secs: 7 * DAY_SECS,
            subtitle_retention_secs: DAY_SECS,
            status_ttl_secs: 8 * 60 * 60,
            scavenger_cron: "0 * * * * *".to_string(),
        }
    }
}

impl TranscodeSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            output_dir: env::get(EnvKey::OutputDir)
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            ffmpeg_path: env::get_or(EnvKey::FfmpegPath, &defaults.ffmpeg_path),
            ffprobe_path: env::get_or(EnvKey::FfprobePath, &defaults.ffprobe_path),
            max_concurrent: env::get_parsed(EnvKey::MaxConcurrent, defaults.max_concurrent).max(1),
            acquire_timeout_secs: env::get_parsed(
                EnvKey::AcquireTimeoutSecs,
                defaults.acquire_timeout_secs,
            ),
            encode_timeout_secs: env::get_parsed(
                EnvKey::EncodeTimeoutSecs,
                defaults.encode_timeout_secs,
            ),
            worker_backlog: env::get_parsed(EnvKey::WorkerBacklog, defaults.worker_backlog).max(1),
            transcode_consumers: env::get_parsed(
                EnvKey::TranscodeConsumers,
                defaults.transcode_consumers,
            ),
            subtitle_consumers: env::get_parsed(
                EnvKey::SubtitleConsumers,
                defaults.subtitle_consumers,
            ),
            video_retention_secs: env::get_parsed(
                EnvKey::VideoRetentionSecs,
                defaults.video_retention_secs,
            ),
            subtitle_retention_secs: env::get_parsed(
                EnvKey::SubtitleRetentionSecs,
                defaults.subtitle_retention_secs,
            ),
            status_ttl_secs: env::get_parsed(EnvKey::StatusTtlSecs, defaults.status_ttl_secs),
            scavenger_cron: env::get_or(EnvKey::ScavengerCron, &defaults.scavenger_cron),
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn encode_timeout(&self) -> Duration {
        Duration::from_secs(self.encode_timeout_secs)
    }

    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_secs)
    }

    pub fn video_retention(&self) -> Duration {
        Duration::from_secs(self.video_retention_secs)
    }

    pub fn subtitle_retention(&self) -> Duration {
        Duration::from_secs(self.subtitle_retention_secs)
    }

    pub fn job_output_dir(&self, job_id: &str) -> PathBuf {
        self.output_dir.join(job_id)
    }
}

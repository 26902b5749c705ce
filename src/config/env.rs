use std::env;
use std::str::FromStr;

pub enum EnvKey {
    ServerPort,
    DatabaseUrl,
    RedisUrl,
    RabbitMqUrl,
    JwtSecret,
    OutputDir,
    FfmpegPath,
    FfprobePath,
    MaxConcurrent,
    AcquireTimeoutSecs,
    EncodeTimeoutSecs,
    WorkerBacklog,
    TranscodeConsumers,
    SubtitleConsumers,
    VideoRetentionSecs,
    SubtitleRetentionSecs,
    StatusTtlSecs,
    ScavengerCron,
}

impl EnvKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvKey::ServerPort => "APP_PORT",
            EnvKey::DatabaseUrl => "DATABASE_URL",
            EnvKey::RedisUrl => "REDIS_URL",
            EnvKey::RabbitMqUrl => "RABBITMQ_URL",
            EnvKey::JwtSecret => "JWT_SECRET",
            EnvKey::OutputDir => "TRANSCODE_OUTPUT_DIR",
            EnvKey::FfmpegPath => "FFMPEG_PATH",
            EnvKey::FfprobePath => "FFPROBE_PATH",
            EnvKey::MaxConcurrent => "TRANSCODE_MAX_CONCURRENT",
            EnvKey::AcquireTimeoutSecs => "TRANSCODE_ACQUIRE_TIMEOUT_SECS",
            EnvKey::EncodeTimeoutSecs => "TRANSCODE_TIMEOUT_SECS",
            EnvKey::WorkerBacklog => "TRANSCODE_WORKER_BACKLOG",
            EnvKey::TranscodeConsumers => "TRANSCODE_CONSUMERS",
            EnvKey::SubtitleConsumers => "SUBTITLE_CONSUMERS",
            EnvKey::VideoRetentionSecs => "VIDEO_RETENTION_SECS",
            EnvKey::SubtitleRetentionSecs => "SUBTITLE_RETENTION_SECS",
            EnvKey::StatusTtlSecs => "STATUS_TTL_SECS",
            EnvKey::ScavengerCron => "SCAVENGER_CRON",
        }
    }
}

pub fn get(key: EnvKey) -> Result<String, env::VarError> {
    env::var(key.as_str())
}

pub fn get_or(key: EnvKey, default: &str) -> String {
    env::var(key.as_str()).unwrap_or_else(|_| default.to_string())
}

pub fn get_parsed<T: FromStr>(key: EnvKey, default: T) -> T {
    match get(key) {
        Ok(val) => val.parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

//! ffmpeg pipelines run through the process supervisor.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::settings::TranscodeSettings;
use crate::modules::transcode::error::{TranscodeError, TranscodeResult};
use crate::modules::transcode::events::{SubtitleTranscodeTask, TranscodeTask};
use crate::modules::transcode::media_path;
use crate::supervisor::atomic::{finalize_artifact, temp_path_for};
use crate::supervisor::{Invocation, ProcessSupervisor, ProgressCallback};

pub const PLAYLIST: &str = "playlist.m3u8";
const SEGMENT_PATTERN: &str = "chunk-%05d.ts";
const SEGMENT_SECONDS: &str = "3";
const MIN_AUDIO_BYTES: u64 = 1024;
const MIN_SUBTITLE_BYTES: u64 = 10;
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageProgress {
    pub stage: i32,
    pub percent: f64,
}

/// Latest-value progress channel; intermediate values may be skipped.
#[derive(Clone)]
pub struct ProgressReporter {
    tx: Arc<watch::Sender<Option<StageProgress>>>,
}

impl ProgressReporter {
    pub fn channel() -> (Self, watch::Receiver<Option<StageProgress>>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn report(&self, stage: i32, percent: f64) {
        self.tx.send_replace(Some(StageProgress { stage, percent }));
    }

    pub fn callback(&self, stage: i32) -> ProgressCallback {
        let reporter = self.clone();
        Arc::new(move |percent| reporter.report(stage, percent))
    }
}

pub struct EncodeContext {
    pub cancel: CancellationToken,
    pub progress: ProgressReporter,
}

/// Produces a job's published artifact; returns its published path.
#[async_trait]
pub trait MediaEncoder: Send + Sync {
    async fn encode_video(&self, task: &TranscodeTask, ctx: &EncodeContext) -> TranscodeResult<String>;

    async fn extract_subtitle(
        &self,
        task: &SubtitleTranscodeTask,
        ctx: &EncodeContext,
    ) -> TranscodeResult<String>;
}

pub struct HlsEncoder {
    supervisor: ProcessSupervisor,
    ffmpeg: String,
    ffprobe: String,
}

impl HlsEncoder {
    pub fn new(supervisor: ProcessSupervisor, settings: &TranscodeSettings) -> Self {
        Self {
            supervisor,
            ffmpeg: settings.ffmpeg_path.clone(),
            ffprobe: settings.ffprobe_path.clone(),
        }
    }

    /// Unknown durations only cost progress reporting, never the encode.
    async fn probe_duration(&self, source: &str) -> Option<Duration> {
        let probe = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
                source,
            ])
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(PROBE_TIMEOUT, probe).await {
            Ok(Ok(output)) if output.status.success() => {
                parse_duration(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(Ok(output)) => {
                warn!(source, status = %output.status, "ffprobe failed");
                None
            }
            Ok(Err(e)) => {
                warn!(source, "Failed to run ffprobe: {}", e);
                None
            }
            Err(_) => {
                warn!(source, "ffprobe timed out");
                None
            }
        }
    }

    async fn extract(
        &self,
        invocation: Invocation,
        tmp: &Path,
        dest: &Path,
        min_size: u64,
        ctx: &EncodeContext,
        stage: i32,
    ) -> TranscodeResult<()> {
        let _ = fs::remove_file(tmp).await;
        if let Err(e) = self
            .supervisor
            .execute(invocation, &ctx.cancel, Some(ctx.progress.callback(stage)))
            .await
        {
            let _ = fs::remove_file(tmp).await;
            return Err(e);
        }
        finalize_artifact(tmp, dest, min_size).await
    }
}

#[async_trait]
impl MediaEncoder for HlsEncoder {
    async fn encode_video(&self, task: &TranscodeTask, ctx: &EncodeContext) -> TranscodeResult<String> {
        let out_dir = PathBuf::from(&task.output_dir);
        fs::create_dir_all(&out_dir).await?;
        let total = self.probe_duration(&task.source_path).await;
        debug!(job_id = %task.job_id, ?total, "Probed source");

        ctx.progress.report(1, 0.0);
        let audio = out_dir.join(format!("audio_track_{}.aac", task.audio_track_index));
        let tmp = temp_path_for(&audio);
        let invocation = Invocation::new("audio", &self.ffmpeg)
            .args(audio_args(&task.source_path, task.audio_track_index, &tmp))
            .total_duration(total);
        self.extract(invocation, &tmp, &audio, MIN_AUDIO_BYTES, ctx, 1)
            .await?;

        if task.subtitle_track_index >= 0 {
            let vtt = out_dir.join(format!("subtitle_track_{}.vtt", task.subtitle_track_index));
            let tmp = temp_path_for(&vtt);
            let invocation = Invocation::new("subtitle", &self.ffmpeg)
                .args(subtitle_args(&task.source_path, task.subtitle_track_index, &tmp))
                .total_duration(total);
            match self
                .extract(invocation, &tmp, &vtt, MIN_SUBTITLE_BYTES, ctx, 1)
                .await
            {
                Ok(()) => {}
                Err(TranscodeError::EncodeFailed(reason)) => {
                    warn!(job_id = %task.job_id, "Continuing without subtitles: {}", reason);
                }
                Err(e) => return Err(e),
            }
        }

        ctx.progress.report(2, 0.0);
        let invocation = Invocation::new("hls", &self.ffmpeg)
            .args(hls_args(&task.source_path, &audio, &out_dir))
            .total_duration(total);
        self.supervisor
            .execute(invocation, &ctx.cancel, Some(ctx.progress.callback(2)))
            .await?;

        if !fs::try_exists(out_dir.join(PLAYLIST)).await.unwrap_or(false) {
            return Err(TranscodeError::EncodeFailed(format!(
                "encoder exited cleanly but {} is missing",
                PLAYLIST
            )));
        }

        info!(job_id = %task.job_id, "HLS output ready");
        Ok(media_path(&task.job_id, PLAYLIST))
    }

    async fn extract_subtitle(
        &self,
        task: &SubtitleTranscodeTask,
        ctx: &EncodeContext,
    ) -> TranscodeResult<String> {
        let out_dir = PathBuf::from(&task.output_dir);
        fs::create_dir_all(&out_dir).await?;
        let total = self.probe_duration(&task.source_path).await;

        ctx.progress.report(1, 0.0);
        let file_name = format!("subtitle_{}.vtt", task.subtitle_track_index);
        let vtt = out_dir.join(&file_name);
        let tmp = temp_path_for(&vtt);
        let invocation = Invocation::new("subtitle", &self.ffmpeg)
            .args(subtitle_args(&task.source_path, task.subtitle_track_index, &tmp))
            .total_duration(total);
        self.extract(invocation, &tmp, &vtt, MIN_SUBTITLE_BYTES, ctx, 1)
            .await?;

        Ok(media_path(&task.job_id, &file_name))
    }
}

fn parse_duration(stdout: &str) -> Option<Duration> {
    stdout
        .lines()
        .find_map(|line| line.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .map(Duration::from_secs_f64)
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn audio_args(source: &str, track: i32, tmp: &Path) -> Vec<String> {
    vec![
        "-y".into(),
        "-i".into(),
        source.into(),
        "-map".into(),
        format!("0:a:{}", track),
        "-vn".into(),
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        "192k".into(),
        "-progress".into(),
        "pipe:1".into(),
        "-nostats".into(),
        "-f".into(),
        "adts".into(),
        path_arg(tmp),
    ]
}

fn subtitle_args(source: &str, track: i32, tmp: &Path) -> Vec<String> {
    vec![
        "-y".into(),
        "-i".into(),
        source.into(),
        "-map".into(),
        format!("0:s:{}", track),
        "-c:s".into(),
        "webvtt".into(),
        "-progress".into(),
        "pipe:1".into(),
        "-nostats".into(),
        "-f".into(),
        "webvtt".into(),
        path_arg(tmp),
    ]
}

fn hls_args(source: &str, audio: &Path, out_dir: &Path) -> Vec<String> {
    vec![
        "-y".into(),
        "-i".into(),
        source.into(),
        "-i".into(),
        path_arg(audio),
        "-map".into(),
        "0:v:0".into(),
        "-map".into(),
        "1:a:0".into(),
        "-c:v".into(),
        "copy".into(),
        "-c:a".into(),
        "copy".into(),
        "-f".into(),
        "hls".into(),
        "-hls_time".into(),
        SEGMENT_SECONDS.into(),
        "-hls_playlist_type".into(),
        "vod".into(),
        "-hls_segment_filename".into(),
        path_arg(&out_dir.join(SEGMENT_PATTERN)),
        "-progress".into(),
        "pipe:1".into(),
        "-nostats".into(),
        path_arg(&out_dir.join(PLAYLIST)),
    ]
}

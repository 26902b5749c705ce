//! Scripted encoder for consumer tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use super::WorkerContext;
use super::encoder::{EncodeContext, MediaEncoder, PLAYLIST};
use crate::modules::transcode::error::{TranscodeError, TranscodeResult};
use crate::modules::transcode::events::{SubtitleTranscodeTask, TranscodeTask};
use crate::modules::transcode::media_path;
use crate::modules::transcode::testing::Harness;

#[derive(Clone)]
pub enum Script {
    Succeed,
    Fail,
    /// Reports `percent` on the last stage, then waits for `release`.
    Hold {
        percent: f64,
        reached: Arc<Notify>,
        release: Arc<Notify>,
    },
    /// Runs until the job's token is cancelled.
    UntilStopped { reached: Arc<Notify> },
    /// Like `UntilStopped`, but keeps writing a segment for a moment after
    /// the stop, the way a dying encoder flushes its last output.
    FlushesAfterStop { reached: Arc<Notify> },
}

pub struct FakeEncoder {
    script: Mutex<Script>,
    calls: AtomicUsize,
}

impl FakeEncoder {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn run(
        &self,
        ctx: &EncodeContext,
        output_dir: &str,
        last_stage: i32,
        published: String,
    ) -> TranscodeResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock().unwrap().clone();
        match script {
            Script::Succeed => {
                ctx.progress.report(last_stage, 100.0);
                Ok(published)
            }
            Script::Fail => Err(TranscodeError::EncodeFailed("exit status 1: corrupt input".into())),
            Script::Hold {
                percent,
                reached,
                release,
            } => {
                ctx.progress.report(last_stage, percent);
                reached.notify_one();
                release.notified().await;
                ctx.progress.report(last_stage, 100.0);
                Ok(published)
            }
            Script::UntilStopped { reached } => {
                ctx.progress.report(1, 10.0);
                reached.notify_one();
                ctx.cancel.cancelled().await;
                Err(TranscodeError::Interrupted)
            }
            Script::FlushesAfterStop { reached } => {
                reached.notify_one();
                ctx.cancel.cancelled().await;
                tokio::time::sleep(Duration::from_millis(50)).await;
                tokio::fs::create_dir_all(output_dir).await?;
                tokio::fs::write(Path::new(output_dir).join("chunk-00007.ts"), b"late").await?;
                Err(TranscodeError::Interrupted)
            }
        }
    }
}

#[async_trait]
impl MediaEncoder for FakeEncoder {
    async fn encode_video(&self, task: &TranscodeTask, ctx: &EncodeContext) -> TranscodeResult<String> {
        self.run(ctx, &task.output_dir, 2, media_path(&task.job_id, PLAYLIST))
            .await
    }

    async fn extract_subtitle(
        &self,
        task: &SubtitleTranscodeTask,
        ctx: &EncodeContext,
    ) -> TranscodeResult<String> {
        let file = format!("subtitle_{}.vtt", task.subtitle_track_index);
        self.run(ctx, &task.output_dir, 1, media_path(&task.job_id, &file))
            .await
    }
}

pub fn context(h: &Harness, encoder: Arc<FakeEncoder>) -> WorkerContext {
    WorkerContext {
        jobs: h.service.clone(),
        registry: h.registry.clone(),
        encoder,
    }
}

/// Payload of the most recent message published under `routing_key`.
pub fn last_payload(h: &Harness, routing_key: &str) -> Vec<u8> {
    h.publisher
        .routed_to(routing_key)
        .last()
        .map(|m| m.payload.clone())
        .unwrap()
}

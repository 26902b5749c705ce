use async_trait::async_trait;
use tracing::info;

use super::encoder::{EncodeContext, MediaEncoder};
use super::{Delivered, Disposition, WorkItem, WorkerContext, process, run_consumer};
use crate::infrastructure::queue::rabbitmq::RabbitMqService;
use crate::infrastructure::queue::topology::{QUEUE_NORMAL, QUEUE_PRIORITY};
use crate::modules::transcode::error::TranscodeResult;
use crate::modules::transcode::events::TranscodeTask;
use crate::modules::transcode::model::JobType;
use crate::modules::transcode::publisher::OutboundMessage;

#[async_trait]
impl WorkItem for TranscodeTask {
    fn job_id(&self) -> &str {
        &self.job_id
    }

    fn job_type(&self) -> JobType {
        JobType::Video
    }

    fn retry_count(&self) -> i32 {
        self.retry_count
    }

    fn retry_message(&self) -> anyhow::Result<OutboundMessage> {
        OutboundMessage::transcode(&self.next_attempt())
    }

    async fn encode(
        &self,
        encoder: &dyn MediaEncoder,
        ctx: &EncodeContext,
    ) -> TranscodeResult<String> {
        encoder.encode_video(self, ctx).await
    }
}

pub async fn handle_transcode(ctx: WorkerContext, delivered: impl Into<Delivered>) -> Disposition {
    process::<TranscodeTask>(&ctx, &delivered.into()).await
}

/// `consumers` consumers on each of the normal and priority lanes.
pub fn start_transcode_workers(rabbit: &RabbitMqService, ctx: &WorkerContext, consumers: usize) {
    for queue in [QUEUE_NORMAL, QUEUE_PRIORITY] {
        for n in 0..consumers.max(1) {
            let ctx = ctx.clone();
            let tag = format!("{}-{}", queue, n);
            tokio::spawn(run_consumer(rabbit.clone(), queue, tag, move |delivered| {
                handle_transcode(ctx.clone(), delivered)
            }));
        }
    }
    info!(consumers, "Transcode workers started");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::queue::topology::{EXCHANGE_DELAY, ROUTING_DELAY, ROUTING_NORMAL};
    use crate::modules::transcode::events::CleanupTask;
    use crate::modules::transcode::model::JobStatus;
    use crate::modules::transcode::testing::Harness;
    use crate::workers::testing::{FakeEncoder, Script, context, last_payload};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Notify;

    async fn wait_for_progress(h: &Harness, job_id: &str, expected: f64) {
        for _ in 0..200 {
            let progress = h.service.progress(job_id, "u1").await.unwrap();
            if progress.progress == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("progress never reached {}", expected);
    }

    #[tokio::test]
    async fn job_runs_to_completion_and_schedules_cleanup() {
        let h = Harness::new();
        let job = h.service.create_video_job("u1", h.video_request(&h.source("movie.mp4"), false)).await.unwrap();
        let reached = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let encoder = FakeEncoder::new(Script::Hold {
            percent: 50.0,
            reached: reached.clone(),
            release: release.clone(),
        });
        let ctx = context(&h, encoder);

        let payload = last_payload(&h, ROUTING_NORMAL);
        let running = tokio::spawn(handle_transcode(ctx, payload));

        reached.notified().await;
        wait_for_progress(&h, &job.job_id, 50.0).await;
        let progress = h.service.progress(&job.job_id, "u1").await.unwrap();
        assert_eq!(progress.status, JobStatus::Processing);
        assert_eq!(progress.progress, 50.0);
        assert_eq!(progress.current_stage, 2);
        assert!(h.registry.is_running(&job.job_id));

        release.notify_one();
        assert_eq!(running.await.unwrap(), Disposition::Ack);

        let done = h.repo.get(&job.job_id).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(
            done.published_path.as_deref(),
            Some(format!("/api/v1/transcode/media/{}/playlist.m3u8", job.job_id).as_str())
        );
        assert_eq!(h.mirror(&job).unwrap().state, JobStatus::Completed);
        assert!(!h.registry.is_running(&job.job_id));

        let cleanups = h.publisher.routed_to(ROUTING_DELAY);
        assert_eq!(cleanups.len(), 1);
        assert_eq!(cleanups[0].exchange, EXCHANGE_DELAY);
        let cleanup: CleanupTask = serde_json::from_slice(&cleanups[0].payload).unwrap();
        assert_eq!(cleanup.job_id, job.job_id);
        assert_eq!(cleanup.fingerprint, job.fingerprint);
        assert_eq!(
            h.service.retention(JobType::Video),
            Duration::from_secs(7 * 24 * 3600)
        );
    }

    #[tokio::test]
    async fn failures_retry_up_to_the_ceiling_then_dead_letter() {
        let h = Harness::new();
        let job = h.service.create_video_job("u1", h.video_request(&h.source("movie.mp4"), false)).await.unwrap();
        let encoder = FakeEncoder::new(Script::Fail);
        let ctx = context(&h, encoder.clone());

        for attempt in 1..=3 {
            let payload = last_payload(&h, ROUTING_NORMAL);
            assert_eq!(handle_transcode(ctx.clone(), payload).await, Disposition::Ack);
            let stored = h.repo.get(&job.job_id).unwrap();
            assert_eq!(stored.status, JobStatus::Pending);
            assert_eq!(stored.retry_count, attempt);
        }

        let payload = last_payload(&h, ROUTING_NORMAL);
        assert_eq!(handle_transcode(ctx, payload).await, Disposition::Reject);

        let failed = h.repo.get(&job.job_id).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.retry_count, 3);
        assert!(failed.error_message.as_deref().unwrap().starts_with("Gave up after 4 attempt(s)"));
        assert_eq!(h.publisher.routed_to(ROUTING_NORMAL).len(), 4);
        assert_eq!(encoder.calls(), 4);
        assert!(!h.store.contains(&format!("fp2job:{}", job.fingerprint.unwrap())));
    }

    #[tokio::test]
    async fn retried_messages_are_new_tasks_with_incremented_count() {
        let h = Harness::new();
        h.service.create_video_job("u1", h.video_request(&h.source("movie.mp4"), true)).await.unwrap();
        let ctx = context(&h, FakeEncoder::new(Script::Fail));

        let first = last_payload(&h, "task.priority");
        handle_transcode(ctx, first.clone()).await;

        let retried = h.publisher.routed_to("task.priority");
        assert_eq!(retried.len(), 2);
        let original: TranscodeTask = serde_json::from_slice(&first).unwrap();
        let next: TranscodeTask = serde_json::from_slice(&retried[1].payload).unwrap();
        assert_eq!(original.retry_count, 0);
        assert_eq!(next.retry_count, 1);
        assert_eq!(retried[1].priority, retried[0].priority);
    }

    #[tokio::test]
    async fn finished_job_is_skipped_without_encoding() {
        let h = Harness::new();
        let job = h.service.create_video_job("u1", h.video_request(&h.source("movie.mp4"), false)).await.unwrap();
        let payload = last_payload(&h, ROUTING_NORMAL);
        h.service.stop(&job.job_id, "u1").await.unwrap();

        let encoder = FakeEncoder::new(Script::Succeed);
        let ctx = context(&h, encoder.clone());
        assert_eq!(handle_transcode(ctx, payload).await, Disposition::Ack);
        assert_eq!(encoder.calls(), 0);
        assert_eq!(h.repo.get(&job.job_id).unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn stop_during_encode_cancels_without_retry() {
        let h = Harness::new();
        let job = h.service.create_video_job("u1", h.video_request(&h.source("movie.mp4"), false)).await.unwrap();
        let reached = Arc::new(Notify::new());
        let ctx = context(
            &h,
            FakeEncoder::new(Script::UntilStopped {
                reached: reached.clone(),
            }),
        );

        let running = tokio::spawn(handle_transcode(ctx, last_payload(&h, ROUTING_NORMAL)));
        reached.notified().await;
        assert!(h.service.stop(&job.job_id, "u1").await.unwrap());
        assert_eq!(running.await.unwrap(), Disposition::Ack);

        let stopped = h.repo.get(&job.job_id).unwrap();
        assert_eq!(stopped.status, JobStatus::Cancelled);
        assert_eq!(stopped.retry_count, 0);
        assert_eq!(h.publisher.routed_to(ROUTING_NORMAL).len(), 1);
        assert!(!h.registry.is_running(&job.job_id));
    }

    #[tokio::test]
    async fn failed_retry_publish_fails_the_job() {
        let h = Harness::new();
        let job = h.service.create_video_job("u1", h.video_request(&h.source("movie.mp4"), false)).await.unwrap();
        let payload = last_payload(&h, ROUTING_NORMAL);
        h.publisher.set_failing(true);

        let ctx = context(&h, FakeEncoder::new(Script::Fail));
        assert_eq!(handle_transcode(ctx, payload).await, Disposition::Reject);
        let failed = h.repo.get(&job.job_id).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.error_message.unwrap().contains("enqueue retry"));
    }

    #[tokio::test]
    async fn unreadable_task_is_rejected() {
        let h = Harness::new();
        let ctx = context(&h, FakeEncoder::new(Script::Succeed));
        assert_eq!(
            handle_transcode(ctx, b"{not json".to_vec()).await,
            Disposition::Reject
        );
    }

    #[tokio::test]
    async fn message_from_an_earlier_attempt_never_encodes() {
        let h = Harness::new();
        let job = h.service.create_video_job("u1", h.video_request(&h.source("movie.mp4"), false)).await.unwrap();
        let stale = last_payload(&h, ROUTING_NORMAL);
        assert!(h.service.stop(&job.job_id, "u1").await.unwrap());
        assert!(h.service.retry(&job.job_id, "u1").await.unwrap());
        let fresh = last_payload(&h, ROUTING_NORMAL);

        let reached = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let encoder = FakeEncoder::new(Script::Hold {
            percent: 20.0,
            reached: reached.clone(),
            release: release.clone(),
        });
        let ctx = context(&h, encoder.clone());

        assert_eq!(handle_transcode(ctx.clone(), stale.clone()).await, Disposition::Ack);
        assert_eq!(h.repo.get(&job.job_id).unwrap().status, JobStatus::Pending);

        let running = tokio::spawn(handle_transcode(ctx.clone(), fresh));
        reached.notified().await;
        assert_eq!(handle_transcode(ctx, stale).await, Disposition::Ack);
        assert_eq!(encoder.calls(), 1);

        release.notify_one();
        assert_eq!(running.await.unwrap(), Disposition::Ack);
        let done = h.repo.get(&job.job_id).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.retry_count, 1);
    }

    #[tokio::test]
    async fn stop_kills_the_only_encode_of_a_retried_job() {
        let h = Harness::new();
        let job = h.service.create_video_job("u1", h.video_request(&h.source("movie.mp4"), false)).await.unwrap();
        let stale = last_payload(&h, ROUTING_NORMAL);
        h.service.stop(&job.job_id, "u1").await.unwrap();
        h.service.retry(&job.job_id, "u1").await.unwrap();

        let reached = Arc::new(Notify::new());
        let encoder = FakeEncoder::new(Script::UntilStopped {
            reached: reached.clone(),
        });
        let ctx = context(&h, encoder.clone());
        let running = tokio::spawn(handle_transcode(ctx.clone(), last_payload(&h, ROUTING_NORMAL)));
        reached.notified().await;
        assert_eq!(handle_transcode(ctx, stale).await, Disposition::Ack);

        assert!(h.service.stop(&job.job_id, "u1").await.unwrap());
        assert!(!h.registry.is_running(&job.job_id));
        assert_eq!(running.await.unwrap(), Disposition::Ack);
        assert_eq!(encoder.calls(), 1);
        assert_eq!(h.repo.get(&job.job_id).unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn redelivery_resumes_a_processing_job_once() {
        let h = Harness::new();
        let job = h.service.create_video_job("u1", h.video_request(&h.source("movie.mp4"), false)).await.unwrap();
        let payload = last_payload(&h, ROUTING_NORMAL);
        // Consumer died mid-encode; the row is left PROCESSING.
        h.service.transition_processing(&job.job_id, 0, false).await.unwrap();

        let encoder = FakeEncoder::new(Script::Succeed);
        let ctx = context(&h, encoder.clone());
        assert_eq!(handle_transcode(ctx.clone(), payload.clone()).await, Disposition::Ack);
        assert_eq!(encoder.calls(), 0);

        let first = h.registry.track(&job.job_id);
        let redelivered = Delivered {
            payload: payload.clone(),
            redelivered: true,
        };
        assert_eq!(handle_transcode(ctx.clone(), redelivered.clone()).await, Disposition::Ack);
        assert_eq!(encoder.calls(), 0);
        drop(first);

        assert_eq!(handle_transcode(ctx, redelivered).await, Disposition::Ack);
        assert_eq!(encoder.calls(), 1);
        assert_eq!(h.repo.get(&job.job_id).unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn delete_waits_for_the_encoder_to_stop_writing() {
        let h = Harness::new();
        let job = h.service.create_video_job("u1", h.video_request(&h.source("movie.mp4"), false)).await.unwrap();
        let payload = last_payload(&h, ROUTING_NORMAL);
        let task: TranscodeTask = serde_json::from_slice(&payload).unwrap();

        let reached = Arc::new(Notify::new());
        let ctx = context(
            &h,
            FakeEncoder::new(Script::FlushesAfterStop {
                reached: reached.clone(),
            }),
        );
        let running = tokio::spawn(handle_transcode(ctx, payload));
        reached.notified().await;

        assert!(h.service.delete(&job.job_id, "u1").await.unwrap());
        assert!(!std::path::Path::new(&task.output_dir).exists());
        assert!(h.repo.get(&job.job_id).is_none());
        assert_eq!(running.await.unwrap(), Disposition::Ack);
        assert!(!std::path::Path::new(&task.output_dir).exists());
    }
}

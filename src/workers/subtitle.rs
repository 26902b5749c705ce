use async_trait::async_trait;
use tracing::info;

use super::encoder::{EncodeContext, MediaEncoder};
use super::{Delivered, Disposition, WorkItem, WorkerContext, process, run_consumer};
use crate::infrastructure::queue::rabbitmq::RabbitMqService;
use crate::infrastructure::queue::topology::QUEUE_SUBTITLE;
use crate::modules::transcode::error::TranscodeResult;
use crate::modules::transcode::events::SubtitleTranscodeTask;
use crate::modules::transcode::model::JobType;
use crate::modules::transcode::publisher::OutboundMessage;

#[async_trait]
impl WorkItem for SubtitleTranscodeTask {
    fn job_id(&self) -> &str {
        &self.job_id
    }

    fn job_type(&self) -> JobType {
        JobType::Subtitle
    }

    fn retry_count(&self) -> i32 {
        self.retry_count
    }

    fn retry_message(&self) -> anyhow::Result<OutboundMessage> {
        OutboundMessage::subtitle(&self.next_attempt())
    }

    async fn encode(
        &self,
        encoder: &dyn MediaEncoder,
        ctx: &EncodeContext,
    ) -> TranscodeResult<String> {
        encoder.extract_subtitle(self, ctx).await
    }
}

pub async fn handle_subtitle(ctx: WorkerContext, delivered: impl Into<Delivered>) -> Disposition {
    process::<SubtitleTranscodeTask>(&ctx, &delivered.into()).await
}

pub fn start_subtitle_workers(rabbit: &RabbitMqService, ctx: &WorkerContext, consumers: usize) {
    for n in 0..consumers.max(1) {
        let ctx = ctx.clone();
        let tag = format!("{}-{}", QUEUE_SUBTITLE, n);
        tokio::spawn(run_consumer(rabbit.clone(), QUEUE_SUBTITLE, tag, move |delivered| {
            handle_subtitle(ctx.clone(), delivered)
        }));
    }
    info!(consumers, "Subtitle workers started");
}

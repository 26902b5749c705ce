pub mod cleanup;
pub mod dead_letter;
pub mod encoder;
pub mod scavenger;
pub mod subtitle;
pub mod transcoder;

#[cfg(test)]
pub mod testing;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::infrastructure::queue::rabbitmq::RabbitMqService;
use crate::modules::transcode::error::{TranscodeError, TranscodeResult};
use crate::modules::transcode::model::JobType;
use crate::modules::transcode::publisher::OutboundMessage;
use crate::modules::transcode::service::JobService;
use crate::supervisor::ProcessRegistry;
use encoder::{EncodeContext, MediaEncoder, ProgressReporter, StageProgress};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const REQUEUE_DELAY: Duration = Duration::from_secs(5);
const RELAY_DRAIN: Duration = Duration::from_secs(1);

/// What happens to a delivery once its handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Nack without requeue; work queues dead-letter it.
    Reject,
    /// Nack with requeue, for infrastructure faults worth another delivery.
    Requeue,
}

/// The parts of a broker delivery the handlers act on.
#[derive(Debug, Clone)]
pub struct Delivered {
    pub payload: Vec<u8>,
    /// Set by the broker when an earlier delivery was never settled.
    pub redelivered: bool,
}

impl From<Vec<u8>> for Delivered {
    fn from(payload: Vec<u8>) -> Self {
        Self {
            payload,
            redelivered: false,
        }
    }
}

#[derive(Clone)]
pub struct WorkerContext {
    pub jobs: JobService,
    pub registry: ProcessRegistry,
    pub encoder: Arc<dyn MediaEncoder>,
}

/// A queued task that runs an encode for one job.
#[async_trait]
pub trait WorkItem: DeserializeOwned + Send + Sync {
    fn job_id(&self) -> &str;
    fn job_type(&self) -> JobType;
    fn retry_count(&self) -> i32;
    /// Fresh message for the next attempt, on the same routing key.
    fn retry_message(&self) -> anyhow::Result<OutboundMessage>;
    async fn encode(&self, encoder: &dyn MediaEncoder, ctx: &EncodeContext)
    -> TranscodeResult<String>;
}

/// Consumes `queue` forever, reconnecting when the stream ends or breaks.
pub async fn run_consumer<F, Fut>(rabbit: RabbitMqService, queue: &'static str, tag: String, handler: F)
where
    F: Fn(Delivered) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Disposition> + Send,
{
    loop {
        let mut consumer = match rabbit.consume(queue, &tag).await {
            Ok(consumer) => consumer,
            Err(e) => {
                error!(queue, consumer = %tag, "Failed to start consumer: {}", e);
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        info!(queue, consumer = %tag, "Consumer listening");

        while let Some(delivery) = consumer.next().await {
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(e) => {
                    error!(queue, consumer = %tag, "Delivery error: {}", e);
                    break;
                }
            };

            let disposition = handler(Delivered {
                payload: delivery.data.clone(),
                redelivered: delivery.redelivered,
            })
            .await;
            debug!(queue, ?disposition, "Delivery handled");
            let settled = match disposition {
                Disposition::Ack => delivery.ack(BasicAckOptions::default()).await,
                Disposition::Reject => {
                    delivery
                        .nack(BasicNackOptions {
                            requeue: false,
                            ..BasicNackOptions::default()
                        })
                        .await
                }
                Disposition::Requeue => {
                    tokio::time::sleep(REQUEUE_DELAY).await;
                    delivery
                        .nack(BasicNackOptions {
                            requeue: true,
                            ..BasicNackOptions::default()
                        })
                        .await
                }
            };
            if let Err(e) = settled {
                error!(queue, consumer = %tag, "Failed to settle delivery: {}", e);
                break;
            }
        }

        warn!(queue, consumer = %tag, "Consumer stream ended, reconnecting");
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// Copies the latest encoder progress into the job until the reporter drops.
struct ProgressRelay {
    handle: JoinHandle<()>,
}

impl ProgressRelay {
    fn spawn(jobs: JobService, job_id: String) -> (Self, ProgressReporter) {
        let (reporter, mut rx) = ProgressReporter::channel();
        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let latest: Option<StageProgress> = *rx.borrow_and_update();
                if let Some(progress) = latest {
                    if let Err(e) = jobs
                        .update_progress(&job_id, progress.percent, progress.stage)
                        .await
                    {
                        warn!(job_id = %job_id, "Failed to record progress: {}", e);
                    }
                }
            }
        });
        (Self { handle }, reporter)
    }

    /// Waits for the last write so it cannot land after a terminal transition.
    async fn finish(mut self) {
        if tokio::time::timeout(RELAY_DRAIN, &mut self.handle)
            .await
            .is_err()
        {
            self.handle.abort();
        }
    }
}

/// Runs one delivery of a work queue through the job lifecycle.
pub async fn process<T: WorkItem>(ctx: &WorkerContext, delivered: &Delivered) -> Disposition {
    let task: T = match serde_json::from_slice(&delivered.payload) {
        Ok(task) => task,
        Err(e) => {
            error!("Discarding unreadable task: {}", e);
            return Disposition::Reject;
        }
    };
    let job_id = task.job_id().to_string();

    // A redelivery while the first delivery is still encoding here.
    if delivered.redelivered && ctx.registry.is_running(&job_id) {
        info!(job_id = %job_id, "Job already encoding in this process, skipping redelivery");
        return Disposition::Ack;
    }

    match ctx
        .jobs
        .transition_processing(&job_id, task.retry_count(), delivered.redelivered)
        .await
    {
        Ok(Some(_)) => {}
        Ok(None) => {
            info!(
                job_id = %job_id,
                retry_count = task.retry_count(),
                "Job gone, finished or on another attempt, skipping task"
            );
            return Disposition::Ack;
        }
        Err(e) => {
            error!(job_id = %job_id, "Failed to start job: {}", e);
            return Disposition::Requeue;
        }
    }
    info!(job_id = %job_id, retry_count = task.retry_count(), "Processing job");

    let handle = ctx.registry.track(&job_id);
    let (relay, progress) = ProgressRelay::spawn(ctx.jobs.clone(), job_id.clone());
    let encode_ctx = EncodeContext {
        cancel: handle.token().clone(),
        progress,
    };
    let outcome = task.encode(ctx.encoder.as_ref(), &encode_ctx).await;
    drop(encode_ctx);
    relay.finish().await;
    let stopped = handle.token().is_cancelled();
    drop(handle);

    match outcome {
        Ok(published_path) => match ctx
            .jobs
            .transition_completed(&job_id, &published_path)
            .await
        {
            Ok(Some(job)) => {
                if let Err(e) = ctx.jobs.schedule_cleanup(&job).await {
                    warn!(job_id = %job_id, "Failed to schedule cleanup: {}", e);
                }
                Disposition::Ack
            }
            Ok(None) => {
                info!(job_id = %job_id, "Job left PROCESSING during encode, result dropped");
                Disposition::Ack
            }
            Err(e) => {
                error!(job_id = %job_id, "Failed to complete job: {}", e);
                Disposition::Requeue
            }
        },
        Err(_) if stopped => {
            info!(job_id = %job_id, "Encode stopped by request");
            Disposition::Ack
        }
        Err(e) => retry_or_dead_letter(&ctx.jobs, &task, &e).await,
    }
}

/// Publishes the next attempt while under the ceiling, else fails the job and
/// rejects the delivery into the dead-letter queue.
pub async fn retry_or_dead_letter<T: WorkItem>(
    jobs: &JobService,
    task: &T,
    error: &TranscodeError,
) -> Disposition {
    let job_id = task.job_id();
    let retry_count = task.retry_count();

    if retry_count >= task.job_type().retry_ceiling() {
        let exhausted = TranscodeError::Exhausted {
            attempts: retry_count + 1,
            last_error: error.to_string(),
        };
        error!(job_id, "{}", exhausted);
        if let Err(e) = jobs.transition_failed(job_id, &exhausted.to_string()).await {
            error!(job_id, "Failed to mark job failed: {}", e);
        }
        return Disposition::Reject;
    }

    let attempt = retry_count + 1;
    warn!(job_id, attempt, "Encode failed, retrying: {}", error);
    match jobs.requeue_for_retry(job_id, attempt, &error.to_string()).await {
        Ok(true) => {}
        Ok(false) => return Disposition::Ack,
        Err(e) => {
            error!(job_id, "Failed to requeue job: {}", e);
            return Disposition::Requeue;
        }
    }

    let published = match task.retry_message() {
        Ok(message) => jobs.enqueue(&message).await,
        Err(e) => Err(e.into()),
    };
    match published {
        Ok(()) => Disposition::Ack,
        Err(e) => {
            let message = format!("Failed to enqueue retry: {}", e);
            if let Err(e) = jobs.transition_failed(job_id, &message).await {
                error!(job_id, "Failed to mark job failed: {}", e);
            }
            Disposition::Reject
        }
    }
}

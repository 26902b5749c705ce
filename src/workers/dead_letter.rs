use tracing::{error, info, warn};

use super::{Delivered, Disposition, run_consumer};
use crate::infrastructure::queue::rabbitmq::RabbitMqService;
use crate::infrastructure::queue::topology::QUEUE_DLQ;
use crate::modules::transcode::events::DeadLetterEnvelope;
use crate::modules::transcode::service::JobService;

/// Terminal sink: whatever lands here marks its job FAILED. Rejected tasks
/// are usually FAILED already; expired PENDING ones are not.
pub async fn handle_dead_letter(jobs: JobService, payload: Vec<u8>) -> Disposition {
    let envelope: DeadLetterEnvelope = match serde_json::from_slice(&payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            error!(
                bytes = payload.len(),
                "Dropping unreadable dead letter: {}", e
            );
            return Disposition::Ack;
        }
    };

    match jobs.find(&envelope.job_id).await {
        Ok(Some(job)) if job.retry_count != envelope.retry_count => {
            info!(
                job_id = %envelope.job_id,
                letter_attempt = envelope.retry_count,
                job_attempt = job.retry_count,
                "Dead letter from an earlier attempt, ignored"
            );
            return Disposition::Ack;
        }
        Ok(_) => {}
        Err(e) => {
            error!(job_id = %envelope.job_id, "Failed to load dead-lettered job: {}", e);
            return Disposition::Requeue;
        }
    }

    let message = format!(
        "Dead-lettered after {} retr{}",
        envelope.retry_count,
        if envelope.retry_count == 1 { "y" } else { "ies" }
    );
    match jobs.transition_failed(&envelope.job_id, &message).await {
        Ok(true) => warn!(job_id = %envelope.job_id, "Dead letter failed a live job"),
        Ok(false) => info!(job_id = %envelope.job_id, "Dead letter recorded"),
        Err(e) => {
            error!(job_id = %envelope.job_id, "Failed to record dead letter: {}", e);
            return Disposition::Requeue;
        }
    }
    Disposition::Ack
}

pub fn start_dead_letter_worker(rabbit: &RabbitMqService, jobs: &JobService) {
    let jobs = jobs.clone();
    tokio::spawn(run_consumer(
        rabbit.clone(),
        QUEUE_DLQ,
        format!("{}-0", QUEUE_DLQ),
        move |delivered: Delivered| handle_dead_letter(jobs.clone(), delivered.payload),
    ));
}

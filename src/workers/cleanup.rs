use tracing::{error, info};

use super::{Delivered, Disposition, run_consumer};
use crate::infrastructure::queue::rabbitmq::RabbitMqService;
use crate::infrastructure::queue::topology::QUEUE_CLEANUP;
use crate::modules::transcode::events::CleanupTask;
use crate::modules::transcode::service::JobService;

/// Fires once a delay queue's TTL runs out. Repeat deliveries are harmless.
pub async fn handle_cleanup(jobs: JobService, payload: Vec<u8>) -> Disposition {
    let task: CleanupTask = match serde_json::from_slice(&payload) {
        Ok(task) => task,
        Err(e) => {
            error!("Dropping unreadable cleanup task: {}", e);
            return Disposition::Ack;
        }
    };

    match jobs
        .purge(&task.job_id, &task.output_dir, task.fingerprint.as_deref())
        .await
    {
        Ok(removed) => {
            info!(job_id = %task.job_id, removed, "Expired job cleaned up");
            Disposition::Ack
        }
        Err(e) => {
            error!(job_id = %task.job_id, "Cleanup failed: {}", e);
            Disposition::Requeue
        }
    }
}

pub fn start_cleanup_worker(rabbit: &RabbitMqService, jobs: &JobService) {
    let jobs = jobs.clone();
    tokio::spawn(run_consumer(
        rabbit.clone(),
        QUEUE_CLEANUP,
        format!("{}-0", QUEUE_CLEANUP),
        move |delivered: Delivered| handle_cleanup(jobs.clone(), delivered.payload),
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::queue::topology::{ROUTING_DELAY, ROUTING_NORMAL};
    use crate::workers::testing::{FakeEncoder, Script, context, last_payload};
    use crate::workers::transcoder::handle_transcode;
    use crate::modules::transcode::testing::Harness;

    #[tokio::test]
    async fn delayed_cleanup_removes_every_trace_once() {
        let h = Harness::new();
        let job = h.service.create_video_job("u1", h.video_request(&h.source("movie.mp4"), false)).await.unwrap();
        let ctx = context(&h, FakeEncoder::new(Script::Succeed));
        handle_transcode(ctx, last_payload(&h, ROUTING_NORMAL)).await;
        let segment = h.output_file(&job, "chunk-00000.ts");
        let binding = format!("fp2job:{}", job.fingerprint.clone().unwrap());
        assert!(h.store.contains(&binding));

        let cleanup = last_payload(&h, ROUTING_DELAY);
        assert_eq!(handle_cleanup(h.service.clone(), cleanup.clone()).await, Disposition::Ack);

        assert!(!segment.parent().unwrap().exists());
        assert!(!h.store.contains(&binding));
        assert!(h.repo.get(&job.job_id).is_none());
        assert!(h.mirror(&job).is_none());

        assert_eq!(handle_cleanup(h.service.clone(), cleanup).await, Disposition::Ack);
    }

    #[tokio::test]
    async fn cleanup_keeps_a_newer_binding_for_the_same_source() {
        let h = Harness::new();
        let source = h.source("movie.mp4");
        let old = h.service.create_video_job("u1", h.video_request(&source, false)).await.unwrap();
        h.service.transition_processing(&old.job_id, 0, false).await.unwrap();
        h.service.transition_failed(&old.job_id, "boom").await.unwrap();
        let newer = h.service.create_video_job("u1", h.video_request(&source, false)).await.unwrap();

        let task = CleanupTask {
            job_id: old.job_id.clone(),
            output_dir: old.output_path.clone().unwrap(),
            fingerprint: old.fingerprint.clone(),
        };
        let payload = serde_json::to_vec(&task).unwrap();
        assert_eq!(handle_cleanup(h.service.clone(), payload).await, Disposition::Ack);

        assert_eq!(
            h.store.value(&format!("fp2job:{}", old.fingerprint.unwrap())),
            Some(newer.job_id.clone())
        );
        assert!(h.repo.get(&newer.job_id).is_some());
    }
}

//! Periodic backstop for the delay-queue cleanup path.

use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::modules::transcode::error::TranscodeResult;
use crate::modules::transcode::model::JobStatus;
use crate::modules::transcode::service::JobService;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub purged: usize,
    pub recovered: usize,
}

/// Purges every non-running job older than its retention window, then fails
/// orphaned PROCESSING jobs. Leaves the same end state as the cleanup consumer.
pub async fn sweep(jobs: &JobService, now: OffsetDateTime) -> TranscodeResult<SweepReport> {
    let mut report = SweepReport::default();

    for job in jobs.all_jobs().await? {
        if job.status == JobStatus::Processing {
            continue;
        }
        let expires_at = job.retention_anchor() + jobs.retention(job.job_type);
        if expires_at > now {
            continue;
        }
        match jobs.purge_job(&job).await {
            Ok(_) => {
                debug!(job_id = %job.job_id, status = %job.status, "Expired job purged");
                report.purged += 1;
            }
            Err(e) => warn!(job_id = %job.job_id, "Failed to purge expired job: {}", e),
        }
    }

    report.recovered = jobs.recover_stale_processing(now).await?;
    Ok(report)
}

fn next_delay(schedule: &Schedule, now: DateTime<Utc>) -> Option<Duration> {
    schedule
        .after(&now)
        .next()
        .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
}

pub async fn start_scavenger(jobs: JobService, expression: String) {
    let schedule = match Schedule::from_str(&expression) {
        Ok(schedule) => schedule,
        Err(e) => {
            error!(expression = %expression, "Invalid scavenger schedule, sweeps disabled: {}", e);
            return;
        }
    };
    info!(expression = %expression, "Scavenger scheduled");

    while let Some(delay) = next_delay(&schedule, Utc::now()) {
        tokio::time::sleep(delay).await;
        match sweep(&jobs, OffsetDateTime::now_utc()).await {
            Ok(report) if report != SweepReport::default() => {
                info!(purged = report.purged, recovered = report.recovered, "Scavenger sweep");
            }
            Ok(_) => debug!("Scavenger sweep found nothing"),
            Err(e) => error!("Scavenger sweep failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::transcode::testing::Harness;
    use chrono::TimeZone;

    const DAY: time::Duration = time::Duration::days(1);

    #[test]
    fn next_delay_follows_the_schedule() {
        let schedule = Schedule::from_str("0 * * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 30).unwrap();
        assert_eq!(next_delay(&schedule, now), Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn expired_jobs_are_purged_and_fresh_ones_kept() {
        let h = Harness::new();
        let now = OffsetDateTime::now_utc();

        let failed = h.service.create_video_job("u1", h.video_request(&h.source("a.mp4"), false)).await.unwrap();
        h.service.transition_failed(&failed.job_id, "boom").await.unwrap();
        h.repo.edit(&failed.job_id, |j| j.updated_at = now - DAY * 8);
        let failed_output = h.output_file(&failed, "chunk-00000.ts");

        let completed = h.service.create_video_job("u1", h.video_request(&h.source("b.mp4"), false)).await.unwrap();
        h.service.transition_processing(&completed.job_id, 0, false).await.unwrap();
        h.service.transition_completed(&completed.job_id, "/p").await.unwrap();
        h.repo.edit(&completed.job_id, |j| j.completed_at = Some(now - DAY * 8));
        let completed_output = h.output_file(&completed, "playlist.m3u8");

        let abandoned = h.service.create_subtitle_job("u1", h.subtitle_request(&h.source("c.mkv"), 0)).await.unwrap();
        h.repo.edit(&abandoned.job_id, |j| j.updated_at = now - DAY * 2);

        let fresh = h.service.create_video_job("u1", h.video_request(&h.source("d.mp4"), false)).await.unwrap();
        h.service.transition_processing(&fresh.job_id, 0, false).await.unwrap();
        h.service.transition_completed(&fresh.job_id, "/p").await.unwrap();

        let report = sweep(&h.service, now).await.unwrap();
        assert_eq!(report, SweepReport { purged: 3, recovered: 0 });

        for job in [&failed, &completed, &abandoned] {
            assert!(h.repo.get(&job.job_id).is_none());
            assert!(h.mirror(job).is_none());
            assert!(!h.store.contains(&format!("fp2job:{}", job.fingerprint.clone().unwrap())));
        }
        assert!(!failed_output.parent().unwrap().exists());
        assert!(!completed_output.parent().unwrap().exists());
        assert!(h.repo.get(&fresh.job_id).is_some());
        assert!(h.store.contains(&format!("fp2job:{}", fresh.fingerprint.unwrap())));

        assert_eq!(sweep(&h.service, now).await.unwrap(), SweepReport::default());
    }

    #[tokio::test]
    async fn orphaned_processing_jobs_fail_but_live_ones_stay() {
        let h = Harness::new();
        let now = OffsetDateTime::now_utc();

        let orphan = h.service.create_video_job("u1", h.video_request(&h.source("a.mp4"), false)).await.unwrap();
        h.service.transition_processing(&orphan.job_id, 0, false).await.unwrap();
        h.repo.edit(&orphan.job_id, |j| j.updated_at = now - DAY * 30);

        let live = h.service.create_video_job("u1", h.video_request(&h.source("b.mp4"), false)).await.unwrap();
        h.service.transition_processing(&live.job_id, 0, false).await.unwrap();
        h.repo.edit(&live.job_id, |j| j.updated_at = now - DAY * 30);
        let _handle = h.registry.track(&live.job_id);

        let report = sweep(&h.service, now).await.unwrap();
        assert_eq!(report, SweepReport { purged: 0, recovered: 1 });

        let failed = h.repo.get(&orphan.job_id).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("interrupted: worker lost"));
        assert_eq!(h.repo.get(&live.job_id).unwrap().status, JobStatus::Processing);
    }
}

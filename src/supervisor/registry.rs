use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct Entry {
    generation: u64,
    token: CancellationToken,
    /// Closes when the owning handle drops, i.e. the encode has returned.
    exited: watch::Receiver<()>,
}

#[derive(Default)]
struct Entries {
    next_generation: u64,
    by_job: HashMap<String, Entry>,
}

/// Cancellation handles of in-flight encodes, keyed by job id, so a stop
/// request from outside the consumer can reach the running process.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    entries: Arc<Mutex<Entries>>,
}

impl ProcessRegistry {
    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a fresh token for `job_id`, replacing any previous one.
    /// The entry is removed when the returned handle drops.
    pub fn track(&self, job_id: &str) -> JobHandle {
        let token = CancellationToken::new();
        let (exit_tx, exited) = watch::channel(());
        let mut entries = self.lock();
        entries.next_generation += 1;
        let generation = entries.next_generation;
        entries.by_job.insert(
            job_id.to_string(),
            Entry {
                generation,
                token: token.clone(),
                exited,
            },
        );

        JobHandle {
            registry: self.clone(),
            job_id: job_id.to_string(),
            generation,
            token,
            _exit: exit_tx,
        }
    }

    /// Signals the running encode of `job_id`. Returns false if nothing is running.
    pub fn terminate(&self, job_id: &str) -> bool {
        match self.lock().by_job.get(job_id) {
            Some(entry) => {
                entry.token.cancel();
                info!(job_id, "Termination requested for running encode");
                true
            }
            None => false,
        }
    }

    /// Signals the running encode of `job_id` and waits until its handle is
    /// released, so the process is gone before its files are touched.
    /// Returns false if the encode was still running when `timeout` elapsed.
    pub async fn terminate_and_wait(&self, job_id: &str, timeout: Duration) -> bool {
        let exited = match self.lock().by_job.get(job_id) {
            Some(entry) => {
                entry.token.cancel();
                entry.exited.clone()
            }
            None => return true,
        };
        info!(job_id, "Waiting for running encode to exit");

        let mut exited = exited;
        let closed = async move { while exited.changed().await.is_ok() {} };
        if tokio::time::timeout(timeout, closed).await.is_err() {
            warn!(job_id, timeout_secs = timeout.as_secs(), "Encode still running after stop");
            return false;
        }
        true
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.lock().by_job.contains_key(job_id)
    }
}

pub struct JobHandle {
    registry: ProcessRegistry,
    job_id: String,
    generation: u64,
    token: CancellationToken,
    _exit: watch::Sender<()>,
}

impl JobHandle {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        let mut entries = self.registry.lock();
        if matches!(entries.by_job.get(&self.job_id), Some(entry) if entry.generation == self.generation)
        {
            entries.by_job.remove(&self.job_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminate_reaches_the_tracked_token() {
        let registry = ProcessRegistry::default();
        let handle = registry.track("job-1");
        assert!(registry.is_running("job-1"));
        assert!(registry.terminate("job-1"));
        assert!(handle.token().is_cancelled());
        assert!(!registry.terminate("job-2"));
    }

    #[test]
    fn handle_drop_unregisters_only_its_own_generation() {
        let registry = ProcessRegistry::default();
        let stale = registry.track("job-1");
        let current = registry.track("job-1");
        drop(stale);
        assert!(registry.is_running("job-1"));

        assert!(registry.terminate("job-1"));
        assert!(current.token().is_cancelled());
        drop(current);
        assert!(!registry.is_running("job-1"));
    }

    #[tokio::test]
    async fn terminate_and_wait_returns_once_the_handle_drops() {
        let registry = ProcessRegistry::default();
        let handle = registry.track("job-1");
        let encode = tokio::spawn(async move {
            handle.token().cancelled().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(handle);
        });

        assert!(registry.terminate_and_wait("job-1", Duration::from_secs(5)).await);
        assert!(!registry.is_running("job-1"));
        assert!(registry.terminate_and_wait("job-2", Duration::from_millis(10)).await);
        encode.await.unwrap();
    }

    #[tokio::test]
    async fn terminate_and_wait_gives_up_after_the_timeout() {
        let registry = ProcessRegistry::default();
        let handle = registry.track("job-1");
        assert!(!registry.terminate_and_wait("job-1", Duration::from_millis(20)).await);
        assert!(handle.token().is_cancelled());
        assert!(registry.is_running("job-1"));
    }
}

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tracing::{debug, info};

use super::cache::TtlStore;
use super::error::{TranscodeError, TranscodeResult};

const FINGERPRINT_TO_JOB_PREFIX: &str = "fp2job:";

/// Source-file fingerprints (path + size + mtime) and their fingerprint → job
/// bindings. A binding is a reuse hint; callers confirm against the durable job.
#[derive(Clone)]
pub struct FingerprintService {
    store: Arc<dyn TtlStore>,
}

impl FingerprintService {
    pub fn new(store: Arc<dyn TtlStore>) -> Self {
        Self { store }
    }

    fn key(fingerprint: &str) -> String {
        format!("{}{}", FINGERPRINT_TO_JOB_PREFIX, fingerprint)
    }

    /// Stable for as long as the file keeps its size and modification time.
    pub async fn fingerprint(&self, path: &str) -> TranscodeResult<String> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Err(TranscodeError::NotFound(format!("{} is not a file", path))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TranscodeError::NotFound(format!("source {} does not exist", path)));
            }
            Err(e) => return Err(e.into()),
        };

        let modified_ms = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);

        Ok(digest(path, metadata.len(), modified_ms))
    }

    /// Fingerprint of an artifact derived from a source, e.g. one subtitle
    /// track. Keeps derived bindings apart from the source's own.
    pub fn derive(fingerprint: &str, scope: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{}|{}", fingerprint, scope).as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub async fn bind(&self, fingerprint: &str, job_id: &str, ttl: Duration) -> Result<()> {
        self.store.set(&Self::key(fingerprint), job_id, ttl).await?;
        info!(fingerprint, job_id, ttl_secs = ttl.as_secs(), "Bound fingerprint");
        Ok(())
    }

    pub async fn resolve(&self, fingerprint: &str) -> Result<Option<String>> {
        self.store.get(&Self::key(fingerprint)).await
    }

    /// Idempotent; a missing binding is not an error. Only a binding that
    /// still points at `job_id` is removed, so releasing one job never
    /// unbinds a newer job for the same source. Returns whether one was.
    pub async fn release(&self, fingerprint: &str, job_id: &str) -> Result<bool> {
        let removed = self
            .store
            .delete_if_eq(&Self::key(fingerprint), job_id)
            .await?;
        if removed {
            debug!(fingerprint, job_id, "Released fingerprint");
        }
        Ok(removed)
    }
}

fn digest(path: &str, size: u64, modified_ms: u128) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}|{}|{}", path, size, modified_ms).as_bytes());
    format!("{:x}", hasher.finalize())
}

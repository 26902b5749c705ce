use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::modules::transcode::error::{TranscodeError, TranscodeResult};

/// Scratch location an extraction step writes to before `finalize_artifact`.
pub fn temp_path_for(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    dest.with_file_name(name)
}

/// Moves a freshly written artifact into place once it passes the size
/// check, then flushes it so later steps never read a partial file.
pub async fn finalize_artifact(tmp: &Path, dest: &Path, min_size: u64) -> TranscodeResult<()> {
    let size = fs::metadata(tmp).await.map(|m| m.len()).unwrap_or(0);
    if size < min_size {
        let _ = fs::remove_file(tmp).await;
        return Err(TranscodeError::EncodeFailed(format!(
            "{} is {} bytes, expected at least {}",
            dest.display(),
            size,
            min_size
        )));
    }

    if let Err(e) = fs::rename(tmp, dest).await {
        let _ = fs::remove_file(tmp).await;
        return Err(e.into());
    }

    let file = fs::File::open(dest).await?;
    if let Err(e) = file.sync_all().await {
        let _ = fs::remove_file(dest).await;
        return Err(e.into());
    }

    debug!(path = %dest.display(), size, "Artifact finalized");
    Ok(())
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::report::Artifact;

/// Save attempts per artifact before giving up on it.
const SAVE_ATTEMPTS: u32 = 3;
/// Base backoff between attempts; doubles each retry.
const SAVE_BACKOFF: Duration = Duration::from_millis(200);

/// Destination for report artifacts. Implementations own retry policy;
/// callers hand over the composed artifacts and move on.
#[async_trait]
pub trait StorageClient: Send + Sync {
    async fn save(&self, artifact: &Artifact) -> Result<()>;

    /// Save every artifact, continuing past individual failures. Returns how
    /// many were saved.
    async fn save_all(&self, artifacts: &[Artifact]) -> usize {
        let mut saved = 0;
        for artifact in artifacts {
            match self.save(artifact).await {
                Ok(()) => saved += 1,
                Err(err) => {
                    tracing::error!(name = %artifact.name, error = %err, "giving up on artifact");
                }
            }
        }
        saved
    }
}

/// Run-scoped local report directory.
///
/// Artifacts are written to a temp path and renamed so a crash never leaves
/// a half-written report, and readers only ever see complete files.
pub struct LocalStorage {
    dir: PathBuf,
}

impl LocalStorage {
    /// Create the run directory `<root>/<run_name>-<timestamp>/`.
    pub fn create(root: &Path, run_name: &str) -> Result<Self> {
        let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
        let dir = root.join(format!("{run_name}-{stamp}"));
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create report directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn write_atomic(&self, tmp: &Path, dest: &Path, bytes: &[u8]) -> Result<()> {
        tokio::fs::write(tmp, bytes)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(tmp, dest)
            .await
            .with_context(|| format!("failed to rename into {}", dest.display()))?;
        Ok(())
    }
}

#[async_trait]
impl StorageClient for LocalStorage {
    /// Save one artifact with bounded retries. A persistently failing
    /// artifact is logged and skipped so the others still land.
    async fn save(&self, artifact: &Artifact) -> Result<()> {
        let final_path = self.dir.join(&artifact.name);
        let tmp_path = self.dir.join(format!(".{}.tmp", artifact.name));

        let mut backoff = SAVE_BACKOFF;
        let mut last_err = None;
        for attempt in 0..SAVE_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            match self.write_atomic(&tmp_path, &final_path, &artifact.bytes).await {
                Ok(()) => {
                    tracing::debug!(name = %artifact.name, "artifact saved");
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(
                        name = %artifact.name,
                        attempt = attempt + 1,
                        error = %err,
                        "artifact save failed"
                    );
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap())
    }
}

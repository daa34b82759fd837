/*!
File-copy capture strategy for embedded, file-based stores.
*/

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;
use tracing::{info, warn};

use super::SnapshotCapturer;
use crate::{BackupError, Result};

/// Captures a file database by copying it byte for byte
///
/// Replay first copies the current live file aside as a safety snapshot
/// (`<live>.backup_<millis>`), then swaps the restored artifact into place.
/// The safety snapshot is never removed automatically.
#[derive(Debug, Clone)]
pub struct FileCopyCapturer {
    live_path: PathBuf,
}

impl FileCopyCapturer {
    pub fn new<P: Into<PathBuf>>(live_path: P) -> Self {
        Self {
            live_path: live_path.into(),
        }
    }

    /// Path of the live database file
    pub fn live_path(&self) -> &Path {
        &self.live_path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name: OsString = self
            .live_path
            .file_name()
            .map(OsString::from)
            .unwrap_or_else(|| OsString::from("database"));
        name.push(suffix);
        self.live_path.with_file_name(name)
    }

    /// Copy the live file aside; `None` when there is no live file yet
    async fn take_safety_snapshot(&self) -> Result<Option<PathBuf>> {
        if fs::metadata(&self.live_path).await.is_err() {
            warn!(
                "No existing database at {} to keep as a safety snapshot",
                self.live_path.display()
            );
            return Ok(None);
        }

        let safety = self.sibling(&format!(".backup_{}", Utc::now().timestamp_millis()));
        fs::copy(&self.live_path, &safety).await.map_err(|e| {
            BackupError::restore(format!(
                "Failed to keep safety snapshot {}: {}",
                safety.display(),
                e
            ))
        })?;
        Ok(Some(safety))
    }
}

#[async_trait]
impl SnapshotCapturer for FileCopyCapturer {
    fn engine_name(&self) -> &'static str {
        "sqlite"
    }

    fn artifact_extension(&self) -> &'static str {
        "sqlite"
    }

    async fn capture(&self, destination: &Path) -> Result<()> {
        fs::copy(&self.live_path, destination).await.map_err(|e| {
            BackupError::capture(format!(
                "SQLite backup failed: cannot copy {}: {}",
                self.live_path.display(),
                e
            ))
        })?;

        info!("SQLite database backup completed");
        Ok(())
    }

    async fn replay(&self, artifact: &Path) -> Result<()> {
        if let Some(safety) = self.take_safety_snapshot().await? {
            info!("Current database kept at {}", safety.display());
        }

        // Stage next to the live file so the final swap is a rename
        let staged = self.sibling(".restoring");
        fs::copy(artifact, &staged).await.map_err(|e| {
            BackupError::restore(format!("Failed to stage {}: {}", artifact.display(), e))
        })?;
        fs::rename(&staged, &self.live_path).await.map_err(|e| {
            BackupError::restore(format!(
                "Failed to replace {}: {}",
                self.live_path.display(),
                e
            ))
        })?;

        info!("SQLite database restored");
        Ok(())
    }
}

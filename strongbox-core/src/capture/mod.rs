/*!
Snapshot capture strategies for the primary store.

This module defines the capture abstraction (port) and one adapter per store
engine. The orchestrator only talks to [`SnapshotCapturer`], so adding an engine
never touches orchestration logic. The strategy is chosen once, from the
[`StoreConfig`], when the backup manager is built.
*/

pub mod file_copy;
pub mod relational;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{StoreConfig, StoreEngine};
use crate::{BackupError, Result};

pub use file_copy::FileCopyCapturer;
pub use relational::PgDumpCapturer;

/// Capture strategy for one store engine, together with its inverse
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotCapturer: Send + Sync {
    /// Short engine name used in logs
    fn engine_name(&self) -> &'static str;

    /// Extension of the artifact written by [`SnapshotCapturer::capture`], without the dot
    fn artifact_extension(&self) -> &'static str;

    /// Write a point-in-time copy of the store to `destination`
    ///
    /// # Errors
    /// * `BackupError::CaptureFailed` - export tool or copy failure, message kept verbatim
    async fn capture(&self, destination: &Path) -> Result<()>;

    /// Replace the live store contents with the artifact at `artifact`
    ///
    /// # Errors
    /// * `BackupError::RestoreFailed` - replay failure; no rollback is attempted
    async fn replay(&self, artifact: &Path) -> Result<()>;
}

/// Build the capture strategy matching the store's engine type
pub fn capturer_for(store: &StoreConfig) -> Box<dyn SnapshotCapturer> {
    match &store.engine {
        StoreEngine::Postgres(params) => Box::new(PgDumpCapturer::new(params.clone())),
        StoreEngine::Sqlite { path } => Box::new(FileCopyCapturer::new(path.clone())),
    }
}

/// Mirror each source directory into `staging/<dir name>/`
///
/// Relative structure below every source is preserved. Sources that do not
/// exist (or are not directories) are skipped with a warning. Sources sharing a
/// directory name are staged as `<name>`, `<name>_2`, ... in order. Nothing
/// inside the directory that holds `staging` (the backup directory) is copied,
/// so a source containing it does not mirror archives into themselves.
/// Returns the number of directories actually mirrored.
pub async fn mirror_directories(sources: &[PathBuf], staging: &Path) -> Result<usize> {
    let sources = sources.to_vec();
    let staging = staging.to_path_buf();

    tokio::task::spawn_blocking(move || mirror_directories_blocking(&sources, &staging))
        .await
        .map_err(|e| BackupError::capture(format!("File capture task failed: {e}")))?
}

fn mirror_directories_blocking(sources: &[PathBuf], staging: &Path) -> Result<usize> {
    std::fs::create_dir_all(staging).map_err(|e| {
        BackupError::capture(format!(
            "Failed to create staging directory {}: {}",
            staging.display(),
            e
        ))
    })?;

    let excluded = staging.parent().and_then(|dir| dir.canonicalize().ok());
    let mut staged_names = HashSet::new();
    let mut mirrored = 0;
    for source in sources {
        if !source.is_dir() {
            warn!("Directory not found (skipping): {}", source.display());
            continue;
        }

        let root = source.canonicalize().map_err(|e| {
            BackupError::capture(format!("Failed to resolve {}: {}", source.display(), e))
        })?;
        if excluded.as_deref().is_some_and(|dir| root.starts_with(dir)) {
            warn!(
                "Directory is inside the backup directory (skipping): {}",
                source.display()
            );
            continue;
        }

        let base = source
            .file_name()
            .or_else(|| root.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "root".to_string());
        let name = unique_name(&base, &mut staged_names);
        if name != base {
            warn!(
                "Directory name '{}' is already staged; mirroring {} as '{}'",
                base,
                source.display(),
                name
            );
        }

        copy_tree(&root, &staging.join(&name), excluded.as_deref())?;

        info!("Backed up directory: {}", source.display());
        mirrored += 1;
    }
    Ok(mirrored)
}

fn unique_name(base: &str, taken: &mut HashSet<String>) -> String {
    let mut name = base.to_string();
    let mut suffix = 2;
    while !taken.insert(name.clone()) {
        name = format!("{base}_{suffix}");
        suffix += 1;
    }
    name
}

fn copy_tree(source: &Path, target: &Path, excluded: Option<&Path>) -> Result<()> {
    let walker = WalkDir::new(source)
        .into_iter()
        .filter_entry(|entry| excluded.map_or(true, |dir| !entry.path().starts_with(dir)));

    for entry in walker {
        let entry = entry.map_err(|e| {
            BackupError::capture(format!("Failed to walk {}: {}", source.display(), e))
        })?;

        let relative = entry.path().strip_prefix(source).map_err(|e| {
            BackupError::capture(format!("Failed to get relative path: {e}"))
        })?;
        let destination = target.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&destination).map_err(|e| {
                BackupError::capture(format!(
                    "Failed to create directory {}: {}",
                    destination.display(),
                    e
                ))
            })?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &destination).map_err(|e| {
                BackupError::capture(format!(
                    "Failed to copy {}: {}",
                    entry.path().display(),
                    e
                ))
            })?;
        } else {
            debug!("Skipping non-regular file {}", entry.path().display());
        }
    }
    Ok(())
}

/*!
Restore of the primary store from a verified backup archive.
*/

use std::path::Path;

use tracing::{info, instrument, warn};

use crate::archive::Archiver;
use crate::capture::SnapshotCapturer;
use crate::record::BackupRecord;
use crate::{BackupError, Result};

/// Replay the archive of a successful `record` through `capturer`
///
/// The archive is checked against the recorded checksum before anything is
/// extracted. Bundled archives are unpacked into a scratch directory created
/// under `backup_dir`, which is removed whatever the outcome.
///
/// # Errors
/// * `BackupError::InvalidState` - the record carries no archive
/// * `BackupError::IntegrityCheckFailed` - the archive changed since it was written
/// * `BackupError::RestoreFailed` - missing archive, extraction or replay failure
#[instrument(skip(record, capturer), fields(id = %record.id))]
pub async fn restore_from_record(
    record: &BackupRecord,
    backup_dir: &Path,
    capturer: &dyn SnapshotCapturer,
) -> Result<()> {
    let archive = record
        .archive_path()
        .map(Path::to_path_buf)
        .ok_or_else(|| BackupError::invalid_state(format!("Backup {} has no archive", record.id)))?;

    if tokio::fs::metadata(&archive).await.is_err() {
        return Err(BackupError::restore(format!(
            "Backup archive not found: {}",
            archive.display()
        )));
    }

    let verified_record = record.clone();
    let verified_archive = archive.clone();
    tokio::task::spawn_blocking(move || verified_record.verify_integrity(&verified_archive))
        .await
        .map_err(|e| BackupError::restore(format!("Verification task failed: {e}")))??;
    info!("Archive checksum verified for {}", record.id);

    let scratch = tempfile::Builder::new()
        .prefix(&format!("restore_{}_", record.id))
        .tempdir_in(backup_dir)
        .map_err(|e| {
            BackupError::restore(format!(
                "Failed to create scratch directory in {}: {}",
                backup_dir.display(),
                e
            ))
        })?;
    let scratch_path = scratch.path().to_path_buf();

    let replayed = async {
        let primary = Archiver::extract(&archive, &scratch_path).await?;
        info!(
            "Replaying {} into the {} store",
            primary.display(),
            capturer.engine_name()
        );
        capturer.replay(&primary).await
    }
    .await;

    if let Err(e) = scratch.close() {
        warn!(
            "Failed to remove scratch directory {}: {}",
            scratch_path.display(),
            e
        );
    }

    replayed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::MockSnapshotCapturer;
    use crate::record::BackupOrigin;
    use chrono::Utc;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn record_for(archive: &Path) -> BackupRecord {
        BackupRecord::success(
            "b1",
            Utc::now(),
            BackupOrigin::Manual,
            std::fs::metadata(archive).unwrap().len(),
            archive.to_string_lossy(),
            1,
            BackupRecord::compute_file_checksum(archive).unwrap(),
        )
    }

    fn scratch_dirs(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("restore_"))
            .count()
    }

    #[tokio::test]
    async fn test_raw_artifact_is_replayed_directly() {
        let temp_dir = TempDir::new().unwrap();
        let archive = temp_dir.path().join("b1_database.sqlite");
        std::fs::write(&archive, b"rows").unwrap();
        let record = record_for(&archive);

        let replayed = Arc::new(Mutex::new(None::<PathBuf>));
        let seen = replayed.clone();
        let mut mock = MockSnapshotCapturer::new();
        mock.expect_engine_name().return_const("sqlite");
        mock.expect_replay().times(1).returning(move |artifact: &Path| {
            *seen.lock().unwrap() = Some(artifact.to_path_buf());
            Ok(())
        });

        restore_from_record(&record, temp_dir.path(), &mock)
            .await
            .unwrap();

        assert_eq!(replayed.lock().unwrap().as_deref(), Some(archive.as_path()));
        assert_eq!(scratch_dirs(temp_dir.path()), 0);
    }

    #[tokio::test]
    async fn test_scratch_removed_after_replay_failure() {
        let temp_dir = TempDir::new().unwrap();
        let staged = temp_dir.path().join("b1_database.sql");
        std::fs::write(&staged, b"CREATE TABLE accounts (id int);").unwrap();

        let archive = temp_dir.path().join("b1.tar");
        let mut builder = tar::Builder::new(std::fs::File::create(&archive).unwrap());
        builder
            .append_path_with_name(&staged, "b1_database.sql")
            .unwrap();
        builder.into_inner().unwrap();
        let record = record_for(&archive);

        let mut mock = MockSnapshotCapturer::new();
        mock.expect_engine_name().return_const("postgres");
        mock.expect_replay().times(1).returning(|artifact: &Path| {
            assert!(artifact.ends_with("b1_database.sql"));
            assert!(artifact.exists());
            Err(BackupError::restore("psql: syntax error"))
        });

        let result = restore_from_record(&record, temp_dir.path(), &mock).await;
        assert!(matches!(result, Err(BackupError::RestoreFailed(_))));
        assert_eq!(scratch_dirs(temp_dir.path()), 0);
    }

    #[tokio::test]
    async fn test_missing_archive() {
        let temp_dir = TempDir::new().unwrap();
        let archive = temp_dir.path().join("b1.tar.gz");
        std::fs::write(&archive, b"x").unwrap();
        let record = record_for(&archive);
        std::fs::remove_file(&archive).unwrap();

        let mut mock = MockSnapshotCapturer::new();
        mock.expect_replay().never();

        let result = restore_from_record(&record, temp_dir.path(), &mock).await;
        assert!(matches!(result, Err(BackupError::RestoreFailed(_))));
    }
}

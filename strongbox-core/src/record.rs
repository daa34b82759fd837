/*!
Backup record schema: one immutable ledger entry per orchestration run.
*/

use crate::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use uuid::Uuid;

/// What triggered a backup run
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BackupOrigin {
    /// Fired by the scheduler
    #[serde(alias = "auto")]
    Scheduled,
    /// Requested on demand
    Manual,
}

impl BackupOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupOrigin::Scheduled => "scheduled",
            BackupOrigin::Manual => "manual",
        }
    }
}

/// Outcome of a backup run
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Success,
    Failed,
}

/// Ledger entry describing one backup attempt
///
/// Records are created once at the end of a run and never mutated afterwards.
/// Failed records carry an error message, a zero size and an empty archive path.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    /// Unique identifier, also the archive file stem
    pub id: String,

    /// When the run started
    pub created_at: DateTime<Utc>,

    /// Scheduler or operator
    pub origin: BackupOrigin,

    pub status: BackupStatus,

    /// Size of the archive in bytes (0 if failed)
    pub size_bytes: u64,

    /// Location of the archive (empty if failed)
    pub archive_path: String,

    /// Wall-clock duration of the run
    pub duration_millis: u64,

    /// Failure message, present iff the run failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// SHA-256 of the archive file, present iff the run succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl BackupRecord {
    /// Create a record for a run that produced an archive
    pub fn success<S1, S2>(
        id: S1,
        created_at: DateTime<Utc>,
        origin: BackupOrigin,
        size_bytes: u64,
        archive_path: S2,
        duration_millis: u64,
        checksum: String,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            id: id.into(),
            created_at,
            origin,
            status: BackupStatus::Success,
            size_bytes,
            archive_path: archive_path.into(),
            duration_millis,
            error: None,
            checksum: Some(checksum),
        }
    }

    /// Create a record for a run that failed before producing an archive
    pub fn failed<S1, S2>(
        id: S1,
        created_at: DateTime<Utc>,
        origin: BackupOrigin,
        duration_millis: u64,
        error: S2,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            id: id.into(),
            created_at,
            origin,
            status: BackupStatus::Failed,
            size_bytes: 0,
            archive_path: String::new(),
            duration_millis,
            error: Some(error.into()),
            checksum: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == BackupStatus::Success
    }

    /// Archive location, `None` for failed records
    pub fn archive_path(&self) -> Option<&Path> {
        if self.is_success() && !self.archive_path.is_empty() {
            Some(Path::new(&self.archive_path))
        } else {
            None
        }
    }

    /// Generate a fresh backup id
    ///
    /// Format: `backup_{unix_millis}_{9 random lowercase alphanumerics}`
    pub fn generate_id(now: DateTime<Utc>) -> String {
        let suffix: String = Uuid::new_v4().simple().to_string().chars().take(9).collect();
        format!("backup_{}_{}", now.timestamp_millis(), suffix)
    }

    /// Compute the SHA-256 hash of a file's contents
    ///
    /// # Returns
    /// Hexadecimal string representation of the SHA-256 hash
    pub fn compute_file_checksum(path: &Path) -> Result<String> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 64 * 1024];
        loop {
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Verify that the archive on disk still matches the recorded checksum
    ///
    /// Records written without a checksum are accepted as-is.
    pub fn verify_integrity(&self, path: &Path) -> Result<()> {
        let Some(expected) = &self.checksum else {
            return Ok(());
        };
        let actual = Self::compute_file_checksum(path)?;
        if &actual == expected {
            Ok(())
        } else {
            Err(BackupError::IntegrityCheckFailed {
                expected: expected.clone(),
                actual,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generated_id_format() {
        let now = Utc::now();
        let id = BackupRecord::generate_id(now);

        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "backup");
        assert_eq!(parts[1], now.timestamp_millis().to_string());
        assert_eq!(parts[2].len(), 9);
        assert!(parts[2].chars().all(|c| c.is_ascii_alphanumeric()));

        assert_ne!(id, BackupRecord::generate_id(now));
    }

    #[test]
    fn test_failed_record_shape() {
        let record = BackupRecord::failed("b1", Utc::now(), BackupOrigin::Manual, 12, "boom");

        assert_eq!(record.status, BackupStatus::Failed);
        assert_eq!(record.size_bytes, 0);
        assert!(record.archive_path.is_empty());
        assert!(record.archive_path().is_none());
        assert_eq!(record.error.as_deref(), Some("boom"));
        assert!(record.checksum.is_none());
    }

    #[test]
    fn test_file_checksum() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("archive.bin");
        std::fs::write(&path, b"test data").unwrap();

        // SHA-256 of "test data"
        assert_eq!(
            BackupRecord::compute_file_checksum(&path).unwrap(),
            "916f0027a575074ce72a331777c3478d6513f786a591bd892da1a577bf2335f9"
        );
    }

    #[test]
    fn test_integrity_verification() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("archive.bin");
        std::fs::write(&path, b"original").unwrap();

        let checksum = BackupRecord::compute_file_checksum(&path).unwrap();
        let record = BackupRecord::success(
            "b1",
            Utc::now(),
            BackupOrigin::Manual,
            8,
            path.to_string_lossy(),
            5,
            checksum,
        );
        assert!(record.verify_integrity(&path).is_ok());

        std::fs::write(&path, b"tampered").unwrap();
        assert!(matches!(
            record.verify_integrity(&path),
            Err(BackupError::IntegrityCheckFailed { .. })
        ));
    }

    #[test]
    fn test_legacy_origin_alias() {
        let json = r#"{
            "id": "backup_1_abc",
            "createdAt": "2024-01-01T02:00:00Z",
            "origin": "auto",
            "status": "success",
            "sizeBytes": 10,
            "archivePath": "/backups/backup_1_abc.tar.gz",
            "durationMillis": 3
        }"#;
        let record: BackupRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.origin, BackupOrigin::Scheduled);
        assert!(record.checksum.is_none());
    }
}

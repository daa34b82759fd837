//! Retention enforcement for successful backups.
//!
//! A successful backup expires once its `created_at` falls before
//! `now - retention_days`. Failed records reference no file and are never
//! expired by the cutoff; their ledger growth is bounded separately by
//! [`MAX_FAILED_RECORDS`].

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::history::HistoryStore;
use crate::record::BackupRecord;
use crate::Result;

/// Number of failed records kept in the ledger
pub const MAX_FAILED_RECORDS: usize = 50;

/// Result of splitting a ledger at the retention cutoff
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RetentionOutcome {
    /// Records that stay in the ledger, original order preserved
    pub kept: Vec<BackupRecord>,
    /// Successful records older than the cutoff
    pub expired: Vec<BackupRecord>,
}

/// Summary of one enforcement pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetentionReport {
    pub removed_records: usize,
    pub deleted_files: usize,
}

/// Oldest `created_at` that is still retained
pub fn cutoff(retention_days: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::days(i64::from(retention_days))
}

/// Split `records` into kept and expired without touching the filesystem
pub fn partition_expired(
    records: Vec<BackupRecord>,
    retention_days: u32,
    now: DateTime<Utc>,
) -> RetentionOutcome {
    let cutoff = cutoff(retention_days, now);
    let (expired, kept): (Vec<_>, Vec<_>) = records
        .into_iter()
        .partition(|record| record.is_success() && record.created_at < cutoff);
    RetentionOutcome { kept, expired }
}

/// Deletes expired archives and drops their ledger entries
#[derive(Debug, Clone, Copy)]
pub struct RetentionEnforcer {
    retention_days: u32,
}

impl RetentionEnforcer {
    pub fn new(retention_days: u32) -> Self {
        Self { retention_days }
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    /// Enforce retention on `history` as of `now`
    ///
    /// Archive deletion failures (a file already gone, a permission problem)
    /// are logged and skipped so the remaining candidates are still pruned.
    /// The ledger is persisted only when at least one record expired, which
    /// makes repeated runs with the same clock no-ops.
    pub async fn enforce(
        &self,
        history: &mut HistoryStore,
        now: DateTime<Utc>,
    ) -> Result<RetentionReport> {
        let outcome = partition_expired(history.records().to_vec(), self.retention_days, now);
        if outcome.expired.is_empty() {
            return Ok(RetentionReport::default());
        }

        let mut report = RetentionReport {
            removed_records: outcome.expired.len(),
            deleted_files: 0,
        };

        for record in &outcome.expired {
            let Some(path) = record.archive_path() else {
                continue;
            };
            match tokio::fs::remove_file(path).await {
                Ok(()) => {
                    report.deleted_files += 1;
                    info!("Removed old backup: {}", record.id);
                }
                Err(e) => warn!("Failed to remove old backup {}: {}", record.id, e),
            }
        }

        history.replace(outcome.kept).await?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::BackupOrigin;
    use tempfile::TempDir;

    fn success_aged(id: &str, now: DateTime<Utc>, age_days: i64, path: &str) -> BackupRecord {
        BackupRecord::success(
            id,
            now - Duration::days(age_days),
            BackupOrigin::Scheduled,
            42,
            path,
            10,
            "00".to_string(),
        )
    }

    fn failed_aged(id: &str, now: DateTime<Utc>, age_days: i64) -> BackupRecord {
        BackupRecord::failed(
            id,
            now - Duration::days(age_days),
            BackupOrigin::Scheduled,
            10,
            "capture failed",
        )
    }

    #[test]
    fn test_partition_removes_exactly_expired_successes() {
        let now = Utc::now();
        let records = vec![
            success_aged("fresh", now, 1, "/b/fresh.tar.gz"),
            failed_aged("old-failure", now, 90),
            success_aged("old", now, 31, "/b/old.tar.gz"),
            success_aged("edge", now, 30, "/b/edge.tar.gz"),
        ];

        let outcome = partition_expired(records, 30, now);
        let kept: Vec<&str> = outcome.kept.iter().map(|r| r.id.as_str()).collect();
        let expired: Vec<&str> = outcome.expired.iter().map(|r| r.id.as_str()).collect();

        assert_eq!(kept, vec!["fresh", "old-failure", "edge"]);
        assert_eq!(expired, vec!["old"]);
    }

    #[test]
    fn test_partition_is_idempotent() {
        let now = Utc::now();
        let records: Vec<BackupRecord> = (0..20)
            .map(|age| success_aged(&format!("b{age}"), now, age * 3, "/b/x.tar.gz"))
            .collect();

        let once = partition_expired(records, 14, now);
        let twice = partition_expired(once.kept.clone(), 14, now);

        assert_eq!(once.kept, twice.kept);
        assert!(twice.expired.is_empty());
    }

    #[tokio::test]
    async fn test_enforce_deletes_archives_and_persists() {
        let temp_dir = TempDir::new().unwrap();
        let now = Utc::now();

        let old_archive = temp_dir.path().join("old.tar.gz");
        let new_archive = temp_dir.path().join("new.tar.gz");
        std::fs::write(&old_archive, b"old").unwrap();
        std::fs::write(&new_archive, b"new").unwrap();

        let mut history = HistoryStore::load(temp_dir.path()).unwrap();
        history
            .replace(vec![
                success_aged("new", now, 10, &new_archive.to_string_lossy()),
                success_aged("old", now, 40, &old_archive.to_string_lossy()),
            ])
            .await
            .unwrap();

        let report = RetentionEnforcer::new(30)
            .enforce(&mut history, now)
            .await
            .unwrap();

        assert_eq!(
            report,
            RetentionReport {
                removed_records: 1,
                deleted_files: 1
            }
        );
        assert!(!old_archive.exists());
        assert!(new_archive.exists());

        let reloaded = HistoryStore::load(temp_dir.path()).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.records()[0].id, "new");
    }

    #[tokio::test]
    async fn test_missing_archive_does_not_block_pruning() {
        let temp_dir = TempDir::new().unwrap();
        let now = Utc::now();

        let present = temp_dir.path().join("present.tar.gz");
        std::fs::write(&present, b"x").unwrap();

        let mut history = HistoryStore::load(temp_dir.path()).unwrap();
        history
            .replace(vec![
                success_aged("gone", now, 50, "/definitely/not/here.tar.gz"),
                success_aged("present", now, 60, &present.to_string_lossy()),
            ])
            .await
            .unwrap();

        let enforcer = RetentionEnforcer::new(30);
        let report = enforcer.enforce(&mut history, now).await.unwrap();

        assert_eq!(report.removed_records, 2);
        assert_eq!(report.deleted_files, 1);
        assert!(history.is_empty());
        assert!(!present.exists());

        let again = enforcer.enforce(&mut history, now).await.unwrap();
        assert_eq!(again, RetentionReport::default());
    }
}

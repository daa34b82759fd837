/*!
Read-only summaries of the backup ledger for dashboards and health probes.
*/

use chrono::{DateTime, Duration, Local, Utc};
use serde::Serialize;

use crate::config::BackupConfig;
use crate::record::{BackupOrigin, BackupRecord, BackupStatus};
use crate::scheduler::next_run_after;

/// A backup is considered healthy when the newest record succeeded within this many days
pub const HEALTHY_WITHIN_DAYS: i64 = 7;

/// Summary of the most recent backup attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastBackupSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub origin: BackupOrigin,
    pub status: BackupStatus,
    pub size: String,
    pub duration: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&BackupRecord> for LastBackupSummary {
    fn from(record: &BackupRecord) -> Self {
        Self {
            id: record.id.clone(),
            created_at: record.created_at,
            origin: record.origin,
            status: record.status,
            size: format_size(record.size_bytes),
            duration: format!("{}ms", record.duration_millis),
            error: record.error.clone(),
        }
    }
}

/// Aggregate view of the ledger and the current configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStats {
    pub total_backups: usize,
    pub success_count: usize,
    pub failure_count: usize,
    /// Sum of the sizes of successful backups
    pub total_size_bytes: u64,
    pub total_size_human: String,
    pub last_backup: Option<LastBackupSummary>,
    pub next_scheduled_at: DateTime<Local>,
    pub is_running: bool,
    pub config: BackupConfig,
}

impl BackupStats {
    /// Compute statistics over `records` (most recent first)
    pub fn compute(
        records: &[BackupRecord],
        config: BackupConfig,
        is_running: bool,
        now: DateTime<Local>,
    ) -> Self {
        let success_count = records.iter().filter(|r| r.is_success()).count();
        let total_size_bytes = records
            .iter()
            .filter(|r| r.is_success())
            .map(|r| r.size_bytes)
            .sum();

        Self {
            total_backups: records.len(),
            success_count,
            failure_count: records.len() - success_count,
            total_size_bytes,
            total_size_human: format_size(total_size_bytes),
            last_backup: records.first().map(LastBackupSummary::from),
            next_scheduled_at: next_run_after(config.frequency, &now),
            is_running,
            config,
        }
    }
}

/// Health verdict for monitoring probes
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupHealth {
    pub healthy: bool,
    pub message: String,
    pub last_backup: Option<LastBackupSummary>,
    pub next_scheduled_at: DateTime<Local>,
}

impl BackupHealth {
    /// Healthy iff the newest record is a success younger than [`HEALTHY_WITHIN_DAYS`]
    pub fn evaluate(stats: &BackupStats, now: DateTime<Utc>) -> Self {
        let healthy = stats.last_backup.as_ref().is_some_and(|last| {
            last.status == BackupStatus::Success
                && now - last.created_at < Duration::days(HEALTHY_WITHIN_DAYS)
        });

        let message = if healthy {
            "Backup system is healthy"
        } else {
            "Backup system needs attention"
        };

        Self {
            healthy,
            message: message.to_string(),
            last_backup: stats.last_backup.clone(),
            next_scheduled_at: stats.next_scheduled_at,
        }
    }
}

/// Render a byte count with binary units and two decimals
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut size = bytes as f64;
    let mut unit_index = 0;
    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }
    format!("{:.2} {}", size, UNITS[unit_index])
}

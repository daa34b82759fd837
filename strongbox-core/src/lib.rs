/*!
# Strongbox Core Engine

Scheduled backup, retention and restore of an application's primary data store.

This crate provides the building blocks for keeping recoverable copies of a
database together with the application's auxiliary file trees:

- Pluggable capture strategies per store engine (`pg_dump`/`psql` or a file copy)
- Archive packaging with gzip-compressed or plain tar bundles
- A durable JSON ledger of every backup attempt with SHA-256 checksums
- Age-based retention and calendar-driven scheduling
- Checksum-verified restore with a safety snapshot of the live store

## Architecture

The [`BackupManager`] is the single service object. It owns the configuration
(published on a watch channel), the history ledger and the capture strategy,
and is shared behind an `Arc` with the [`BackupScheduler`]. Capture strategies
implement [`SnapshotCapturer`], so the orchestration never depends on a
specific engine.

## Usage

```rust,no_run
use strongbox_core::{BackupConfig, BackupManager, BackupOrigin, StoreConfig};

# async fn run() -> strongbox_core::Result<()> {
let manager = BackupManager::open(
    BackupConfig::with_directory("/var/backups/app"),
    &StoreConfig::sqlite("/var/lib/app/database.sqlite"),
)?;

// Create a backup on demand
let record = manager.create_backup(BackupOrigin::Manual).await?;

// Restore it later
manager.restore(&record.id).await?;
# Ok(())
# }
```
*/

pub mod archive;
pub mod backup;
pub mod capture;
pub mod config;
pub mod error;
pub mod history;
pub mod observability;
pub mod record;
pub mod restore;
pub mod retention;
pub mod scheduler;
pub mod stats;


pub use archive::{ArchiveKind, Archiver, CapturedArtifacts};
pub use backup::{ArchiveDownload, BackupManager};
pub use capture::{capturer_for, FileCopyCapturer, PgDumpCapturer, SnapshotCapturer};
pub use config::{BackupConfig, ConfigUpdate, Frequency, PostgresParams, StoreConfig, StoreEngine};
pub use error::{BackupError, Result};
pub use history::HistoryStore;
pub use observability::init_observability;
#[cfg(feature = "metrics")]
pub use observability::BackupMetrics;
pub use record::{BackupOrigin, BackupRecord, BackupStatus};
pub use retention::{RetentionEnforcer, RetentionReport};
pub use scheduler::{next_run_after, BackupScheduler};
pub use stats::{format_size, BackupHealth, BackupStats, LastBackupSummary};

/*!
Backup manager that orchestrates capture, archiving, retention and restore.

This module contains the core business logic of the engine. It wires the
capture strategy, the archiver, the history ledger and the retention enforcer
together and owns the process-wide configuration.
*/

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Local, Utc};
use futures::stream::{self, Stream};
use tokio::io::AsyncReadExt;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::archive::{Archiver, CapturedArtifacts, DATABASE_MARKER, FILES_MARKER};
use crate::capture::{capturer_for, mirror_directories, SnapshotCapturer};
use crate::config::{BackupConfig, ConfigUpdate, StoreConfig};
use crate::history::HistoryStore;
use crate::record::{BackupOrigin, BackupRecord};
use crate::restore::restore_from_record;
use crate::retention::{RetentionEnforcer, MAX_FAILED_RECORDS};
use crate::stats::{BackupHealth, BackupStats};
#[cfg(feature = "metrics")]
use crate::observability::BackupMetrics;
use crate::{BackupError, Result};

/// Size of the chunks yielded by [`ArchiveDownload::into_stream`]
pub const DOWNLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Single-permit flag held for the duration of one run
///
/// The flag is released when the guard is dropped, on every exit path.
#[derive(Debug)]
pub(crate) struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RunGuard<'a> {
    /// Take the permit, or `None` if another run holds it
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Archive bytes of a successful backup, opened for download
#[derive(Debug)]
pub struct ArchiveDownload {
    pub file_name: String,
    pub size_bytes: u64,
    file: tokio::fs::File,
}

impl ArchiveDownload {
    /// Consume the download as a stream of byte chunks
    pub fn into_stream(self) -> impl Stream<Item = io::Result<Bytes>> + Send {
        stream::try_unfold(self.file, |mut file| async move {
            let mut buffer = vec![0u8; DOWNLOAD_CHUNK_SIZE];
            let read = file.read(&mut buffer).await?;
            if read == 0 {
                return Ok(None);
            }
            buffer.truncate(read);
            Ok(Some((Bytes::from(buffer), file)))
        })
    }
}

/// Paths a single run may leave behind
#[derive(Debug, Clone)]
struct StagingPaths {
    primary: PathBuf,
    auxiliary: PathBuf,
    archives: [PathBuf; 2],
}

impl StagingPaths {
    fn new(backup_dir: &Path, id: &str, extension: &str) -> Self {
        Self {
            primary: backup_dir.join(format!("{id}{DATABASE_MARKER}.{extension}")),
            auxiliary: backup_dir.join(format!("{id}{FILES_MARKER}")),
            archives: [
                backup_dir.join(format!("{id}.tar.gz")),
                backup_dir.join(format!("{id}.tar")),
            ],
        }
    }

    async fn remove_all(&self) {
        for file in std::iter::once(&self.primary).chain(self.archives.iter()) {
            match tokio::fs::remove_file(file).await {
                Ok(()) => debug!("Removed partial artifact {}", file.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove partial artifact {}: {}", file.display(), e),
            }
        }
        match tokio::fs::remove_dir_all(&self.auxiliary).await {
            Ok(()) => debug!("Removed staging directory {}", self.auxiliary.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove staging directory {}: {}",
                self.auxiliary.display(),
                e
            ),
        }
    }
}

/// Cleanup owed by a run whose outcome is not yet in the ledger
///
/// If the run's future is dropped (scheduler shutdown, aborted task) while the
/// guard is armed, its partial artifacts are removed and a `failed` record is
/// written from a task spawned on the current runtime.
struct PendingRun {
    history: Arc<Mutex<HistoryStore>>,
    staging: StagingPaths,
    id: String,
    created_at: DateTime<Utc>,
    origin: BackupOrigin,
    started: Instant,
    armed: bool,
}

impl PendingRun {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingRun {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        warn!("Backup {} was cancelled before completion", self.id);
        let record = BackupRecord::failed(
            &self.id,
            self.created_at,
            self.origin,
            millis(self.started.elapsed()),
            "Backup cancelled before completion",
        );
        let staging = self.staging.clone();
        let history = self.history.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    staging.remove_all().await;
                    let mut history = history.lock().await;
                    if let Err(e) = history.prepend(record).await {
                        error!("Failed to record cancelled backup: {}", e);
                    }
                    if let Err(e) = history.prune_failed(MAX_FAILED_RECORDS).await {
                        error!("Failed to prune failed backup records: {}", e);
                    }
                });
            }
            Err(_) => warn!(
                "No runtime to clean up cancelled backup {}; partial artifacts may remain",
                self.id
            ),
        }
    }
}

/// Main service object for backup and restore operations
///
/// One instance owns the configuration, the history ledger and the capture
/// strategy for a primary store. It is shared behind an [`Arc`] between the
/// scheduler and on-demand callers; tests construct isolated instances.
///
/// # Example
/// ```rust,no_run
/// use strongbox_core::{BackupConfig, BackupManager, BackupOrigin, StoreConfig};
///
/// # async fn run() -> strongbox_core::Result<()> {
/// let manager = BackupManager::open(
///     BackupConfig::with_directory("/var/backups/app"),
///     &StoreConfig::sqlite("/var/lib/app/database.sqlite"),
/// )?;
///
/// let record = manager.create_backup(BackupOrigin::Manual).await?;
/// manager.restore(&record.id).await?;
/// # Ok(())
/// # }
/// ```
pub struct BackupManager {
    config: watch::Sender<BackupConfig>,
    config_writes: Mutex<()>,
    history: Arc<Mutex<HistoryStore>>,
    capturer: Box<dyn SnapshotCapturer>,
    backup_running: AtomicBool,
    restore_running: AtomicBool,
}

impl BackupManager {
    /// Create a manager for the given store, selecting the capture strategy from its engine
    ///
    /// A configuration saved in the backup directory by an earlier
    /// [`BackupManager::update_config`] replaces `config`.
    ///
    /// # Errors
    /// * `BackupError::ConfigInvalid` - if `config` does not validate
    /// * `BackupError::Io` - if the backup directory or ledger cannot be read
    pub fn open(config: BackupConfig, store: &StoreConfig) -> Result<Arc<Self>> {
        Self::with_capturer(config, capturer_for(store))
    }

    /// Create a manager with an explicit capture strategy
    pub fn with_capturer(
        config: BackupConfig,
        capturer: Box<dyn SnapshotCapturer>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let config = match BackupConfig::load_saved(&config.backup_directory) {
            Ok(Some(saved)) => {
                info!("Using saved backup configuration {}", saved.saved_path().display());
                saved
            }
            Ok(None) => config,
            Err(e) => {
                warn!(
                    "Ignoring saved backup configuration {}: {}",
                    config.saved_path().display(),
                    e
                );
                config
            }
        };
        let history = HistoryStore::load(&config.backup_directory)?;

        info!(
            "Backup manager ready: engine={}, directory={}, {} records",
            capturer.engine_name(),
            config.backup_directory.display(),
            history.len()
        );

        let (config, _) = watch::channel(config);
        Ok(Arc::new(Self {
            config,
            config_writes: Mutex::new(()),
            history: Arc::new(Mutex::new(history)),
            capturer,
            backup_running: AtomicBool::new(false),
            restore_running: AtomicBool::new(false),
        }))
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> BackupConfig {
        self.config.borrow().clone()
    }

    /// Receiver notified on every configuration change
    pub fn subscribe_config(&self) -> watch::Receiver<BackupConfig> {
        self.config.subscribe()
    }

    /// Whether a backup run currently holds the in-progress flag
    pub fn is_running(&self) -> bool {
        self.backup_running.load(Ordering::Acquire)
    }

    /// Create a backup of the primary store
    ///
    /// This method:
    /// 1. Fails fast with `AlreadyRunning` if another run is in progress
    /// 2. Captures the primary store and, if enabled, the auxiliary directories
    /// 3. Packages the artifacts according to `compress`
    /// 4. Records size and checksum in a `success` record
    /// 5. Enforces retention and the failed-record cap
    ///
    /// Any failure in steps 2-4 removes the partial artifacts, records a
    /// `failed` entry and returns the original error. A run whose future is
    /// dropped before its record is written is cleaned up the same way.
    ///
    /// # Errors
    /// * `BackupError::AlreadyRunning` - another backup holds the flag; nothing is recorded
    /// * `BackupError::CaptureFailed` - the store or auxiliary capture failed
    /// * `BackupError::ArchiveFailed` - packaging failed
    #[instrument(skip(self))]
    pub async fn create_backup(&self, origin: BackupOrigin) -> Result<BackupRecord> {
        let _guard = RunGuard::acquire(&self.backup_running).ok_or(BackupError::AlreadyRunning)?;

        let started = Instant::now();
        let created_at = Utc::now();
        let id = BackupRecord::generate_id(created_at);
        let config = self.config();
        let mut pending = PendingRun {
            history: self.history.clone(),
            staging: StagingPaths::new(
                &config.backup_directory,
                &id,
                self.capturer.artifact_extension(),
            ),
            id: id.clone(),
            created_at,
            origin,
            started,
            armed: true,
        };

        info!(
            "Starting {} backup {} ({})",
            origin.as_str(),
            id,
            self.capturer.engine_name()
        );

        let outcome = self.run_backup(&id, &config, &pending.staging).await;
        match outcome {
            Ok((archive, size_bytes, checksum)) => {
                let elapsed = started.elapsed();
                let record = BackupRecord::success(
                    id,
                    created_at,
                    origin,
                    size_bytes,
                    archive.to_string_lossy(),
                    millis(elapsed),
                    checksum,
                );
                info!(
                    "Backup {} completed in {}ms ({} bytes)",
                    record.id, record.duration_millis, size_bytes
                );

                #[cfg(feature = "metrics")]
                {
                    if let Some(metrics) = BackupMetrics::global() {
                        metrics.record_backup(elapsed, size_bytes);
                    }
                }

                self.finish_success(record.clone(), &mut pending).await;
                Ok(record)
            }
            Err(e) => {
                let elapsed = started.elapsed();
                error!("Backup {} failed: {}", id, e);
                pending.staging.remove_all().await;

                #[cfg(feature = "metrics")]
                {
                    if let Some(metrics) = BackupMetrics::global() {
                        metrics.record_backup_failure(elapsed);
                    }
                }

                let record =
                    BackupRecord::failed(&id, created_at, origin, millis(elapsed), e.to_string());
                let mut history = self.history.lock().await;
                pending.disarm();
                if let Err(persist) = history.prepend(record).await {
                    error!("Failed to record failed backup {}: {}", id, persist);
                }
                if let Err(prune) = history.prune_failed(MAX_FAILED_RECORDS).await {
                    error!("Failed to prune failed backup records: {}", prune);
                }
                Err(e)
            }
        }
    }

    async fn run_backup(
        &self,
        id: &str,
        config: &BackupConfig,
        staging: &StagingPaths,
    ) -> Result<(PathBuf, u64, String)> {
        tokio::fs::create_dir_all(&config.backup_directory)
            .await
            .map_err(|e| {
                BackupError::capture(format!(
                    "Failed to create backup directory {}: {}",
                    config.backup_directory.display(),
                    e
                ))
            })?;

        self.capturer.capture(&staging.primary).await?;

        let auxiliary = if config.include_auxiliary_files {
            let mirrored = mirror_directories(&config.auxiliary_dirs, &staging.auxiliary).await?;
            debug!("Mirrored {} auxiliary directories", mirrored);
            Some(staging.auxiliary.clone())
        } else {
            None
        };

        let artifacts = CapturedArtifacts {
            primary: staging.primary.clone(),
            auxiliary,
        };
        let archive = Archiver::new(config.compress, config.compression_level)
            .package(id, &artifacts, &config.backup_directory)
            .await?;

        let measured = archive.clone();
        let (size_bytes, checksum) = tokio::task::spawn_blocking(move || -> Result<(u64, String)> {
            let size_bytes = std::fs::metadata(&measured)?.len();
            let checksum = BackupRecord::compute_file_checksum(&measured)?;
            Ok((size_bytes, checksum))
        })
        .await
        .map_err(|e| BackupError::archive(format!("Checksum task failed: {e}")))??;

        Ok((archive, size_bytes, checksum))
    }

    async fn finish_success(&self, record: BackupRecord, pending: &mut PendingRun) {
        let retention_days = self.config.borrow().retention_days;
        let mut history = self.history.lock().await;
        pending.disarm();

        if let Err(e) = history.prepend(record).await {
            error!("Failed to persist backup history: {}", e);
        }

        match RetentionEnforcer::new(retention_days)
            .enforce(&mut history, Utc::now())
            .await
        {
            Ok(report) if report.removed_records > 0 => {
                info!(
                    "Retention removed {} backups ({} files deleted)",
                    report.removed_records, report.deleted_files
                );

                #[cfg(feature = "metrics")]
                {
                    if let Some(metrics) = BackupMetrics::global() {
                        metrics.record_retention(report.removed_records);
                    }
                }
            }
            Ok(_) => debug!("Retention: nothing to remove"),
            Err(e) => error!("Retention enforcement failed: {}", e),
        }

        if let Err(e) = history.prune_failed(MAX_FAILED_RECORDS).await {
            error!("Failed to prune failed backup records: {}", e);
        }
    }

    /// Restore the primary store from backup `id`
    ///
    /// # Errors
    /// * `BackupError::RestoreInProgress` - another restore is running
    /// * `BackupError::NotFound` - unknown id
    /// * `BackupError::InvalidState` - the backup did not succeed
    /// * `BackupError::IntegrityCheckFailed` - the archive changed since it was written
    /// * `BackupError::RestoreFailed` - extraction or replay failed; no rollback
    #[instrument(skip(self))]
    pub async fn restore(&self, id: &str) -> Result<()> {
        let _guard =
            RunGuard::acquire(&self.restore_running).ok_or(BackupError::RestoreInProgress)?;

        let record = self
            .history
            .lock()
            .await
            .find(id)
            .cloned()
            .ok_or_else(|| BackupError::not_found(id))?;

        if !record.is_success() {
            return Err(BackupError::invalid_state(format!(
                "Backup {id} did not complete successfully"
            )));
        }

        let backup_dir = self.config.borrow().backup_directory.clone();
        restore_from_record(&record, &backup_dir, self.capturer.as_ref()).await?;

        #[cfg(feature = "metrics")]
        {
            if let Some(metrics) = BackupMetrics::global() {
                metrics.record_restore();
            }
        }

        info!("Backup {} restored", id);
        Ok(())
    }

    /// Copy of the ledger, most recent first
    pub async fn get_history(&self) -> Vec<BackupRecord> {
        self.history.lock().await.records().to_vec()
    }

    /// Aggregate statistics over the ledger
    pub async fn get_stats(&self) -> BackupStats {
        let records = self.get_history().await;
        BackupStats::compute(&records, self.config(), self.is_running(), Local::now())
    }

    /// Health verdict derived from the newest record
    pub async fn health(&self) -> BackupHealth {
        BackupHealth::evaluate(&self.get_stats().await, Utc::now())
    }

    /// Apply a partial configuration update
    ///
    /// The update is validated as a whole; on rejection the configuration is
    /// left untouched. A changed configuration is saved to the backup
    /// directory before subscribers are notified, so later processes and
    /// [`BackupManager::reload_config`] see it.
    ///
    /// # Errors
    /// * `BackupError::ConfigInvalid` - the resulting configuration does not validate
    /// * `BackupError::Io` - the configuration file could not be written
    pub async fn update_config(&self, update: ConfigUpdate) -> Result<BackupConfig> {
        let _writes = self.config_writes.lock().await;
        let current = self.config();
        let config = current.apply(&update)?;

        if config == current {
            debug!("Backup configuration unchanged");
            return Ok(config);
        }

        let saved = config.clone();
        tokio::task::spawn_blocking(move || saved.save())
            .await
            .map_err(|e| BackupError::config(format!("Configuration write task failed: {e}")))??;
        self.config.send_replace(config.clone());

        info!(
            "Backup configuration updated: frequency={}, retention={}d, files={}, compress={}",
            config.frequency, config.retention_days, config.include_auxiliary_files, config.compress
        );
        Ok(config)
    }

    /// Pick up a configuration saved by another process
    ///
    /// Returns whether the configuration changed. Subscribers are notified
    /// only in that case.
    ///
    /// # Errors
    /// * `BackupError::Json` / `BackupError::ConfigInvalid` - the saved file is unusable
    pub async fn reload_config(&self) -> Result<bool> {
        let _writes = self.config_writes.lock().await;
        let dir = self.config.borrow().backup_directory.clone();

        let saved = tokio::task::spawn_blocking(move || BackupConfig::load_saved(&dir))
            .await
            .map_err(|e| BackupError::config(format!("Configuration read task failed: {e}")))??;

        let Some(saved) = saved else {
            return Ok(false);
        };
        let changed = self.config.send_if_modified(|current| {
            if *current == saved {
                return false;
            }
            *current = saved;
            true
        });
        if changed {
            info!("Reloaded saved backup configuration");
        }
        Ok(changed)
    }

    /// Open the archive of backup `id` for download
    ///
    /// # Errors
    /// * `BackupError::NotFound` - unknown id
    /// * `BackupError::InvalidState` - the backup did not succeed or its archive is gone
    /// * `BackupError::IntegrityCheckFailed` - the archive changed since it was written
    pub async fn open_archive(&self, id: &str) -> Result<ArchiveDownload> {
        let record = self
            .history
            .lock()
            .await
            .find(id)
            .cloned()
            .ok_or_else(|| BackupError::not_found(id))?;

        let path = record
            .archive_path()
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                BackupError::invalid_state(format!("Backup {id} did not complete successfully"))
            })?;

        if tokio::fs::metadata(&path).await.is_err() {
            return Err(BackupError::invalid_state(format!(
                "Archive for backup {id} is missing at {}",
                path.display()
            )));
        }

        let verified = path.clone();
        tokio::task::spawn_blocking(move || record.verify_integrity(&verified))
            .await
            .map_err(|e| BackupError::invalid_state(format!("Verification task failed: {e}")))??;

        let file = tokio::fs::File::open(&path).await?;
        let size_bytes = file.metadata().await?.len();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| id.to_string());

        Ok(ArchiveDownload {
            file_name,
            size_bytes,
            file,
        })
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/*!
Durable ledger of backup attempts.

The ledger is a JSON array stored next to the archives, most recent record
first. Every mutation rewrites the whole file through a temporary file in the
same directory followed by a rename, so readers never observe a partial write.
The rewrite runs on the blocking pool.
*/

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::record::BackupRecord;
use crate::Result;

/// File name of the ledger inside the backup directory
pub const HISTORY_FILE_NAME: &str = "backup_history.json";

/// Ordered, persisted sequence of [`BackupRecord`]s
#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    records: Vec<BackupRecord>,
}

impl HistoryStore {
    /// Load the ledger from `backup_dir`, creating the directory if needed
    ///
    /// A missing ledger yields an empty store. A ledger that cannot be parsed is
    /// moved aside to `backup_history.json.corrupt-<millis>` and the store starts
    /// empty, so the damaged file stays available for inspection.
    pub fn load(backup_dir: &Path) -> Result<Self> {
        fs::create_dir_all(backup_dir)?;
        let path = backup_dir.join(HISTORY_FILE_NAME);

        let records = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Vec<BackupRecord>>(&bytes) {
                Ok(records) => records,
                Err(e) => {
                    let aside = backup_dir.join(format!(
                        "{HISTORY_FILE_NAME}.corrupt-{}",
                        Utc::now().timestamp_millis()
                    ));
                    warn!(
                        "Backup history at {} is unreadable ({}); moving it to {}",
                        path.display(),
                        e,
                        aside.display()
                    );
                    fs::rename(&path, &aside)?;
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No backup history found, starting fresh");
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };

        debug!("Loaded {} backup records from {}", records.len(), path.display());
        Ok(Self { path, records })
    }

    /// Location of the ledger file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records, most recent first
    pub fn records(&self) -> &[BackupRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Look up a record by id
    pub fn find(&self, id: &str) -> Option<&BackupRecord> {
        self.records.iter().find(|record| record.id == id)
    }

    /// Most recent record, if any
    pub fn latest(&self) -> Option<&BackupRecord> {
        self.records.first()
    }

    /// Insert a record at the front and persist the ledger
    ///
    /// The in-memory ledger keeps the record even when the write fails; the
    /// next successful mutation rewrites the file in full.
    pub async fn prepend(&mut self, record: BackupRecord) -> Result<()> {
        self.records.insert(0, record);
        self.persist().await
    }

    /// Replace the whole ledger and persist it
    pub async fn replace(&mut self, records: Vec<BackupRecord>) -> Result<()> {
        self.records = records;
        self.persist().await
    }

    /// Keep only the newest `max` failed records, returning how many were dropped
    ///
    /// Successful records are untouched. Nothing is written when nothing changes.
    pub async fn prune_failed(&mut self, max: usize) -> Result<usize> {
        let mut failed_seen = 0usize;
        let before = self.records.len();
        self.records.retain(|record| {
            if record.is_success() {
                return true;
            }
            failed_seen += 1;
            failed_seen <= max
        });

        let dropped = before - self.records.len();
        if dropped > 0 {
            info!("Pruned {} old failed backup records from history", dropped);
            self.persist().await?;
        }
        Ok(dropped)
    }

    /// Atomically rewrite the ledger file
    ///
    /// The write completes even if the calling future is dropped mid-way.
    pub async fn persist(&self) -> Result<()> {
        let path = self.path.clone();
        let records = self.records.clone();
        tokio::task::spawn_blocking(move || write_json_atomic(&path, &records))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }
}

/// Serialize `value` as pretty JSON and atomically replace `path` with it
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let temp = NamedTempFile::new_in(&dir)?;
    {
        let mut writer = BufWriter::new(temp.as_file());
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.flush()?;
    }
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

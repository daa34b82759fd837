//! Configuration module for backup scheduling and primary store selection
//!
//! This module provides the process-wide [`BackupConfig`] (replaced wholesale on
//! every update), the partial [`ConfigUpdate`] applied by operators, and the
//! [`StoreConfig`] describing which engine holds the primary data.
//!
//! Applied updates are saved to `backup_config.json` in the backup directory
//! and take precedence over the configuration a process starts with.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::history::write_json_atomic;
use crate::{BackupError, Result};

/// File name of the saved configuration inside the backup directory
pub const CONFIG_FILE_NAME: &str = "backup_config.json";

/// Smallest accepted retention window in days
pub const MIN_RETENTION_DAYS: u32 = 1;
/// Largest accepted retention window in days
pub const MAX_RETENTION_DAYS: u32 = 365;

/// How often the scheduler fires a backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    /// Every day
    Daily,
    /// Every Sunday
    Weekly,
    /// On the first day of each month
    Monthly,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = BackupError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "monthly" => Ok(Frequency::Monthly),
            other => Err(BackupError::config(format!(
                "Invalid frequency '{other}'. Must be daily, weekly, or monthly"
            ))),
        }
    }
}

/// Backup behaviour shared by the orchestrator, the retention enforcer and the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfig {
    /// Scheduling cadence
    pub frequency: Frequency,
    /// Successful backups older than this many days are deleted
    pub retention_days: u32,
    /// Directory holding archives and the history ledger
    pub backup_directory: PathBuf,
    /// Whether the auxiliary directories are mirrored into each backup
    pub include_auxiliary_files: bool,
    /// Whether the artifacts are packaged into a gzip-compressed tar
    pub compress: bool,
    /// Directories mirrored when `include_auxiliary_files` is set
    pub auxiliary_dirs: Vec<PathBuf>,
    /// Gzip level (0-9)
    pub compression_level: u32,
}

impl BackupConfig {
    /// Create the default configuration rooted at the given backup directory
    pub fn with_directory<P: Into<PathBuf>>(backup_directory: P) -> Self {
        Self {
            backup_directory: backup_directory.into(),
            ..Self::default()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !(MIN_RETENTION_DAYS..=MAX_RETENTION_DAYS).contains(&self.retention_days) {
            return Err(BackupError::config(format!(
                "Retention days must be between {MIN_RETENTION_DAYS} and {MAX_RETENTION_DAYS}, got {}",
                self.retention_days
            )));
        }
        if self.compression_level > 9 {
            return Err(BackupError::config(format!(
                "Compression level must be between 0 and 9, got {}",
                self.compression_level
            )));
        }
        if self.backup_directory.as_os_str().is_empty() {
            return Err(BackupError::config("Backup directory cannot be empty"));
        }
        Ok(())
    }

    /// Produce the configuration that results from applying `update`
    ///
    /// The receiver is never modified; an invalid result is rejected as a whole.
    pub fn apply(&self, update: &ConfigUpdate) -> Result<BackupConfig> {
        let mut next = self.clone();
        if let Some(frequency) = update.frequency {
            next.frequency = frequency;
        }
        if let Some(retention_days) = update.retention_days {
            next.retention_days = retention_days;
        }
        if let Some(include) = update.include_auxiliary_files {
            next.include_auxiliary_files = include;
        }
        if let Some(compress) = update.compress {
            next.compress = compress;
        }
        if let Some(level) = update.compression_level {
            next.compression_level = level;
        }
        if let Some(dirs) = &update.auxiliary_dirs {
            next.auxiliary_dirs = dirs.clone();
        }
        next.validate()?;
        Ok(next)
    }

    /// Location of the saved configuration for this backup directory
    pub fn saved_path(&self) -> PathBuf {
        self.backup_directory.join(CONFIG_FILE_NAME)
    }

    /// Load the configuration saved in `backup_dir`, if any
    ///
    /// The saved `backupDirectory` is ignored in favour of `backup_dir`, so a
    /// moved directory keeps working.
    ///
    /// # Errors
    /// * `BackupError::Json` - the file is not a configuration
    /// * `BackupError::ConfigInvalid` - the saved values do not validate
    pub fn load_saved(backup_dir: &Path) -> Result<Option<BackupConfig>> {
        let bytes = match std::fs::read(backup_dir.join(CONFIG_FILE_NAME)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut saved: BackupConfig = serde_json::from_slice(&bytes)?;
        saved.backup_directory = backup_dir.to_path_buf();
        saved.validate()?;
        Ok(Some(saved))
    }

    /// Atomically write this configuration to [`BackupConfig::saved_path`]
    pub fn save(&self) -> Result<()> {
        std::fs::create_dir_all(&self.backup_directory)?;
        write_json_atomic(&self.saved_path(), self)
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        BackupConfig {
            frequency: Frequency::Daily,
            retention_days: 30,
            backup_directory: PathBuf::from("backups"),
            include_auxiliary_files: true,
            compress: true,
            auxiliary_dirs: ["public", "uploads", "logs", "certificates"]
                .iter()
                .map(PathBuf::from)
                .collect(),
            compression_level: 6,
        }
    }
}

/// Partial configuration update; `None` fields keep their current value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
    pub frequency: Option<Frequency>,
    pub retention_days: Option<u32>,
    pub include_auxiliary_files: Option<bool>,
    pub compress: Option<bool>,
    pub compression_level: Option<u32>,
    pub auxiliary_dirs: Option<Vec<PathBuf>>,
}

impl ConfigUpdate {
    pub fn is_empty(&self) -> bool {
        *self == ConfigUpdate::default()
    }
}

/// Connection parameters for a PostgreSQL primary store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostgresParams {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: String,
    /// Directory holding `pg_dump`, `psql`, `dropdb` and `createdb`; `PATH` lookup when unset
    pub bin_dir: Option<PathBuf>,
}

impl Default for PostgresParams {
    fn default() -> Self {
        PostgresParams {
            host: "localhost".to_string(),
            port: 5432,
            database: "banking_system".to_string(),
            username: "postgres".to_string(),
            password: String::new(),
            bin_dir: None,
        }
    }
}

/// Engine type of the primary store, which selects the capture strategy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "engine", rename_all = "lowercase")]
pub enum StoreEngine {
    /// Relational server exported with `pg_dump`
    Postgres(PostgresParams),
    /// Embedded file database copied byte for byte
    Sqlite { path: PathBuf },
}

/// Primary store description, provided by the host application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(flatten)]
    pub engine: StoreEngine,
}

impl StoreConfig {
    /// File-based store at `path`
    pub fn sqlite<P: Into<PathBuf>>(path: P) -> Self {
        StoreConfig {
            engine: StoreEngine::Sqlite { path: path.into() },
        }
    }

    /// PostgreSQL store with the given parameters
    pub fn postgres(params: PostgresParams) -> Self {
        StoreConfig {
            engine: StoreEngine::Postgres(params),
        }
    }

    /// Read the store description from the process environment
    ///
    /// Recognised variables: `DB_TYPE`, `DB_HOST`, `DB_PORT`, `DB_DATABASE`,
    /// `DB_USERNAME`, `DB_PASSWORD`, `DB_PATH` and `PG_BIN_DIR`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`StoreConfig::from_env`] with an injectable variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let db_type = lookup("DB_TYPE").unwrap_or_else(|| "sqlite".to_string());

        match db_type.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => {
                let defaults = PostgresParams::default();
                let port = match lookup("DB_PORT") {
                    Some(raw) => raw.parse::<u16>().map_err(|e| {
                        BackupError::config(format!("Invalid DB_PORT '{raw}': {e}"))
                    })?,
                    None => defaults.port,
                };
                Ok(StoreConfig::postgres(PostgresParams {
                    host: lookup("DB_HOST").unwrap_or(defaults.host),
                    port,
                    database: lookup("DB_DATABASE").unwrap_or(defaults.database),
                    username: lookup("DB_USERNAME").unwrap_or(defaults.username),
                    password: lookup("DB_PASSWORD").unwrap_or_default(),
                    bin_dir: lookup("PG_BIN_DIR").map(PathBuf::from),
                }))
            }
            _ => Ok(StoreConfig::sqlite(
                lookup("DB_PATH").unwrap_or_else(|| "database.sqlite".to_string()),
            )),
        }
    }
}

/*!
Strongbox CLI - Command-line interface for the Strongbox backup manager.

This CLI runs the backup scheduler as a daemon and provides on-demand backup,
restore, download and inspection commands against a backup directory.

Settings given as flags or with `strongbox config` are saved in the backup
directory and apply to every later command; a running daemon picks them up
within a minute.
*/

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use strongbox_core::{
    format_size, BackupConfig, BackupError, BackupManager, BackupMetrics, BackupOrigin,
    BackupRecord, BackupScheduler, ConfigUpdate, Frequency, StoreConfig,
};
use tabled::{Table, Tabled};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

/// How often the daemon re-reads the saved configuration
const CONFIG_RELOAD_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "strongbox")]
#[command(about = "Scheduled backup and restore for the application data store")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "STRONGBOX_JSON_LOGS")]
    json_logs: bool,

    /// Directory holding archives and the backup history
    #[arg(short, long, global = true, env = "STRONGBOX_BACKUP_DIR", default_value = "backups")]
    backup_dir: PathBuf,

    /// Backup frequency (daily, weekly, monthly)
    #[arg(short, long, global = true, env = "STRONGBOX_FREQUENCY")]
    frequency: Option<Frequency>,

    /// Days to keep successful backups
    #[arg(short, long, global = true, env = "STRONGBOX_RETENTION_DAYS")]
    retention_days: Option<u32>,

    /// Auxiliary directories mirrored into each backup (comma separated)
    #[arg(
        long = "aux-dir",
        global = true,
        env = "STRONGBOX_AUX_DIRS",
        value_delimiter = ','
    )]
    aux_dirs: Vec<PathBuf>,

    /// Skip the auxiliary directories
    #[arg(long, global = true, env = "STRONGBOX_NO_FILES")]
    no_files: bool,

    /// Keep artifacts uncompressed
    #[arg(long, global = true, env = "STRONGBOX_NO_COMPRESS")]
    no_compress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the backup scheduler until interrupted
    Run,
    /// Create a backup now
    Backup,
    /// Restore the data store from a backup
    Restore {
        /// Backup identifier
        backup_id: String,
        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },
    /// List backup history
    History {
        /// Show at most this many records
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Show backup statistics
    Stats,
    /// Check backup health; exits non-zero when unhealthy
    Health,
    /// Copy a backup archive to a local file
    Download {
        /// Backup identifier
        backup_id: String,
        /// Output path (defaults to the archive file name)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show or change the saved backup configuration
    Config {
        /// New frequency
        #[arg(long = "set-frequency")]
        frequency: Option<Frequency>,
        /// New retention in days (1-365)
        #[arg(long = "set-retention-days")]
        retention_days: Option<u32>,
        /// Whether to include auxiliary files
        #[arg(long)]
        include_files: Option<bool>,
        /// Whether to compress archives
        #[arg(long)]
        compress: Option<bool>,
    },
}

#[derive(Tabled)]
struct BackupRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Created")]
    created: String,
    #[tabled(rename = "Origin")]
    origin: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Duration")]
    duration: String,
    #[tabled(rename = "Error")]
    error: String,
}

impl From<&BackupRecord> for BackupRow {
    fn from(record: &BackupRecord) -> Self {
        Self {
            id: record.id.clone(),
            created: format_timestamp(record.created_at),
            origin: record.origin.as_str().to_string(),
            status: (if record.is_success() { "✓ success" } else { "✗ failed" }).to_string(),
            size: format_size(record.size_bytes),
            duration: format!("{}ms", record.duration_millis),
            error: record.error.clone().unwrap_or_default(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.json_logs {
        strongbox_core::init_observability(true)?;
    } else {
        init_logging(cli.verbose);
    }

    let manager = create_manager(&cli).await?;

    match cli.command {
        Commands::Run => run_daemon(manager).await?,
        Commands::Backup => create_backup(&manager).await?,
        Commands::Restore { backup_id, force } => {
            restore_backup(&manager, &backup_id, force).await?
        }
        Commands::History { limit } => show_history(&manager, limit).await,
        Commands::Stats => print_json(&manager.get_stats().await)?,
        Commands::Health => check_health(&manager).await?,
        Commands::Download { backup_id, output } => {
            download_backup(&manager, &backup_id, output).await?
        }
        Commands::Config {
            frequency,
            retention_days,
            include_files,
            compress,
        } => {
            let update = ConfigUpdate {
                frequency,
                retention_days,
                include_auxiliary_files: include_files,
                compress,
                ..ConfigUpdate::default()
            };
            let config = if update.is_empty() {
                manager.config()
            } else {
                let config = manager.update_config(update).await?;
                println!("✓ Configuration saved to {}", config.saved_path().display());
                config
            };
            print_json(&config)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"))
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn create_manager(cli: &Cli) -> Result<Arc<BackupManager>, anyhow::Error> {
    let store = StoreConfig::from_env()?;
    let manager = BackupManager::open(BackupConfig::with_directory(&cli.backup_dir), &store)?;

    let overrides = ConfigUpdate {
        frequency: cli.frequency,
        retention_days: cli.retention_days,
        include_auxiliary_files: cli.no_files.then_some(false),
        compress: cli.no_compress.then_some(false),
        auxiliary_dirs: (!cli.aux_dirs.is_empty()).then(|| cli.aux_dirs.clone()),
        ..ConfigUpdate::default()
    };
    if !overrides.is_empty() {
        manager.update_config(overrides).await?;
    }

    Ok(manager)
}

async fn run_daemon(manager: Arc<BackupManager>) -> Result<(), anyhow::Error> {
    let mut scheduler = BackupScheduler::start(manager.clone());
    let mut next_wake = scheduler.next_wake();
    let mut reload = tokio::time::interval(CONFIG_RELOAD_INTERVAL);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                signal?;
                break;
            }
            changed = next_wake.changed() => {
                if changed.is_err() {
                    warn!("Backup scheduler exited");
                    break;
                }
                if let Some(at) = *next_wake.borrow_and_update() {
                    println!("Next backup: {}", at.format("%Y-%m-%d %H:%M:%S"));
                }
            }
            _ = reload.tick() => {
                if let Err(e) = manager.reload_config().await {
                    warn!("Failed to reload backup configuration: {}", e);
                }
            }
        }
    }

    if manager.is_running() {
        info!("Waiting for the running backup to finish");
    }
    info!("Shutting down backup scheduler");
    scheduler.stop().await;

    if let Some(metrics) = BackupMetrics::global() {
        match metrics.gather_metrics() {
            Ok(text) => info!("Final metrics:\n{}", text),
            Err(e) => warn!("Failed to gather metrics: {}", e),
        }
    }

    Ok(())
}

async fn create_backup(manager: &BackupManager) -> Result<(), anyhow::Error> {
    match manager.create_backup(BackupOrigin::Manual).await {
        Ok(record) => {
            println!("✓ Backup {} created", record.id);
            println!("  Archive: {}", record.archive_path);
            println!("  Size: {}", format_size(record.size_bytes));
            println!("  Duration: {}ms", record.duration_millis);
            Ok(())
        }
        Err(e) => {
            error!("✗ Backup failed: {}", e);
            Err(e.into())
        }
    }
}

async fn restore_backup(
    manager: &BackupManager,
    backup_id: &str,
    force: bool,
) -> Result<(), anyhow::Error> {
    if !force {
        print!("Restoring '{backup_id}' replaces the current data store. Continue? (y/N): ");
        use std::io::{self, Write};
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().to_lowercase().starts_with('y') {
            println!("Restore cancelled");
            return Ok(());
        }
    }

    match manager.restore(backup_id).await {
        Ok(()) => {
            println!("✓ Backup {backup_id} restored");
            Ok(())
        }
        Err(BackupError::IntegrityCheckFailed { expected, actual }) => {
            error!("✗ Integrity check failed:");
            error!("  Expected hash: {}", expected);
            error!("  Actual hash: {}", actual);
            Err(anyhow::anyhow!("Integrity check failed"))
        }
        Err(e) => {
            error!("✗ Restore failed: {}", e);
            Err(e.into())
        }
    }
}

async fn show_history(manager: &BackupManager, limit: Option<usize>) {
    let history = manager.get_history().await;
    if history.is_empty() {
        println!("No backups found");
        return;
    }

    let rows: Vec<BackupRow> = history
        .iter()
        .take(limit.unwrap_or(usize::MAX))
        .map(BackupRow::from)
        .collect();
    println!("{}", Table::new(rows));
}

async fn check_health(manager: &BackupManager) -> Result<(), anyhow::Error> {
    let health = manager.health().await;
    print_json(&health)?;
    if !health.healthy {
        return Err(anyhow::anyhow!(health.message));
    }
    Ok(())
}

async fn download_backup(
    manager: &BackupManager,
    backup_id: &str,
    output: Option<PathBuf>,
) -> Result<(), anyhow::Error> {
    let download = manager.open_archive(backup_id).await?;
    let output = output.unwrap_or_else(|| PathBuf::from(&download.file_name));
    let expected = download.size_bytes;

    let mut file = tokio::fs::File::create(&output).await?;
    let mut stream = Box::pin(download.into_stream());
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    if written != expected {
        warn!("Wrote {} bytes, archive reported {}", written, expected);
    }
    println!(
        "✓ Downloaded {} to {} ({})",
        backup_id,
        output.display(),
        format_size(written)
    );
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), anyhow::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp
        .with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

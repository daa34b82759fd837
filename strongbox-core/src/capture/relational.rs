/*!
Relational-dump capture strategy for PostgreSQL stores.
*/

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, instrument};

use super::SnapshotCapturer;
use crate::config::PostgresParams;
use crate::{BackupError, Result};

/// Captures a PostgreSQL database with `pg_dump` and replays it with `psql`
///
/// Replay drops and recreates the target database before loading the dump, so
/// the restored store contains exactly what the dump contains.
#[derive(Debug, Clone)]
pub struct PgDumpCapturer {
    params: PostgresParams,
}

impl PgDumpCapturer {
    pub fn new(params: PostgresParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &PostgresParams {
        &self.params
    }

    /// Resolve a client tool, honouring the configured binary directory
    fn program(&self, tool: &str) -> PathBuf {
        match &self.params.bin_dir {
            Some(dir) => dir.join(tool),
            None => PathBuf::from(tool),
        }
    }

    /// Build a client tool invocation carrying the connection parameters
    fn command(&self, tool: &str) -> Command {
        let mut command = Command::new(self.program(tool));
        command
            .env("PGPASSWORD", &self.params.password)
            .arg("-h")
            .arg(&self.params.host)
            .arg("-p")
            .arg(self.params.port.to_string())
            .arg("-U")
            .arg(&self.params.username)
            .arg("--no-password")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        command
    }
}

/// Run a client tool to completion, returning its stderr verbatim on failure
async fn run_tool(tool: &str, mut command: Command) -> std::result::Result<(), String> {
    let output = command
        .output()
        .await
        .map_err(|e| format!("failed to run {tool}: {e}"))?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        Err(format!("{tool} exited with {}", output.status))
    } else {
        Err(stderr)
    }
}

#[async_trait]
impl SnapshotCapturer for PgDumpCapturer {
    fn engine_name(&self) -> &'static str {
        "postgres"
    }

    fn artifact_extension(&self) -> &'static str {
        "sql"
    }

    #[instrument(skip(self), fields(database = %self.params.database))]
    async fn capture(&self, destination: &Path) -> Result<()> {
        let mut command = self.command("pg_dump");
        command
            .arg("-d")
            .arg(&self.params.database)
            .arg("-f")
            .arg(destination);

        run_tool("pg_dump", command)
            .await
            .map_err(BackupError::capture)?;

        info!("PostgreSQL database backup completed");
        Ok(())
    }

    #[instrument(skip(self), fields(database = %self.params.database))]
    async fn replay(&self, artifact: &Path) -> Result<()> {
        let mut drop_db = self.command("dropdb");
        drop_db.arg("--if-exists").arg(&self.params.database);
        run_tool("dropdb", drop_db)
            .await
            .map_err(BackupError::restore)?;

        let mut create = self.command("createdb");
        create.arg(&self.params.database);
        run_tool("createdb", create)
            .await
            .map_err(BackupError::restore)?;

        let mut load = self.command("psql");
        load.arg("-v")
            .arg("ON_ERROR_STOP=1")
            .arg("-d")
            .arg(&self.params.database)
            .arg("-f")
            .arg(artifact);
        run_tool("psql", load).await.map_err(BackupError::restore)?;

        info!("PostgreSQL database restored");
        Ok(())
    }
}

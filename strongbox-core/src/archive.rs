/*!
Packaging of captured artifacts into a single backup archive.

With compression enabled the database artifact and the mirrored file tree are
combined into one gzip-compressed tar. With compression disabled a lone database
artifact is kept as-is, while a database artifact accompanied by mirrored files
is bundled into a plain tar, so auxiliary files always travel with the dump.
*/

use std::fs::{self, File};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use tar::{Archive, Builder};
use tracing::{info, warn};

use crate::{BackupError, Result};

/// Name fragment identifying the primary-store artifact inside an archive
pub const DATABASE_MARKER: &str = "_database";

/// Name fragment identifying the mirrored file tree inside an archive
pub const FILES_MARKER: &str = "_files";

/// On-disk shape of a backup artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    /// The primary artifact itself, no packaging
    Raw,
    /// Uncompressed tar bundle
    Tar,
    /// Gzip-compressed tar bundle
    TarGz,
}

impl ArchiveKind {
    /// Infer the kind from the archive file name
    pub fn detect(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            ArchiveKind::TarGz
        } else if name.ends_with(".tar") {
            ArchiveKind::Tar
        } else {
            ArchiveKind::Raw
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            ArchiveKind::Raw => "",
            ArchiveKind::Tar => "tar",
            ArchiveKind::TarGz => "tar.gz",
        }
    }
}

/// Intermediate artifacts produced by one capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedArtifacts {
    /// Primary-store artifact (`<id>_database.<ext>`)
    pub primary: PathBuf,
    /// Mirrored auxiliary tree (`<id>_files/`), when file capture ran
    pub auxiliary: Option<PathBuf>,
}

/// Packages captured artifacts and unpacks them again for restore
#[derive(Debug, Clone)]
pub struct Archiver {
    compress: bool,
    level: Compression,
}

impl Archiver {
    /// Create an archiver
    ///
    /// # Arguments
    /// * `compress` - Whether archives are gzip-compressed
    /// * `level` - Gzip level (0-9), ignored when `compress` is false
    pub fn new(compress: bool, level: u32) -> Self {
        Self {
            compress,
            level: Compression::new(level.min(9)),
        }
    }

    /// Kind of archive produced for the given artifacts
    pub fn kind_for(&self, artifacts: &CapturedArtifacts) -> ArchiveKind {
        match (self.compress, artifacts.auxiliary.is_some()) {
            (true, _) => ArchiveKind::TarGz,
            (false, true) => ArchiveKind::Tar,
            (false, false) => ArchiveKind::Raw,
        }
    }

    /// Package `artifacts` for backup `id` inside `backup_dir`
    ///
    /// Returns the path of the final artifact. Bundled intermediates are removed
    /// once the archive is written and flushed to disk. A partially written
    /// archive is removed on failure.
    ///
    /// # Errors
    /// * `BackupError::ArchiveFailed` - if the archive cannot be written
    pub async fn package(
        &self,
        id: &str,
        artifacts: &CapturedArtifacts,
        backup_dir: &Path,
    ) -> Result<PathBuf> {
        let kind = self.kind_for(artifacts);
        if kind == ArchiveKind::Raw {
            return Ok(artifacts.primary.clone());
        }

        let destination = backup_dir.join(format!("{id}.{}", kind.extension()));
        let level = self.level;
        let job_artifacts = artifacts.clone();
        let job_destination = destination.clone();

        let written = tokio::task::spawn_blocking(move || {
            write_archive(kind, level, &job_artifacts, &job_destination)
        })
        .await
        .map_err(|e| BackupError::archive(format!("Archive task failed: {e}")))?;

        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_file(&destination) {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    warn!(
                        "Failed to remove partial archive {}: {}",
                        destination.display(),
                        cleanup
                    );
                }
            }
            return Err(BackupError::archive(e.to_string()));
        }

        remove_intermediates(artifacts).await;
        info!("Backup archive created at {}", destination.display());
        Ok(destination)
    }

    /// Make the primary artifact of `archive` available for replay
    ///
    /// Tar bundles are unpacked into `scratch` and the primary artifact is
    /// located by the [`DATABASE_MARKER`] naming convention. Raw artifacts are
    /// returned unchanged and `scratch` is left untouched.
    ///
    /// # Errors
    /// * `BackupError::RestoreFailed` - unreadable archive or missing database artifact
    pub async fn extract(archive: &Path, scratch: &Path) -> Result<PathBuf> {
        let kind = ArchiveKind::detect(archive);
        if kind == ArchiveKind::Raw {
            return Ok(archive.to_path_buf());
        }

        let archive = archive.to_path_buf();
        let scratch = scratch.to_path_buf();
        tokio::task::spawn_blocking(move || extract_blocking(kind, &archive, &scratch))
            .await
            .map_err(|e| BackupError::restore(format!("Extraction task failed: {e}")))?
    }
}

impl Default for Archiver {
    fn default() -> Self {
        Self::new(true, 6)
    }
}

fn write_archive(
    kind: ArchiveKind,
    level: Compression,
    artifacts: &CapturedArtifacts,
    destination: &Path,
) -> io::Result<()> {
    let file = File::create(destination)?;
    let file = match kind {
        ArchiveKind::TarGz => append_artifacts(GzEncoder::new(file, level), artifacts)?.finish()?,
        _ => append_artifacts(file, artifacts)?,
    };
    file.sync_all()?;

    if fs::metadata(destination)?.len() == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("archive {} is empty after writing", destination.display()),
        ));
    }
    Ok(())
}

fn append_artifacts<W: Write>(writer: W, artifacts: &CapturedArtifacts) -> io::Result<W> {
    let mut builder = Builder::new(writer);

    let primary_name = artifacts.primary.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid artifact path {}", artifacts.primary.display()),
        )
    })?;
    builder.append_path_with_name(&artifacts.primary, primary_name)?;

    if let Some(auxiliary) = &artifacts.auxiliary {
        let tree_name = auxiliary
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(FILES_MARKER.trim_start_matches('_')));
        builder.append_dir_all(tree_name, auxiliary)?;
    }

    builder.into_inner()
}

async fn remove_intermediates(artifacts: &CapturedArtifacts) {
    if let Err(e) = tokio::fs::remove_file(&artifacts.primary).await {
        warn!(
            "Failed to remove staging artifact {}: {}",
            artifacts.primary.display(),
            e
        );
    }
    if let Some(auxiliary) = &artifacts.auxiliary {
        if let Err(e) = tokio::fs::remove_dir_all(auxiliary).await {
            warn!(
                "Failed to remove staging directory {}: {}",
                auxiliary.display(),
                e
            );
        }
    }
}

fn extract_blocking(kind: ArchiveKind, archive: &Path, scratch: &Path) -> Result<PathBuf> {
    let file = File::open(archive).map_err(|e| {
        BackupError::restore(format!("Failed to open archive {}: {}", archive.display(), e))
    })?;
    fs::create_dir_all(scratch).map_err(|e| {
        BackupError::restore(format!(
            "Failed to create scratch directory {}: {}",
            scratch.display(),
            e
        ))
    })?;

    let unpacked = match kind {
        ArchiveKind::TarGz => Archive::new(GzDecoder::new(BufReader::new(file))).unpack(scratch),
        _ => Archive::new(BufReader::new(file)).unpack(scratch),
    };
    unpacked.map_err(|e| {
        BackupError::restore(format!(
            "Failed to extract archive {}: {}",
            archive.display(),
            e
        ))
    })?;

    locate_primary(scratch)
}

fn locate_primary(root: &Path) -> Result<PathBuf> {
    let entries = fs::read_dir(root).map_err(|e| {
        BackupError::restore(format!("Failed to read {}: {}", root.display(), e))
    })?;

    for entry in entries.flatten() {
        let path = entry.path();
        let is_database = entry
            .file_name()
            .to_string_lossy()
            .contains(DATABASE_MARKER);
        if is_database && path.is_file() {
            return Ok(path);
        }
    }

    Err(BackupError::restore(format!(
        "No database artifact found in archive extracted to {}",
        root.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn stage(temp_dir: &TempDir, with_files: bool) -> CapturedArtifacts {
        let primary = temp_dir.path().join("b1_database.sqlite");
        fs::write(&primary, b"SQLite format 3\0rows".repeat(20)).unwrap();

        let auxiliary = with_files.then(|| {
            let tree = temp_dir.path().join("b1_files");
            fs::create_dir_all(tree.join("uploads/2024")).unwrap();
            fs::write(tree.join("uploads/2024/statement.pdf"), b"pdf").unwrap();
            tree
        });

        CapturedArtifacts { primary, auxiliary }
    }

    #[test]
    fn test_kind_detection() {
        assert_eq!(ArchiveKind::detect(Path::new("/b/x.tar.gz")), ArchiveKind::TarGz);
        assert_eq!(ArchiveKind::detect(Path::new("/b/x.tar")), ArchiveKind::Tar);
        assert_eq!(
            ArchiveKind::detect(Path::new("/b/x_database.sqlite")),
            ArchiveKind::Raw
        );
        assert_eq!(ArchiveKind::detect(Path::new("/b/x_database.sql")), ArchiveKind::Raw);
    }

    #[tokio::test]
    async fn test_compressed_archive_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let artifacts = stage(&temp_dir, true);

        let archive = Archiver::new(true, 6)
            .package("b1", &artifacts, temp_dir.path())
            .await
            .unwrap();

        assert_eq!(archive, temp_dir.path().join("b1.tar.gz"));
        assert!(archive.is_file());
        assert!(!artifacts.primary.exists());
        assert!(!artifacts.auxiliary.as_ref().unwrap().exists());

        let scratch = temp_dir.path().join("scratch");
        let primary = Archiver::extract(&archive, &scratch).await.unwrap();
        assert_eq!(primary.file_name().unwrap(), "b1_database.sqlite");
        assert_eq!(
            fs::read(&primary).unwrap(),
            b"SQLite format 3\0rows".repeat(20)
        );
        assert_eq!(
            fs::read(scratch.join("b1_files/uploads/2024/statement.pdf")).unwrap(),
            b"pdf"
        );
    }

    #[tokio::test]
    async fn test_uncompressed_without_files_passes_through() {
        let temp_dir = TempDir::new().unwrap();
        let artifacts = stage(&temp_dir, false);

        let archive = Archiver::new(false, 6)
            .package("b1", &artifacts, temp_dir.path())
            .await
            .unwrap();

        assert_eq!(archive, artifacts.primary);
        assert!(archive.exists());

        let scratch = temp_dir.path().join("scratch");
        let primary = Archiver::extract(&archive, &scratch).await.unwrap();
        assert_eq!(primary, archive);
        assert!(!scratch.exists());
    }

    #[tokio::test]
    async fn test_uncompressed_with_files_is_bundled() {
        let temp_dir = TempDir::new().unwrap();
        let artifacts = stage(&temp_dir, true);

        let archive = Archiver::new(false, 6)
            .package("b1", &artifacts, temp_dir.path())
            .await
            .unwrap();

        assert_eq!(archive, temp_dir.path().join("b1.tar"));
        assert!(!artifacts.primary.exists());

        let primary = Archiver::extract(&archive, &temp_dir.path().join("scratch"))
            .await
            .unwrap();
        assert!(primary.ends_with("b1_database.sqlite"));
    }

    #[tokio::test]
    async fn test_archive_failure_leaves_intermediates() {
        let temp_dir = TempDir::new().unwrap();
        let artifacts = stage(&temp_dir, false);

        let result = Archiver::new(true, 6)
            .package("b1", &artifacts, &temp_dir.path().join("missing-dir"))
            .await;

        assert!(matches!(result, Err(BackupError::ArchiveFailed(_))));
        assert!(artifacts.primary.exists());
    }

    #[tokio::test]
    async fn test_extract_corrupt_archive() {
        let temp_dir = TempDir::new().unwrap();
        let archive = temp_dir.path().join("b1.tar.gz");
        fs::write(&archive, b"this is not gzip data").unwrap();

        let result = Archiver::extract(&archive, &temp_dir.path().join("scratch")).await;
        assert!(matches!(result, Err(BackupError::RestoreFailed(_))));
    }

    #[tokio::test]
    async fn test_extract_without_database_artifact() {
        let temp_dir = TempDir::new().unwrap();
        let tree = temp_dir.path().join("only_files");
        fs::create_dir_all(&tree).unwrap();
        fs::write(tree.join("note.txt"), b"x").unwrap();

        let archive = temp_dir.path().join("b1.tar");
        let mut builder = Builder::new(File::create(&archive).unwrap());
        builder.append_dir_all("only_files", &tree).unwrap();
        builder.into_inner().unwrap();

        let result = Archiver::extract(&archive, &temp_dir.path().join("scratch")).await;
        match result {
            Err(BackupError::RestoreFailed(message)) => {
                assert!(message.contains("No database artifact"))
            }
            other => panic!("expected RestoreFailed, got {other:?}"),
        }
    }
}

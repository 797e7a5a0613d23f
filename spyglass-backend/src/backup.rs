//! Compressed database snapshots, written before full optimization runs.

use serde::Serialize;
use std::fs::File;
use std::io;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

#[derive(Debug, Clone, Serialize)]
struct SnapshotMetadata {
    created_at: i64,
    source: String,
    original_size_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub path: PathBuf,
    pub original_size: u64,
    pub archive_size: u64,
}

/// Write a zip snapshot of the database file plus a small metadata entry.
pub fn write_snapshot(
    db_path: &Path,
    backup_dir: &Path,
    now: i64,
) -> Result<SnapshotInfo, BackupError> {
    std::fs::create_dir_all(backup_dir)?;

    let stamp = chrono::DateTime::from_timestamp(now, 0)
        .map(|t| t.format("%Y%m%d_%H%M%S").to_string())
        .unwrap_or_else(|| now.to_string());
    let path = backup_dir.join(format!("spyglass_backup_{stamp}.zip"));
    let original_size = std::fs::metadata(db_path)?.len();

    let mut writer = ZipWriter::new(File::create(&path)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let entry_name = db_path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("spyglass.db");
    writer.start_file(entry_name, options)?;
    let mut source = File::open(db_path)?;
    io::copy(&mut source, &mut writer)?;

    let metadata = SnapshotMetadata {
        created_at: now,
        source: db_path.display().to_string(),
        original_size_bytes: original_size,
    };
    writer.start_file("backup_metadata.json", options)?;
    let body = serde_json::to_vec_pretty(&metadata).map_err(io::Error::other)?;
    writer.write_all(&body)?;

    let file = writer.finish()?;
    let archive_size = file.metadata()?.len();

    info!(
        path = %path.display(),
        original_size,
        archive_size,
        "wrote database snapshot"
    );
    Ok(SnapshotInfo {
        path,
        original_size,
        archive_size,
    })
}

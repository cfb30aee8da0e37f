//! JSONL storage: one line per collision.
//!
//! Readers never take the lock: they see either the previous or the next
//! complete table because writers replace the file by rename.

use crate::collision::Collision;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Read collisions from a JSONL reader.
pub fn read_collisions(reader: impl BufRead) -> Result<Vec<Collision>, JsonlError> {
    let mut collisions = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| JsonlError::Io(line_no + 1, e.to_string()))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let collision: Collision = serde_json::from_str(trimmed)
            .map_err(|e| JsonlError::Parse(line_no + 1, e.to_string()))?;
        collisions.push(collision);
    }
    Ok(collisions)
}

/// Write collisions to a JSONL writer.
pub fn write_collisions(
    writer: &mut impl Write,
    collisions: &[Collision],
) -> Result<(), JsonlError> {
    for collision in collisions {
        let line =
            serde_json::to_string(collision).map_err(|e| JsonlError::Serialize(e.to_string()))?;
        writeln!(writer, "{line}").map_err(|e| JsonlError::Io(0, e.to_string()))?;
    }
    Ok(())
}

/// Read collisions from a JSONL file path. A missing file is an empty table.
pub fn read_collisions_from_path(path: impl AsRef<Path>) -> Result<Vec<Collision>, JsonlError> {
    let path = path.as_ref();
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error(path, e)),
    };
    validate_substrate_bytes(path, &bytes)?;
    read_collisions(BufReader::new(bytes.as_slice()))
}

/// Atomically replace the JSONL file at `path`.
///
/// Sequence: write `<path>.tmp.<pid>.<nanos>`, fsync it, rename over `path`,
/// then fsync the parent directory so the rename itself is durable.
pub fn write_collisions_to_path(
    path: impl AsRef<Path>,
    collisions: &[Collision],
) -> Result<(), JsonlError> {
    let path = path.as_ref();
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
    }

    let tmp_path = tmp_write_path(path);
    if let Err(error) = write_synced(&tmp_path, collisions) {
        let _ = fs::remove_file(&tmp_path);
        return Err(error);
    }
    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(JsonlError::Io(
            0,
            format!("{} -> {}: {e}", tmp_path.display(), path.display()),
        ));
    }

    if let Some(parent) = parent {
        File::open(parent)
            .and_then(|dir| dir.sync_all())
            .map_err(|e| io_error(parent, e))?;
    }
    Ok(())
}

fn write_synced(tmp_path: &Path, collisions: &[Collision]) -> Result<(), JsonlError> {
    let file = File::create(tmp_path).map_err(|e| io_error(tmp_path, e))?;
    let mut writer = BufWriter::new(file);
    write_collisions(&mut writer, collisions)?;
    let file = writer
        .into_inner()
        .map_err(|e| io_error(tmp_path, e.error()))?;
    file.sync_all().map_err(|e| io_error(tmp_path, e))
}

fn io_error(path: &Path, err: impl std::fmt::Display) -> JsonlError {
    JsonlError::Io(0, format!("{}: {err}", path.display()))
}

fn tmp_write_path(path: &Path) -> PathBuf {
    let unique = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let mut tmp: OsString = path.as_os_str().to_os_string();
    tmp.push(format!(".tmp.{}.{unique}", std::process::id()));
    PathBuf::from(tmp)
}

fn validate_substrate_bytes(path: &Path, bytes: &[u8]) -> Result<(), JsonlError> {
    if bytes.contains(&0) {
        return Err(JsonlError::Corrupt(format!(
            "{}: contains NUL byte(s)",
            path.display()
        )));
    }
    if std::str::from_utf8(bytes).is_err() {
        return Err(JsonlError::Corrupt(format!(
            "{}: contains non-UTF-8 byte sequence(s)",
            path.display()
        )));
    }
    Ok(())
}

/// Errors from JSONL operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JsonlError {
    #[error("line {0}: I/O error: {1}")]
    Io(usize, String),

    #[error("line {0}: parse error: {1}")]
    Parse(usize, String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("corrupted substrate: {0}")]
    Corrupt(String),
}

//! This module provides an abstraction over the destination of
//! exported stats, so the flusher does not depend on the file
//! layout and unit tests can capture exports in memory.
//!
//! Files are always replaced atomically: the snapshot is written to a
//! temporary file next to the destination, synced to disk and renamed
//! over it, so a reader never observes a partial file.

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{event, Level};

use crate::accumulator::Stats;

/// Export errors.
#[derive(Error, Debug)]
pub enum ExportError {
    /// Failed to create the destination directory or the temp file.
    #[error("failed to prepare export destination {path}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to serialize the stats.
    #[error("failed to serialize stats")]
    Serialize(#[source] serde_json::Error),

    /// Failed to write or sync the temp file.
    #[error("failed to write stats")]
    Write(#[source] io::Error),

    /// Failed to move the temp file over the destination.
    #[error("failed to replace {path}")]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to rotate the previous export.
    #[error("failed to rotate {path}")]
    Rotate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A destination for stats snapshots.
pub trait StatsSink {
    fn write(&mut self, stats: &Stats) -> Result<(), ExportError>;
}

/// Writes `stats` as pretty JSON to `path` with an atomic replace.
/// Missing parent directories are created.
pub fn write_atomic(stats: &Stats, path: &Path) -> Result<(), ExportError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|source| ExportError::Prepare {
        path: parent.to_path_buf(),
        source,
    })?;

    let prefix = path
        .file_name()
        .map(|name| format!("{}.", name.to_string_lossy()))
        .unwrap_or_else(|| "logcost.".to_string());
    let tmp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(parent)
        .map_err(|source| ExportError::Prepare {
            path: parent.to_path_buf(),
            source,
        })?;

    // The temp file is removed on drop if anything below fails.
    let tmp = write_json(tmp, stats)?;
    tmp.persist(path).map_err(|err| ExportError::Persist {
        path: path.to_path_buf(),
        source: err.error,
    })?;

    event!(Level::DEBUG, path = %path.display(), sites = stats.len(), "Stats exported.");
    Ok(())
}

fn write_json(tmp: NamedTempFile, stats: &Stats) -> Result<NamedTempFile, ExportError> {
    let mut writer = BufWriter::new(tmp);
    serde_json::to_writer_pretty(&mut writer, stats).map_err(ExportError::Serialize)?;
    writer.write_all(b"\n").map_err(ExportError::Write)?;
    let tmp = writer
        .into_inner()
        .map_err(|err| ExportError::Write(err.into_error()))?;
    tmp.as_file().sync_all().map_err(ExportError::Write)?;
    Ok(tmp)
}

/// Exports snapshots to a file, rotating the previous export once it
/// reaches `max_file_size`.
#[derive(Debug, Clone)]
pub struct FileSink {
    path: PathBuf,
    max_file_size: Option<u64>,
    max_backups: usize,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_file_size: None,
            max_backups: 0,
        }
    }

    pub fn with_rotation(mut self, max_file_size: Option<u64>, max_backups: usize) -> Self {
        self.max_file_size = max_file_size;
        self.max_backups = max_backups;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{}", index));
        PathBuf::from(name)
    }

    fn needs_rotation(&self) -> bool {
        match (self.max_file_size, fs::metadata(&self.path)) {
            (Some(limit), Ok(meta)) => meta.len() >= limit,
            _ => false,
        }
    }

    /// Shifts `path.N-1` to `path.N` down to `path` to `path.1`. The
    /// oldest backup falls off the end.
    fn rotate(&self) -> Result<(), ExportError> {
        let rotate_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| ExportError::Rotate { path, source }
        };

        if self.max_backups == 0 {
            return fs::remove_file(&self.path).map_err(rotate_err(&self.path));
        }

        let oldest = self.backup_path(self.max_backups);
        if oldest.exists() {
            fs::remove_file(&oldest).map_err(rotate_err(&oldest))?;
        }
        for index in (1..self.max_backups).rev() {
            let from = self.backup_path(index);
            if from.exists() {
                fs::rename(&from, self.backup_path(index + 1)).map_err(rotate_err(&from))?;
            }
        }
        fs::rename(&self.path, self.backup_path(1)).map_err(rotate_err(&self.path))?;

        event!(Level::INFO, path = %self.path.display(), "Rotated stats file.");
        Ok(())
    }
}

impl StatsSink for FileSink {
    fn write(&mut self, stats: &Stats) -> Result<(), ExportError> {
        if self.needs_rotation() {
            self.rotate()?;
        }
        write_atomic(stats, &self.path)
    }
}

#[cfg(test)]
pub(crate) struct DummySink {
    pub exports: std::sync::Arc<parking_lot::Mutex<Vec<Stats>>>,
}

#[cfg(test)]
impl StatsSink for DummySink {
    fn write(&mut self, stats: &Stats) -> Result<(), ExportError> {
        self.exports.lock().push(stats.clone());
        Ok(())
    }
}

//! Append-only archive of completed runs (`runs.jsonl`).

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::ensemble::RunRecord;

pub const ARCHIVE_FILE: &str = "runs.jsonl";

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("task join error: {0}")]
    Join(String),
}

/// One JSON line per `RunRecord`, appended under an exclusive file lock so
/// concurrent writers never interleave partial lines.
#[derive(Debug, Clone)]
pub struct RunArchive {
    path: PathBuf,
}

impl RunArchive {
    /// Open (creating if needed) the archive under `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, ArchiveError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            path: dir.join(ARCHIVE_FILE),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, record: &RunRecord) -> Result<(), ArchiveError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || append_line(&path, &line))
            .await
            .map_err(|e| ArchiveError::Join(e.to_string()))?
    }

    /// Every readable record in file order. Lines that fail to parse are skipped.
    pub async fn load_all(&self) -> Result<Vec<RunRecord>, ArchiveError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_records(&path))
            .await
            .map_err(|e| ArchiveError::Join(e.to_string()))?
    }
}

fn append_line(path: &Path, line: &str) -> Result<(), ArchiveError> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.lock_exclusive()?;
    let result = file.write_all(line.as_bytes()).and_then(|_| file.flush());
    let unlocked = file.unlock();
    result?;
    unlocked?;
    Ok(())
}

fn read_records(path: &Path) -> Result<Vec<RunRecord>, ArchiveError> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    file.lock_shared()?;

    let mut records = Vec::new();
    for (idx, line) in BufReader::new(&file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RunRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => tracing::warn!(line = idx + 1, error = %e, "skipping malformed archive line"),
        }
    }
    file.unlock()?;
    Ok(records)
}

//! File-backed history store using JSON lines.

use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::core::{HistoryCursor, HistoryQuery, HistoryStore, JobRun, SchedulerError};

/// Durable history appended to a single `.jsonl` file.
///
/// Existing records are loaded on open. Queries read an in-memory mirror that
/// is only extended after the line has been flushed to disk.
pub struct FileHistoryStore {
    path: PathBuf,
    inner: Mutex<FileState>,
}

struct FileState {
    writer: BufWriter<File>,
    runs: Arc<Vec<JobRun>>,
}

fn backend_err(path: &Path, e: impl std::fmt::Display) -> SchedulerError {
    SchedulerError::Infrastructure(format!("history file {}: {e}", path.display()))
}

impl FileHistoryStore {
    /// Open (or create) the history file at `path`.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Infrastructure` if the file cannot be created
    /// or an existing line cannot be parsed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            create_dir_all(parent).map_err(|e| backend_err(&path, e))?;
        }
        let runs = Self::load(&path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| backend_err(&path, e))?;
        debug!(path = %path.display(), records = runs.len(), "Opened history file");
        Ok(Self {
            inner: Mutex::new(FileState {
                writer: BufWriter::new(file),
                runs: Arc::new(runs),
            }),
            path,
        })
    }

    fn load(path: &Path) -> Result<Vec<JobRun>, SchedulerError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(path).map_err(|e| backend_err(path, e))?;
        let mut runs = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| backend_err(path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            let run: JobRun = serde_json::from_str(&line)
                .map_err(|e| backend_err(path, format!("line {}: {e}", index + 1)))?;
            runs.push(run);
        }
        Ok(runs)
    }

    /// Location of the history file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for FileHistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHistoryStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl HistoryStore for FileHistoryStore {
    fn append(&self, run: &JobRun) -> Result<(), SchedulerError> {
        let line = serde_json::to_string(run).map_err(|e| backend_err(&self.path, e))?;
        let mut state = self.inner.lock();
        writeln!(state.writer, "{line}").map_err(|e| backend_err(&self.path, e))?;
        state.writer.flush().map_err(|e| backend_err(&self.path, e))?;
        Arc::make_mut(&mut state.runs).push(run.clone());
        Ok(())
    }

    fn query(&self, query: &HistoryQuery) -> Result<HistoryCursor, SchedulerError> {
        let snapshot = Arc::clone(&self.inner.lock().runs);
        Ok(HistoryCursor::new(snapshot, query.clone()))
    }
}

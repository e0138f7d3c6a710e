//! Run journals: an on-disk audit trail of one task.
//!
//! Each run gets its own directory under the journal base directory:
//! - `.run.json` metadata (id, creation time, host, device)
//! - one PNG per observed snapshot
//! - `result.json` with the final [`TaskResult`]
//!
//! The directory is removed when the journal is dropped unless it is kept.
//! Nothing in the control loop reads a journal back.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::config;
use crate::perception::Snapshot;
use crate::task::TaskResult;

pub type JournalResult<T> = Result<T, JournalError>;

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize journal entry: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug)]
pub struct RunJournal {
    id: String,
    dir: PathBuf,
    keep: bool,
    snapshots: usize,
}

impl RunJournal {
    /// Create a journal named after `name` under the configured base directory
    pub fn create(name: &str, device: &str) -> JournalResult<Self> {
        Self::create_in(config::journal_base_dir(), name, device)
    }

    pub fn create_in(base: impl AsRef<Path>, name: &str, device: &str) -> JournalResult<Self> {
        let id = format!("{}_{}", sanitize_name(name), timestamp_suffix());
        let dir = base.as_ref().join(&id);
        fs::create_dir_all(&dir)?;

        let metadata = serde_json::json!({
            "id": id,
            "created": chrono::Utc::now().to_rfc3339(),
            "hostname": hostname::get().ok().map(|h| h.to_string_lossy().into_owned()),
            "device": device,
        });
        fs::write(dir.join(".run.json"), serde_json::to_string_pretty(&metadata)?)?;

        tracing::debug!(journal = %dir.display(), "run journal created");
        Ok(Self {
            id,
            dir,
            keep: false,
            snapshots: 0,
        })
    }

    /// Journal in a caller-chosen directory; kept by default
    pub fn in_dir(dir: impl Into<PathBuf>, device: &str) -> JournalResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let id = dir
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("run_{}", timestamp_suffix()));
        let metadata = serde_json::json!({
            "id": id,
            "created": chrono::Utc::now().to_rfc3339(),
            "hostname": hostname::get().ok().map(|h| h.to_string_lossy().into_owned()),
            "device": device,
        });
        fs::write(dir.join(".run.json"), serde_json::to_string_pretty(&metadata)?)?;
        Ok(Self {
            id,
            dir,
            keep: true,
            snapshots: 0,
        })
    }

    pub fn keep(mut self, keep: bool) -> Self {
        self.keep = keep;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The run directory, if it outlives this journal
    pub fn kept_dir(&self) -> Option<&Path> {
        self.keep.then_some(self.dir.as_path())
    }

    /// Write the snapshot's screenshot as the next numbered PNG
    pub fn record_snapshot(&mut self, snapshot: &Snapshot) -> JournalResult<PathBuf> {
        let path = self
            .dir
            .join(format!("snapshot_{:03}.png", self.snapshots));
        fs::write(&path, snapshot.image())?;
        self.snapshots += 1;
        Ok(path)
    }

    pub fn record_result(&self, result: &TaskResult) -> JournalResult<PathBuf> {
        let path = self.dir.join("result.json");
        fs::write(&path, serde_json::to_string_pretty(result)?)?;
        Ok(path)
    }

    /// PNG files written so far, in order
    pub fn list_snapshots(&self) -> JournalResult<Vec<PathBuf>> {
        let mut snapshots = Vec::new();
        if self.dir.exists() {
            for entry in fs::read_dir(&self.dir)? {
                let path = entry?.path();
                if path.extension().is_some_and(|e| e == "png") {
                    snapshots.push(path);
                }
            }
        }
        snapshots.sort();
        Ok(snapshots)
    }
}

impl Drop for RunJournal {
    fn drop(&mut self) {
        if !self.keep {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }
}

fn timestamp_suffix() -> String {
    chrono::Utc::now().format("%Y%m%d_%H%M%S_%3f").to_string()
}

fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .take(40)
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect();
    if cleaned.is_empty() {
        "run".to_string()
    } else {
        cleaned
    }
}

/// Run directories under `base`, sorted by name
pub fn list_runs(base: impl AsRef<Path>) -> JournalResult<Vec<PathBuf>> {
    let base = base.as_ref();
    if !base.exists() {
        return Ok(Vec::new());
    }
    let mut runs = Vec::new();
    for entry in fs::read_dir(base)? {
        let path = entry?.path();
        if path.is_dir() {
            runs.push(path);
        }
    }
    runs.sort();
    Ok(runs)
}

/// Remove run directories under `base` last modified more than `max_age` ago
pub fn cleanup_old_runs(base: impl AsRef<Path>, max_age: Duration) -> JournalResult<usize> {
    let now = SystemTime::now();
    let mut cleaned = 0;
    for run in list_runs(base)? {
        let age = fs::metadata(&run)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok());
        let Some(age) = age else { continue };
        if age > max_age && fs::remove_dir_all(&run).is_ok() {
            cleaned += 1;
        }
    }
    Ok(cleaned)
}

//! Completion log executor - appends one JSONL record per execution
//!
//! Several replica processes may share the file; each append holds an
//! exclusive advisory lock so lines never interleave.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use keystore::Clock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ExecutorError, TaskExecutor};
use crate::keys::WorkKey;

/// One line of the completion log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub work_key: String,
    pub completed_at: DateTime<Utc>,
    pub completed_at_ms: i64,
    pub replica: String,
}

#[derive(Debug, Clone)]
pub struct CompletionLog {
    path: PathBuf,
    replica_id: String,
    clock: Arc<dyn Clock>,
}

impl CompletionLog {
    pub fn new(path: impl AsRef<Path>, replica_id: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        let path = path.as_ref().to_path_buf();
        debug!(?path, "CompletionLog::new: called");
        Self {
            path,
            replica_id: replica_id.into(),
            clock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn record(&self, work_key: &WorkKey) -> CompletionRecord {
        let completed_at_ms = self.clock.now_ms();
        CompletionRecord {
            work_key: work_key.to_string(),
            completed_at: DateTime::<Utc>::from_timestamp_millis(completed_at_ms).unwrap_or_default(),
            completed_at_ms,
            replica: self.replica_id.clone(),
        }
    }
}

fn append(path: &Path, record: &CompletionRecord) -> Result<(), ExecutorError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_string(record)?;
    line.push('\n');

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    FileExt::lock_exclusive(&file)?;
    let written = file.write_all(line.as_bytes()).and_then(|_| file.flush());
    FileExt::unlock(&file)?;
    written?;
    Ok(())
}

#[async_trait]
impl TaskExecutor for CompletionLog {
    async fn execute(&self, work_key: &WorkKey) -> Result<(), ExecutorError> {
        let record = self.record(work_key);
        let path = self.path.clone();
        debug!(%work_key, completed_at_ms = record.completed_at_ms, "CompletionLog::execute: appending");

        tokio::task::spawn_blocking(move || append(&path, &record))
            .await
            .map_err(|e| ExecutorError::Failed(format!("append task panicked: {}", e)))?
    }
}

/// Read back the log, optionally only one key's records
///
/// A missing file reads as empty; malformed lines are skipped.
pub fn read_completions(path: impl AsRef<Path>, work_key: Option<&str>) -> Result<Vec<CompletionRecord>, ExecutorError> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }

    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CompletionRecord>(&line) {
            Ok(record) if work_key.is_none_or(|k| k == record.work_key) => records.push(record),
            Ok(_) => {}
            Err(e) => warn!(%line, error = %e, "read_completions: skipping malformed line"),
        }
    }

    debug!(count = records.len(), "read_completions: loaded");
    Ok(records)
}

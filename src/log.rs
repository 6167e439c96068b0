use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::logger::Logger;
use crate::mirror::{Pass, PassReport};
use crate::transfer::{TransferError, TransferTask};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Completed,
    Failed,
    /// Failed, and the retry queue had no room for it
    Dropped,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct TransferLogEntry {
    pub timestamp: String,
    pub run_id: String,
    pub pass: Option<String>,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub status: TransferStatus,
    pub bytes_transferred: u64,
    pub error: Option<String>,
}

/// JSONL journal of per-file outcomes for one run.
///
/// The file is opened once in append mode; every entry goes out as a single
/// `write_all` of one line, so workers never interleave.
pub struct TransferLog {
    path: PathBuf,
    run_id: Uuid,
    file: Mutex<File>,
}

impl TransferLog {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating journal directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening journal {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            run_id: Uuid::new_v4(),
            file: Mutex::new(file),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn append(&self, entry: &TransferLogEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.file.lock().write_all(&line)?;
        Ok(())
    }

    fn record(
        &self,
        pass: Option<Pass>,
        task: &TransferTask,
        status: TransferStatus,
        bytes: u64,
        error: Option<String>,
    ) {
        let entry = TransferLogEntry {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            run_id: self.run_id.to_string(),
            pass: pass.map(|p| p.to_string()),
            source: task.source.clone(),
            destination: task.destination.clone(),
            status,
            bytes_transferred: bytes,
            error,
        };
        if let Err(e) = self.append(&entry) {
            tracing::warn!(path = %self.path.display(), error = %e, "journal write failed");
        }
    }
}

impl Logger for TransferLog {
    fn pass_finished(&self, pass: Pass, report: &PassReport) {
        tracing::debug!(
            %pass,
            run_id = %self.run_id,
            failed = report.failed,
            "journal pass closed"
        );
    }
    fn transfer_done(&self, pass: Pass, task: &TransferTask, bytes: u64) {
        self.record(Some(pass), task, TransferStatus::Completed, bytes, None);
    }
    fn transfer_failed(&self, pass: Pass, task: &TransferTask, err: &TransferError) {
        self.record(Some(pass), task, TransferStatus::Failed, 0, Some(err.to_string()));
    }
    fn retry_dropped(&self, task: &TransferTask) {
        self.record(None, task, TransferStatus::Dropped, 0, None);
    }
}

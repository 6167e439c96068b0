//! Two-pass mirror orchestration
//!
//! Pass one walks the remote tree on the calling thread. Directories are
//! created inline, so a parent always exists before any child file is handed
//! to a worker. Files go to a bounded worker pool; failures land in the
//! failure queue. Once every worker has finished, the queue is closed and
//! pass two retries each queued task exactly once. Nothing is re-queued.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::failures::{ClosedFailureQueue, FailureQueue, DEFAULT_RETRY_CAPACITY};
use crate::logger::Logger;
use crate::pool::WorkerPool;
use crate::session::{EntryKind, RemoteSession};
use crate::transfer::{download_file, ensure_dir, TransferError, TransferTask};

/// Default number of concurrent transfers
pub const DEFAULT_WORKERS: usize = 10;
/// Default read size, one SFTP packet
pub const DEFAULT_PACKET_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Pass {
    Initial,
    Retry,
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Pass::Initial => "initial",
            Pass::Retry => "retry",
        })
    }
}

/// Counters for one pass
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub bytes_copied: u64,
    pub peak_in_flight: usize,
    /// Walk statistics (initial pass only)
    pub directories: u64,
    pub walk_errors: u64,
    pub skipped: u64,
    /// Failure queue outcome (initial pass only)
    pub queued: u64,
    pub dropped: u64,
}

impl PassReport {
    fn add_file(&mut self, bytes: u64) {
        self.succeeded += 1;
        self.bytes_copied += bytes;
    }

    fn add_failure(&mut self) {
        self.failed += 1;
    }
}

#[derive(Debug, Clone)]
pub struct MirrorReport {
    pub initial: PassReport,
    pub retry: PassReport,
    /// Tasks that failed again in the retry pass
    pub unrecovered: Vec<TransferTask>,
    /// Tasks that failed once but never got a retry because the queue was full
    pub dropped: Vec<TransferTask>,
    pub elapsed: Duration,
}

impl MirrorReport {
    /// Every file seen by the walk ended up downloaded
    pub fn is_complete(&self) -> bool {
        self.unrecovered.is_empty() && self.dropped.is_empty() && self.initial.walk_errors == 0
    }

    pub fn files_copied(&self) -> u64 {
        self.initial.succeeded + self.retry.succeeded
    }

    pub fn bytes_copied(&self) -> u64 {
        self.initial.bytes_copied + self.retry.bytes_copied
    }
}

/// Tuning for a mirror run
#[derive(Debug, Clone)]
pub struct MirrorOptions {
    pub source_root: PathBuf,
    pub destination_root: PathBuf,
    pub workers: usize,
    pub retry_capacity: usize,
    pub packet_size: usize,
}

impl MirrorOptions {
    pub fn new(source_root: impl Into<PathBuf>, destination_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            destination_root: destination_root.into(),
            workers: DEFAULT_WORKERS,
            retry_capacity: DEFAULT_RETRY_CAPACITY,
            packet_size: DEFAULT_PACKET_SIZE,
        }
    }
}

pub struct Mirror<'a> {
    session: &'a dyn RemoteSession,
    options: MirrorOptions,
    logger: &'a dyn Logger,
}

impl<'a> Mirror<'a> {
    pub fn new(
        session: &'a dyn RemoteSession,
        options: MirrorOptions,
        logger: &'a dyn Logger,
    ) -> Self {
        Self {
            session,
            options,
            logger,
        }
    }

    /// Run the initial pass and then the retry pass
    pub fn run(&self) -> MirrorReport {
        let started = Instant::now();

        let queue = FailureQueue::with_capacity(self.options.retry_capacity);
        let initial = self.initial_pass(&queue);
        let closed = queue.close();
        let (retry, unrecovered, dropped) = self.retry_pass(closed);

        MirrorReport {
            initial,
            retry,
            unrecovered,
            dropped,
            elapsed: started.elapsed(),
        }
    }

    fn initial_pass(&self, queue: &FailureQueue) -> PassReport {
        let pass = Pass::Initial;
        self.logger.pass_started(pass);

        let report = Mutex::new(PassReport::default());
        let pool = WorkerPool::new(self.options.workers);
        let root = self.options.source_root.as_path();

        let stats = pool.run(
            |submit| {
                for item in self.session.walk(root) {
                    let entry = match item {
                        Ok(entry) => entry,
                        Err(err) => {
                            self.logger.walk_error(&err.path, &err.source.to_string());
                            report.lock().walk_errors += 1;
                            continue;
                        }
                    };

                    let destination =
                        compute_destination(&entry.path, root, &self.options.destination_root);
                    match entry.kind {
                        EntryKind::Directory => {
                            ensure_dir(&destination, self.logger);
                            report.lock().directories += 1;
                        }
                        EntryKind::File => {
                            let task = TransferTask::new(entry.path, destination);
                            if submit.submit(task).is_err() {
                                // Only reachable if every worker has died
                                break;
                            }
                        }
                        EntryKind::Other => {
                            self.logger.skipped(&entry.path);
                            report.lock().skipped += 1;
                        }
                    }
                }
            },
            |task: TransferTask| match self.attempt(pass, &task) {
                Ok(bytes) => report.lock().add_file(bytes),
                Err(_) => {
                    report.lock().add_failure();
                    queue.offer(task, self.logger);
                }
            },
        );

        let mut report = report.into_inner();
        report.attempted = stats.dispatched as u64;
        report.peak_in_flight = stats.peak_in_flight;
        report.queued = queue.queued() as u64;
        report.dropped = queue.dropped_count() as u64;
        self.logger.pass_finished(pass, &report);
        report
    }

    fn retry_pass(
        &self,
        closed: ClosedFailureQueue,
    ) -> (PassReport, Vec<TransferTask>, Vec<TransferTask>) {
        let pass = Pass::Retry;
        self.logger.pass_started(pass);

        let (pending, dropped) = closed.drain();
        let report = Mutex::new(PassReport::default());
        let unrecovered = Mutex::new(Vec::new());

        let stats = WorkerPool::new(self.options.workers).run(
            |submit| {
                for task in pending {
                    if submit.submit(task).is_err() {
                        break;
                    }
                }
            },
            |task: TransferTask| match self.attempt(pass, &task) {
                Ok(bytes) => report.lock().add_file(bytes),
                Err(_) => {
                    report.lock().add_failure();
                    unrecovered.lock().push(task);
                }
            },
        );

        let mut report = report.into_inner();
        report.attempted = stats.dispatched as u64;
        report.peak_in_flight = stats.peak_in_flight;
        self.logger.pass_finished(pass, &report);
        (report, unrecovered.into_inner(), dropped)
    }

    /// Run one Transfer Unit, containing panics, and log its outcome
    fn attempt(&self, pass: Pass, task: &TransferTask) -> Result<u64, TransferError> {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            download_file(self.session, task, self.options.packet_size, self.logger)
        }))
        .unwrap_or_else(|_| {
            Err(TransferError::Panicked {
                path: task.source.clone(),
            })
        });

        match &result {
            Ok(bytes) => self.logger.transfer_done(pass, task, *bytes),
            Err(e) => self.logger.transfer_failed(pass, task, e),
        }
        result
    }
}

/// Compute destination path for a walked entry by swapping the source root for the destination root
pub fn compute_destination(src_entry: &Path, src_root: &Path, dst_root: &Path) -> PathBuf {
    if let Ok(rel_path) = src_entry.strip_prefix(src_root) {
        if rel_path.as_os_str().is_empty() {
            dst_root.to_path_buf()
        } else {
            dst_root.join(rel_path)
        }
    } else {
        dst_root.join(src_entry.file_name().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_replaces_source_root() {
        assert_eq!(
            compute_destination(
                Path::new("/srv/data/sub/b.txt"),
                Path::new("/srv/data"),
                Path::new("/backup")
            ),
            PathBuf::from("/backup/sub/b.txt")
        );
    }

    #[test]
    fn root_maps_to_destination_root() {
        assert_eq!(
            compute_destination(
                Path::new("/srv/data"),
                Path::new("/srv/data/"),
                Path::new("/backup")
            ),
            PathBuf::from("/backup")
        );
    }

    #[test]
    fn entry_outside_root_keeps_its_file_name() {
        assert_eq!(
            compute_destination(
                Path::new("/elsewhere/x.bin"),
                Path::new("/srv/data"),
                Path::new("/backup")
            ),
            PathBuf::from("/backup/x.bin")
        );
    }

    #[test]
    fn pass_display_matches_serde_names() {
        assert_eq!(Pass::Initial.to_string(), "initial");
        assert_eq!(serde_json::to_string(&Pass::Retry).unwrap(), "\"retry\"");
    }

    #[test]
    fn report_is_complete_only_without_losses() {
        let mut report = MirrorReport {
            initial: PassReport::default(),
            retry: PassReport::default(),
            unrecovered: Vec::new(),
            dropped: Vec::new(),
            elapsed: Duration::ZERO,
        };
        assert!(report.is_complete());

        report.dropped.push(TransferTask::new("/r/a", "/l/a"));
        assert!(!report.is_complete());
    }
}

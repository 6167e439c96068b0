use anyhow::{anyhow, Context, Result};
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

use crate::mirror::{Pass, PassReport};
use crate::transfer::{TransferError, TransferTask};

/// Default level when `RUST_LOG` is not set
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Mirror events, passed explicitly to every component that emits them
pub trait Logger: Send + Sync {
    fn pass_started(&self, _pass: Pass) {}
    fn pass_finished(&self, _pass: Pass, _report: &PassReport) {}
    fn dir_ready(&self, _path: &Path) {}
    fn dir_error(&self, _path: &Path, _msg: &str) {}
    fn walk_error(&self, _path: &Path, _msg: &str) {}
    fn skipped(&self, _path: &Path) {}
    fn transfer_done(&self, _pass: Pass, _task: &TransferTask, _bytes: u64) {}
    fn transfer_failed(&self, _pass: Pass, _task: &TransferTask, _err: &TransferError) {}
    fn close_error(&self, _path: &Path, _msg: &str) {}
    fn retry_dropped(&self, _task: &TransferTask) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

/// Install the stderr `tracing` subscriber; `RUST_LOG` overrides `level`
pub fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

/// Forwards events to `tracing`
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn pass_started(&self, pass: Pass) {
        tracing::info!(%pass, "starting pass");
    }
    fn pass_finished(&self, pass: Pass, report: &PassReport) {
        tracing::info!(
            %pass,
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            bytes = report.bytes_copied,
            peak_in_flight = report.peak_in_flight,
            dropped = report.dropped,
            "finished pass"
        );
    }
    fn dir_ready(&self, path: &Path) {
        tracing::debug!(path = %path.display(), "directory ready");
    }
    fn dir_error(&self, path: &Path, msg: &str) {
        tracing::error!(path = %path.display(), error = msg, "failed to create directory");
    }
    fn walk_error(&self, path: &Path, msg: &str) {
        tracing::error!(path = %path.display(), error = msg, "failed to walk");
    }
    fn skipped(&self, path: &Path) {
        tracing::info!(path = %path.display(), "skipping entry that is not a file or directory");
    }
    fn transfer_done(&self, pass: Pass, task: &TransferTask, bytes: u64) {
        tracing::debug!(
            %pass,
            src = %task.source.display(),
            dst = %task.destination.display(),
            bytes,
            "downloaded file"
        );
    }
    fn transfer_failed(&self, pass: Pass, task: &TransferTask, err: &TransferError) {
        tracing::error!(
            %pass,
            src = %task.source.display(),
            error = %err,
            "failed to download file"
        );
    }
    fn close_error(&self, path: &Path, msg: &str) {
        tracing::error!(path = %path.display(), error = msg, "failed to close source file");
    }
    fn retry_dropped(&self, task: &TransferTask) {
        tracing::warn!(
            src = %task.source.display(),
            "retry queue full; task dropped and retry list is incomplete"
        );
    }
}

/// Timestamped plain-text lines appended to a file, one per event
pub struct TextLogger {
    out: Mutex<LineWriter<File>>,
}

impl TextLogger {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating log directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        Ok(Self {
            out: Mutex::new(LineWriter::new(file)),
        })
    }

    fn write(&self, tag: &str, fields: std::fmt::Arguments<'_>) {
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        // A log sink never fails the mirror
        let _ = writeln!(self.out.lock(), "[{stamp}] {tag} {fields}");
    }
}

impl Logger for TextLogger {
    fn pass_started(&self, pass: Pass) {
        self.write("PASS_START", format_args!("pass={pass}"));
    }
    fn pass_finished(&self, pass: Pass, report: &PassReport) {
        self.write(
            "PASS_DONE",
            format_args!(
                "pass={pass} attempted={} succeeded={} failed={} bytes={}",
                report.attempted, report.succeeded, report.failed, report.bytes_copied
            ),
        );
    }
    fn dir_error(&self, path: &Path, msg: &str) {
        self.write("ERROR", format_args!("ctx=mkdir path={} msg={msg}", path.display()));
    }
    fn walk_error(&self, path: &Path, msg: &str) {
        self.write("ERROR", format_args!("ctx=walk path={} msg={msg}", path.display()));
    }
    fn skipped(&self, path: &Path) {
        self.write("SKIP", format_args!("path={}", path.display()));
    }
    fn transfer_done(&self, pass: Pass, task: &TransferTask, bytes: u64) {
        self.write(
            "COPY",
            format_args!(
                "pass={pass} src={} dst={} bytes={bytes}",
                task.source.display(),
                task.destination.display()
            ),
        );
    }
    fn transfer_failed(&self, pass: Pass, task: &TransferTask, err: &TransferError) {
        self.write(
            "ERROR",
            format_args!("ctx=download pass={pass} path={} msg={err}", task.source.display()),
        );
    }
    fn close_error(&self, path: &Path, msg: &str) {
        self.write("ERROR", format_args!("ctx=close path={} msg={msg}", path.display()));
    }
    fn retry_dropped(&self, task: &TransferTask) {
        self.write("DROP", format_args!("path={}", task.source.display()));
    }
}

/// Sends every event to each wrapped logger in order
#[derive(Default)]
pub struct FanoutLogger {
    loggers: Vec<Arc<dyn Logger>>,
}

impl FanoutLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, logger: Arc<dyn Logger>) -> Self {
        self.loggers.push(logger);
        self
    }
}

impl Logger for FanoutLogger {
    fn pass_started(&self, pass: Pass) {
        self.loggers.iter().for_each(|l| l.pass_started(pass));
    }
    fn pass_finished(&self, pass: Pass, report: &PassReport) {
        self.loggers.iter().for_each(|l| l.pass_finished(pass, report));
    }
    fn dir_ready(&self, path: &Path) {
        self.loggers.iter().for_each(|l| l.dir_ready(path));
    }
    fn dir_error(&self, path: &Path, msg: &str) {
        self.loggers.iter().for_each(|l| l.dir_error(path, msg));
    }
    fn walk_error(&self, path: &Path, msg: &str) {
        self.loggers.iter().for_each(|l| l.walk_error(path, msg));
    }
    fn skipped(&self, path: &Path) {
        self.loggers.iter().for_each(|l| l.skipped(path));
    }
    fn transfer_done(&self, pass: Pass, task: &TransferTask, bytes: u64) {
        self.loggers.iter().for_each(|l| l.transfer_done(pass, task, bytes));
    }
    fn transfer_failed(&self, pass: Pass, task: &TransferTask, err: &TransferError) {
        self.loggers.iter().for_each(|l| l.transfer_failed(pass, task, err));
    }
    fn close_error(&self, path: &Path, msg: &str) {
        self.loggers.iter().for_each(|l| l.close_error(path, msg));
    }
    fn retry_dropped(&self, task: &TransferTask) {
        self.loggers.iter().for_each(|l| l.retry_dropped(task));
    }
}

/// Event captured by [`MemoryLogger`], keyed by the path it concerns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    PassStarted(Pass),
    PassFinished(Pass),
    DirReady(PathBuf),
    DirError(PathBuf),
    WalkError(PathBuf),
    Skipped(PathBuf),
    TransferDone { pass: Pass, source: PathBuf },
    TransferFailed { pass: Pass, source: PathBuf },
    CloseError(PathBuf),
    RetryDropped(PathBuf),
}

/// Records events in emission order; for tests and embedding
#[derive(Default)]
pub struct MemoryLogger {
    events: Mutex<Vec<LogEvent>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&LogEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }

    fn push(&self, event: LogEvent) {
        self.events.lock().push(event);
    }
}

impl Logger for MemoryLogger {
    fn pass_started(&self, pass: Pass) {
        self.push(LogEvent::PassStarted(pass));
    }
    fn pass_finished(&self, pass: Pass, _report: &PassReport) {
        self.push(LogEvent::PassFinished(pass));
    }
    fn dir_ready(&self, path: &Path) {
        self.push(LogEvent::DirReady(path.to_path_buf()));
    }
    fn dir_error(&self, path: &Path, _msg: &str) {
        self.push(LogEvent::DirError(path.to_path_buf()));
    }
    fn walk_error(&self, path: &Path, _msg: &str) {
        self.push(LogEvent::WalkError(path.to_path_buf()));
    }
    fn skipped(&self, path: &Path) {
        self.push(LogEvent::Skipped(path.to_path_buf()));
    }
    fn transfer_done(&self, pass: Pass, task: &TransferTask, _bytes: u64) {
        self.push(LogEvent::TransferDone {
            pass,
            source: task.source.clone(),
        });
    }
    fn transfer_failed(&self, pass: Pass, task: &TransferTask, _err: &TransferError) {
        self.push(LogEvent::TransferFailed {
            pass,
            source: task.source.clone(),
        });
    }
    fn close_error(&self, path: &Path, _msg: &str) {
        self.push(LogEvent::CloseError(path.to_path_buf()));
    }
    fn retry_dropped(&self, task: &TransferTask) {
        self.push(LogEvent::RetryDropped(task.source.clone()));
    }
}

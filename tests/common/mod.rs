#![allow(dead_code)]

use anyhow::Result;
use parking_lot::Mutex;
use sftp_mirror::mirror::compute_destination;
use sftp_mirror::session::{
    EntryKind, LocalSession, RemoteEntry, RemoteFile, RemoteSession, SessionError, Walk,
    WalkError,
};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    Ok(())
}

/// Deterministic, non-repeating-looking payload of `size` bytes
pub fn payload(seed: u8, size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

/// Relative path -> contents for every regular file under `root`
pub fn snapshot(root: &Path) -> Result<HashMap<PathBuf, Vec<u8>>> {
    let mut files = HashMap::new();
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry?;
        if entry.file_type().is_file() {
            let rel = entry.path().strip_prefix(root)?.to_path_buf();
            files.insert(rel, std::fs::read(entry.path())?);
        }
    }
    Ok(files)
}

#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

/// Local tree with injected open failures and in-flight tracking
pub struct FlakySession {
    inner: LocalSession,
    failures: Mutex<HashMap<PathBuf, usize>>,
    opens: Mutex<HashMap<PathBuf, usize>>,
    gauge: Arc<Gauge>,
    hold: Duration,
    roots: Option<(PathBuf, PathBuf)>,
    orphans: Mutex<Vec<PathBuf>>,
}

impl FlakySession {
    pub fn new() -> Self {
        Self {
            inner: LocalSession::new(),
            failures: Mutex::new(HashMap::new()),
            opens: Mutex::new(HashMap::new()),
            gauge: Arc::new(Gauge::default()),
            hold: Duration::ZERO,
            roots: None,
            orphans: Mutex::new(Vec::new()),
        }
    }

    /// The next `times` opens of `path` fail
    pub fn fail(self, path: impl Into<PathBuf>, times: usize) -> Self {
        self.failures.lock().insert(path.into(), times);
        self
    }

    /// Keep each successfully opened file busy for `hold` before reading
    pub fn hold(mut self, hold: Duration) -> Self {
        self.hold = hold;
        self
    }

    /// At every open, record the source if its destination parent is missing
    pub fn check_parents(mut self, src_root: &Path, dst_root: &Path) -> Self {
        self.roots = Some((src_root.to_path_buf(), dst_root.to_path_buf()));
        self
    }

    /// Sources opened before their destination directory existed
    pub fn orphans(&self) -> Vec<PathBuf> {
        self.orphans.lock().clone()
    }

    pub fn opens(&self, path: &Path) -> usize {
        self.opens.lock().get(path).copied().unwrap_or(0)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.gauge.peak.load(Ordering::SeqCst)
    }
}

impl RemoteSession for FlakySession {
    fn open(&self, path: &Path) -> Result<Box<dyn RemoteFile>, SessionError> {
        *self.opens.lock().entry(path.to_path_buf()).or_insert(0) += 1;

        if let Some((ref src_root, ref dst_root)) = self.roots {
            let destination = compute_destination(path, src_root, dst_root);
            if !destination.parent().is_some_and(Path::is_dir) {
                self.orphans.lock().push(path.to_path_buf());
            }
        }

        if let Some(left) = self.failures.lock().get_mut(path) {
            if *left > 0 {
                *left -= 1;
                return Err(io::Error::new(io::ErrorKind::Other, "injected open failure").into());
            }
        }

        let file = File::open(path)?;
        let now = self.gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.peak.fetch_max(now, Ordering::SeqCst);
        let tracked = Tracked {
            file,
            gauge: Arc::clone(&self.gauge),
        };
        if !self.hold.is_zero() {
            std::thread::sleep(self.hold);
        }
        Ok(Box::new(tracked))
    }

    fn walk<'a>(&'a self, root: &Path) -> Walk<'a> {
        self.inner.walk(root)
    }
}

/// Counts as in flight from open until dropped
struct Tracked {
    file: File,
    gauge: Arc<Gauge>,
}

impl Read for Tracked {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl RemoteFile for Tracked {}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.gauge.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One step of a fixed walk listing
pub enum Listed {
    Dir(PathBuf),
    File(PathBuf),
    Unreadable(PathBuf),
}

/// Walks a fixed listing, including failed steps; files are read from disk
pub struct ListedSession {
    steps: Vec<Listed>,
}

impl ListedSession {
    pub fn new(steps: Vec<Listed>) -> Self {
        Self { steps }
    }
}

impl RemoteSession for ListedSession {
    fn open(&self, path: &Path) -> Result<Box<dyn RemoteFile>, SessionError> {
        LocalSession::new().open(path)
    }

    fn walk<'a>(&'a self, _root: &Path) -> Walk<'a> {
        Box::new(self.steps.iter().map(|step| match step {
            Listed::Dir(path) => Ok(RemoteEntry {
                path: path.clone(),
                kind: EntryKind::Directory,
            }),
            Listed::File(path) => Ok(RemoteEntry {
                path: path.clone(),
                kind: EntryKind::File,
            }),
            Listed::Unreadable(path) => Err(WalkError::new(
                path.clone(),
                io::Error::new(io::ErrorKind::PermissionDenied, "listing refused"),
            )),
        }))
    }
}

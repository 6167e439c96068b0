//! Remote session abstraction
//!
//! The mirror only needs two capabilities from a remote: open a file for
//! reading and walk a tree in pre-order. SFTP servers and local directories
//! both provide them.

pub mod local;
pub mod sftp;

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use local::LocalSession;
pub use sftp::{SftpConfig, SftpSession};

/// Entry type as reported by the walk (symlinks are not followed)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
    /// Symlinks, devices, sockets, fifos
    Other,
}

/// One item produced by a tree walk
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub path: PathBuf,
    pub kind: EntryKind,
}

/// Errors raised by a session while talking to the remote side
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("SSH handshake failed: {0}")]
    Handshake(#[source] ssh2::Error),

    #[error("authentication failed for user {user}: {reason}")]
    Auth { user: String, reason: String },

    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A single walk step failed; the walk itself keeps going
#[derive(Debug, Error)]
#[error("failed to walk {}: {source}", path.display())]
pub struct WalkError {
    pub path: PathBuf,
    #[source]
    pub source: SessionError,
}

impl WalkError {
    pub fn new(path: impl Into<PathBuf>, source: impl Into<SessionError>) -> Self {
        Self {
            path: path.into(),
            source: source.into(),
        }
    }
}

/// Lazy, finite, forward-only walk sequence
pub type Walk<'a> = Box<dyn Iterator<Item = Result<RemoteEntry, WalkError>> + 'a>;

/// Readable remote file handle
pub trait RemoteFile: Read + Send {
    /// Release the handle, reporting any error the remote raises on close
    fn close(self: Box<Self>) -> Result<(), SessionError> {
        Ok(())
    }
}

impl RemoteFile for std::fs::File {}

/// Source side of a mirror run, shared by every worker
pub trait RemoteSession: Send + Sync {
    /// Open a remote file for reading
    fn open(&self, path: &Path) -> Result<Box<dyn RemoteFile>, SessionError>;

    /// Walk the tree rooted at `root`, yielding each directory before its contents
    fn walk<'a>(&'a self, root: &Path) -> Walk<'a>;
}

//! Single-file download and local directory creation

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::logger::Logger;
use crate::session::{RemoteSession, SessionError};

/// One file to mirror: remote source, local destination
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferTask {
    pub source: PathBuf,
    pub destination: PathBuf,
}

impl TransferTask {
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("failed to open remote file {}: {source}", path.display())]
    OpenSource {
        path: PathBuf,
        #[source]
        source: SessionError,
    },

    #[error("failed to create local file {}: {source}", path.display())]
    CreateDestination {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("copy to {} failed after {copied} bytes: {source}", path.display())]
    Copy {
        path: PathBuf,
        copied: u64,
        #[source]
        source: io::Error,
    },

    #[error("transfer of {} panicked", path.display())]
    Panicked { path: PathBuf },
}

/// Download one remote file, creating or truncating the destination.
///
/// Reads are issued `packet_size` bytes at a time. A failed copy leaves a
/// partial destination file behind. Failing to release the remote handle
/// after a complete copy is reported through `logger.close_error` and does
/// not fail the transfer.
pub fn download_file(
    session: &dyn RemoteSession,
    task: &TransferTask,
    packet_size: usize,
    logger: &dyn Logger,
) -> Result<u64, TransferError> {
    let mut remote = session
        .open(&task.source)
        .map_err(|source| TransferError::OpenSource {
            path: task.source.clone(),
            source,
        })?;

    let local = File::create(&task.destination).map_err(|source| {
        TransferError::CreateDestination {
            path: task.destination.clone(),
            source,
        }
    })?;

    let mut writer = BufWriter::with_capacity(packet_size, local);
    let mut buffer = vec![0u8; packet_size.max(1)];
    let mut copied = 0u64;

    let result: io::Result<()> = (|| {
        loop {
            let bytes_read = match remote.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            writer.write_all(&buffer[..bytes_read])?;
            copied += bytes_read as u64;
        }
        // Buffered bytes that never reach the file are a failed copy, not a close error
        writer.flush()
    })();

    if let Err(source) = result {
        return Err(TransferError::Copy {
            path: task.destination.clone(),
            copied,
            source,
        });
    }

    if let Err(e) = remote.close() {
        logger.close_error(&task.source, &e.to_string());
    }

    Ok(copied)
}

/// Create `dir` and any missing ancestors; errors are logged, never returned
pub fn ensure_dir(dir: &Path, logger: &dyn Logger) {
    match fs::create_dir_all(dir) {
        Ok(()) => logger.dir_ready(dir),
        Err(e) => logger.dir_error(dir, &e.to_string()),
    }
}

//! sftp-mirror library
//!
//! Mirrors a remote directory tree to the local filesystem in two passes:
//! a concurrent initial pass, then one retry of whatever failed.

pub mod config;
pub mod failures;
pub mod log;
pub mod logger;
pub mod mirror;
pub mod pool;
pub mod session;
pub mod transfer;
pub mod url;

pub use config::{Args, MirrorConfig};
pub use mirror::{Mirror, MirrorOptions, MirrorReport, Pass, PassReport};
pub use session::{LocalSession, RemoteSession, SftpSession};

//! Command line, environment and TOML configuration
//!
//! Each setting resolves as: flag, then environment variable, then the
//! `--config` file, then the built-in default. A source given as an
//! `sftp://` URL supplies host, port, user and root, and wins over flags.

use clap::Parser;
use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::failures::DEFAULT_RETRY_CAPACITY;
use crate::logger::DEFAULT_LOG_LEVEL;
use crate::mirror::{MirrorOptions, DEFAULT_PACKET_SIZE, DEFAULT_WORKERS};
use crate::session::sftp::SftpAuth;
use crate::session::SftpConfig;
use crate::url::{parse_source, SourceSpec};

pub const DEFAULT_PORT: u16 = 22;
/// Largest accepted read size
pub const MAX_PACKET_SIZE: usize = 256 * 1024;

#[derive(Parser, Debug, Default, Clone)]
#[command(name = "sftp-mirror")]
#[command(about = "Mirror a remote SFTP directory tree to a local directory", long_about = None)]
#[command(version)]
pub struct Args {
    /// Remote root: a path, sftp://[user@]host[:port]/path, or file:///path
    #[arg(env = "SOURCE")]
    pub source: Option<String>,

    /// Local destination directory
    #[arg(env = "DESTINATION")]
    pub destination: Option<PathBuf>,

    /// SFTP server host
    #[arg(short = 'H', long, env = "HOST")]
    pub host: Option<String>,

    /// SFTP server port [default: 22]
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    #[arg(short, long, env = "USERNAME")]
    pub username: Option<String>,

    #[arg(long, env = "PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Private key file for public key authentication
    #[arg(short = 'i', long, env = "IDENTITY_FILE")]
    pub identity_file: Option<PathBuf>,

    #[arg(long, env = "IDENTITY_PASSPHRASE", hide_env_values = true)]
    pub identity_passphrase: Option<String>,

    /// Try the SSH agent before other methods
    #[arg(long)]
    pub agent: bool,

    /// Bytes requested per read [default: 32768]
    #[arg(long, env = "PACKET_SIZE")]
    pub packet_size: Option<usize>,

    /// Maximum concurrent downloads [default: 10]
    #[arg(short = 't', long, env = "WORKERS")]
    pub workers: Option<usize>,

    /// Failed downloads held for the retry pass [default: 100]
    #[arg(long, env = "RETRY_CAPACITY")]
    pub retry_capacity: Option<usize>,

    /// Seconds before a stalled SFTP call fails (0 = wait forever)
    #[arg(long, env = "IO_TIMEOUT")]
    pub io_timeout: Option<u64>,

    /// Seconds allowed for the TCP connect (0 = OS default)
    #[arg(long, env = "CONNECT_TIMEOUT")]
    pub connect_timeout: Option<u64>,

    /// TOML file with defaults for any of the above
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Append plain-text event lines to file
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Write JSONL per-file outcomes to file
    #[arg(long)]
    pub journal: Option<PathBuf>,

    /// Log filter for stderr output; RUST_LOG takes precedence
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Shorthand for --log-level debug
    #[arg(short, long)]
    pub verbose: bool,
}

/// Contents of the `--config` file
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub source: Option<String>,
    pub destination: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub identity_file: Option<PathBuf>,
    pub identity_passphrase: Option<String>,
    pub agent: Option<bool>,
    pub packet_size: Option<usize>,
    pub workers: Option<usize>,
    pub retry_capacity: Option<usize>,
    pub io_timeout_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub log_file: Option<PathBuf>,
    pub journal: Option<PathBuf>,
    pub log_level: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no source given (argument, SOURCE, or config file)")]
    MissingSource,
    #[error("no destination given (argument, DESTINATION, or config file)")]
    MissingDestination,
    #[error("no host given (--host, HOST, config file, or an sftp:// source)")]
    MissingHost,
    #[error("no username given (--username, USERNAME, config file, or an sftp:// source)")]
    MissingUsername,
    #[error("invalid {field} {value}: {reason}")]
    InvalidValue {
        field: &'static str,
        value: String,
        reason: &'static str,
    },
    #[error("invalid source url {0:?}")]
    InvalidUrl(String),
    #[error("failed to read config file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config file {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Where the source tree is read from
#[derive(Debug, Clone)]
pub enum Endpoint {
    Sftp(SftpConfig),
    /// A `file://` source; the tree is read from the local filesystem
    Local,
}

/// Validated settings for one run
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub endpoint: Endpoint,
    pub source_root: PathBuf,
    pub destination_root: PathBuf,
    pub workers: usize,
    pub retry_capacity: usize,
    pub packet_size: usize,
    pub log_file: Option<PathBuf>,
    pub journal: Option<PathBuf>,
    pub log_level: String,
}

impl MirrorConfig {
    /// Read the `--config` file if one is named, then resolve
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        let file = match args.config {
            Some(ref path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(args, file)
    }

    pub fn resolve(args: &Args, file: FileConfig) -> Result<Self, ConfigError> {
        let source = args
            .source
            .clone()
            .or_else(|| file.source.clone())
            .ok_or(ConfigError::MissingSource)?;
        let spec = parse_source(&source).ok_or_else(|| ConfigError::InvalidUrl(source.clone()))?;

        let destination_root = args
            .destination
            .clone()
            .or_else(|| file.destination.clone())
            .ok_or(ConfigError::MissingDestination)?;
        if destination_root.as_os_str().is_empty() {
            return Err(ConfigError::MissingDestination);
        }

        let (endpoint, source_root) = match spec {
            SourceSpec::Local(path) => (Endpoint::Local, path),
            SourceSpec::Sftp(url) => {
                let host = url.host;
                let port = url.port.or(args.port).or(file.port);
                let username = url
                    .username
                    .or_else(|| args.username.clone())
                    .or_else(|| file.username.clone());
                (
                    Endpoint::Sftp(sftp_config(args, &file, host, port, username)?),
                    url.path,
                )
            }
            SourceSpec::Path(path) => {
                let host = args
                    .host
                    .clone()
                    .or_else(|| file.host.clone())
                    .ok_or(ConfigError::MissingHost)?;
                let port = args.port.or(file.port);
                let username = args.username.clone().or_else(|| file.username.clone());
                (
                    Endpoint::Sftp(sftp_config(args, &file, host, port, username)?),
                    path,
                )
            }
        };
        if source_root.as_os_str().is_empty() {
            return Err(ConfigError::MissingSource);
        }

        let workers = args.workers.or(file.workers).unwrap_or(DEFAULT_WORKERS);
        if workers == 0 {
            return Err(invalid("workers", workers, "must be at least 1"));
        }
        let retry_capacity = args
            .retry_capacity
            .or(file.retry_capacity)
            .unwrap_or(DEFAULT_RETRY_CAPACITY);
        if retry_capacity == 0 {
            return Err(invalid("retry capacity", retry_capacity, "must be at least 1"));
        }
        let packet_size = args
            .packet_size
            .or(file.packet_size)
            .unwrap_or(DEFAULT_PACKET_SIZE);
        if !(1..=MAX_PACKET_SIZE).contains(&packet_size) {
            return Err(invalid("packet size", packet_size, "must be between 1 and 262144"));
        }

        let log_level = args
            .log_level
            .clone()
            .or_else(|| args.verbose.then(|| "debug".to_string()))
            .or(file.log_level)
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

        Ok(Self {
            endpoint,
            source_root,
            destination_root,
            workers,
            retry_capacity,
            packet_size,
            log_file: args.log_file.clone().or(file.log_file),
            journal: args.journal.clone().or(file.journal),
            log_level,
        })
    }

    pub fn mirror_options(&self) -> MirrorOptions {
        MirrorOptions {
            source_root: self.source_root.clone(),
            destination_root: self.destination_root.clone(),
            workers: self.workers,
            retry_capacity: self.retry_capacity,
            packet_size: self.packet_size,
        }
    }
}

fn sftp_config(
    args: &Args,
    file: &FileConfig,
    host: String,
    port: Option<u16>,
    username: Option<String>,
) -> Result<SftpConfig, ConfigError> {
    if host.is_empty() {
        return Err(ConfigError::MissingHost);
    }
    let username = username
        .filter(|u| !u.is_empty())
        .ok_or(ConfigError::MissingUsername)?;

    // An empty password is the same as none
    let password = args
        .password
        .clone()
        .or_else(|| file.password.clone())
        .filter(|p| !p.is_empty());
    let identity_file = args
        .identity_file
        .clone()
        .or_else(|| file.identity_file.clone());
    let identity_passphrase = args
        .identity_passphrase
        .clone()
        .or_else(|| file.identity_passphrase.clone())
        .filter(|p| !p.is_empty());
    // With nothing else configured, the agent is the only option left
    let use_agent = args.agent
        || file.agent.unwrap_or(false)
        || (password.is_none() && identity_file.is_none());

    Ok(SftpConfig {
        host,
        port: port.unwrap_or(DEFAULT_PORT),
        username,
        auth: SftpAuth {
            use_agent,
            identity_file,
            identity_passphrase,
            password,
        },
        connect_timeout: seconds(args.connect_timeout.or(file.connect_timeout_secs)),
        io_timeout: seconds(args.io_timeout.or(file.io_timeout_secs)),
    })
}

fn seconds(secs: Option<u64>) -> Option<Duration> {
    secs.filter(|&s| s > 0).map(Duration::from_secs)
}

fn invalid(field: &'static str, value: usize, reason: &'static str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        value: value.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn args(source: &str) -> Args {
        Args {
            source: Some(source.to_string()),
            destination: Some(PathBuf::from("/backup")),
            ..Default::default()
        }
    }

    fn sftp(config: &MirrorConfig) -> &SftpConfig {
        match config.endpoint {
            Endpoint::Sftp(ref s) => s,
            Endpoint::Local => panic!("expected an sftp endpoint"),
        }
    }

    #[test]
    fn clap_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn defaults_apply_to_a_plain_path() {
        let mut a = args("/upload");
        a.host = Some("files".into());
        a.username = Some("bob".into());
        a.password = Some("pw".into());

        let config = MirrorConfig::resolve(&a, FileConfig::default()).unwrap();
        let s = sftp(&config);
        assert_eq!(s.port, DEFAULT_PORT);
        assert!(!s.auth.use_agent);
        assert_eq!(s.io_timeout, None);
        assert_eq!(config.workers, DEFAULT_WORKERS);
        assert_eq!(config.retry_capacity, DEFAULT_RETRY_CAPACITY);
        assert_eq!(config.packet_size, DEFAULT_PACKET_SIZE);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.source_root, PathBuf::from("/upload"));
    }

    #[test]
    fn url_wins_over_flags() {
        let mut a = args("sftp://alice@remote:2200/data");
        a.host = Some("ignored".into());
        a.port = Some(22);
        a.username = Some("bob".into());

        let config = MirrorConfig::resolve(&a, FileConfig::default()).unwrap();
        let s = sftp(&config);
        assert_eq!(s.host, "remote");
        assert_eq!(s.port, 2200);
        assert_eq!(s.username, "alice");
        assert_eq!(config.source_root, PathBuf::from("/data"));
    }

    #[test]
    fn flags_win_over_file() {
        let mut a = args("/upload");
        a.workers = Some(3);
        a.username = Some("bob".into());
        let file = FileConfig {
            host: Some("from-file".into()),
            workers: Some(7),
            retry_capacity: Some(5),
            io_timeout_secs: Some(30),
            ..Default::default()
        };

        let config = MirrorConfig::resolve(&a, file).unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.retry_capacity, 5);
        let s = sftp(&config);
        assert_eq!(s.host, "from-file");
        assert_eq!(s.io_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn empty_password_falls_back_to_agent() {
        let mut a = args("sftp://bob@host/");
        a.password = Some(String::new());

        let config = MirrorConfig::resolve(&a, FileConfig::default()).unwrap();
        let s = sftp(&config);
        assert!(s.auth.password.is_none());
        assert!(s.auth.use_agent);
    }

    #[test]
    fn file_url_needs_no_host() {
        let config =
            MirrorConfig::resolve(&args("file:///srv/tree"), FileConfig::default()).unwrap();
        assert!(matches!(config.endpoint, Endpoint::Local));
        assert_eq!(config.source_root, PathBuf::from("/srv/tree"));
    }

    #[test]
    fn missing_values_are_reported() {
        let err = MirrorConfig::resolve(&Args::default(), FileConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingSource));

        let err = MirrorConfig::resolve(&args("/upload"), FileConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingHost));

        let mut a = args("/upload");
        a.host = Some("h".into());
        let err = MirrorConfig::resolve(&a, FileConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingUsername));

        let err = MirrorConfig::resolve(&args("sftp://h:99999/x"), FileConfig::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl(_)));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let mut a = args("file:///t");
        a.workers = Some(0);
        let err = MirrorConfig::resolve(&a, FileConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "workers", .. }));

        let mut a = args("file:///t");
        a.retry_capacity = Some(0);
        assert!(MirrorConfig::resolve(&a, FileConfig::default()).is_err());

        let mut a = args("file:///t");
        a.packet_size = Some(MAX_PACKET_SIZE + 1);
        assert!(MirrorConfig::resolve(&a, FileConfig::default()).is_err());
    }

    #[test]
    fn loads_toml_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("mirror.toml");
        std::fs::write(
            &path,
            concat!(
                "source = \"sftp://u@h/in\"\n",
                "destination = \"/out\"\n",
                "workers = 4\n",
                "log_level = \"warn\"\n",
            ),
        )
        .unwrap();

        let a = Args {
            config: Some(path),
            ..Default::default()
        };
        let config = MirrorConfig::load(&a).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.destination_root, PathBuf::from("/out"));
        assert_eq!(config.mirror_options().workers, 4);
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.toml");
        std::fs::write(&path, "wokers = 4\n").unwrap();

        let err = FileConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}

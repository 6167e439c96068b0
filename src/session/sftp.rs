//! SFTP session over libssh2
//!
//! One SSH session and one SFTP channel are shared by every worker. libssh2
//! serialises calls on a session, so concurrent transfers interleave their
//! packet requests over the same channel.

use ssh2::{FileStat, HashType, Session, Sftp};
use std::fmt;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

use super::{EntryKind, RemoteEntry, RemoteFile, RemoteSession, SessionError, Walk, WalkError};

/// Credentials tried in order: agent, identity file, password
#[derive(Clone, Default)]
pub struct SftpAuth {
    pub use_agent: bool,
    pub identity_file: Option<PathBuf>,
    pub identity_passphrase: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for SftpAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SftpAuth")
            .field("use_agent", &self.use_agent)
            .field("identity_file", &self.identity_file)
            .field("identity_passphrase", &self.identity_passphrase.as_ref().map(|_| "***"))
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Connection settings for an SFTP source
#[derive(Debug, Clone)]
pub struct SftpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SftpAuth,
    pub connect_timeout: Option<Duration>,
    /// Applied to every blocking libssh2 call; `None` waits forever
    pub io_timeout: Option<Duration>,
}

impl SftpConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub struct SftpSession {
    session: Session,
    sftp: Sftp,
    addr: String,
}

impl SftpSession {
    /// Dial, handshake, authenticate and open the SFTP subsystem
    pub fn connect(config: &SftpConfig) -> Result<Self, SessionError> {
        let addr = config.addr();
        info!(%addr, "connecting");

        let tcp = connect_tcp(&config.host, config.port, config.connect_timeout).map_err(
            |source| SessionError::Connect {
                addr: addr.clone(),
                source,
            },
        )?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(SessionError::Handshake)?;

        // Host keys are accepted without verification; log the fingerprint so it can be checked
        if let Some(hash) = session.host_key_hash(HashType::Sha256) {
            warn!(
                %addr,
                fingerprint = %fingerprint(hash),
                "host key accepted without verification"
            );
        }

        let method = authenticate(&session, config)?;
        info!(%addr, user = %config.username, method, "authenticated");

        if let Some(timeout) = config.io_timeout {
            let ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
            session.set_timeout(ms);
        }

        let sftp = session.sftp()?;
        Ok(Self {
            session,
            sftp,
            addr,
        })
    }

    /// Shut down the SFTP channel and the SSH connection; failures are logged only
    pub fn disconnect(mut self) {
        if let Err(e) = self.sftp.shutdown() {
            error!(addr = %self.addr, error = %e, "failed to close sftp client");
        }
        if let Err(e) = self.session.disconnect(None, "mirror complete", None) {
            error!(addr = %self.addr, error = %e, "failed to close connection");
        }
    }
}

impl RemoteSession for SftpSession {
    fn open(&self, path: &Path) -> Result<Box<dyn RemoteFile>, SessionError> {
        Ok(Box::new(self.sftp.open(path)?))
    }

    fn walk<'a>(&'a self, root: &Path) -> Walk<'a> {
        Box::new(SftpWalk::new(&self.sftp, root))
    }
}

impl RemoteFile for ssh2::File {
    fn close(mut self: Box<Self>) -> Result<(), SessionError> {
        ssh2::File::close(&mut *self)?;
        Ok(())
    }
}

fn connect_tcp(host: &str, port: u16, timeout: Option<Duration>) -> io::Result<TcpStream> {
    let Some(timeout) = timeout else {
        return TcpStream::connect((host, port));
    };

    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
    }))
}

fn authenticate(session: &Session, config: &SftpConfig) -> Result<&'static str, SessionError> {
    let user = config.username.as_str();
    let mut failures: Vec<String> = Vec::new();

    if config.auth.use_agent {
        match session.userauth_agent(user) {
            Ok(()) if session.authenticated() => return Ok("agent"),
            Ok(()) => failures.push("agent: not accepted".into()),
            Err(e) => failures.push(format!("agent: {e}")),
        }
    }

    if let Some(ref key) = config.auth.identity_file {
        let passphrase = config.auth.identity_passphrase.as_deref();
        match session.userauth_pubkey_file(user, None, key, passphrase) {
            Ok(()) if session.authenticated() => return Ok("publickey"),
            Ok(()) => failures.push(format!("publickey {}: not accepted", key.display())),
            Err(e) => failures.push(format!("publickey {}: {e}", key.display())),
        }
    }

    if let Some(ref password) = config.auth.password {
        match session.userauth_password(user, password) {
            Ok(()) if session.authenticated() => return Ok("password"),
            Ok(()) => failures.push("password: not accepted".into()),
            Err(e) => failures.push(format!("password: {e}")),
        }

        // Some servers only offer keyboard-interactive for passwords
        struct PasswordPrompt<'p>(&'p str);

        impl ssh2::KeyboardInteractivePrompt for PasswordPrompt<'_> {
            fn prompt(
                &mut self,
                _username: &str,
                _instructions: &str,
                prompts: &[ssh2::Prompt],
            ) -> Vec<String> {
                prompts.iter().map(|_| self.0.to_string()).collect()
            }
        }

        let mut prompt = PasswordPrompt(password);
        if session
            .userauth_keyboard_interactive(user, &mut prompt)
            .is_ok()
            && session.authenticated()
        {
            return Ok("keyboard-interactive");
        }
    }

    let reason = if failures.is_empty() {
        "no authentication method configured".to_string()
    } else {
        failures.join("; ")
    };
    Err(SessionError::Auth {
        user: user.to_string(),
        reason,
    })
}

fn fingerprint(hash: &[u8]) -> String {
    hash.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Classify an `lstat`/`readdir` result by its mode bits
fn entry_kind(stat: &FileStat) -> EntryKind {
    match stat.perm.unwrap_or(0) & 0o170000 {
        0o040000 => EntryKind::Directory,
        0o100000 => EntryKind::File,
        0 => {
            // Server sent no permissions; fall back to ssh2's helpers
            if stat.is_dir() {
                EntryKind::Directory
            } else if stat.is_file() {
                EntryKind::File
            } else {
                EntryKind::Other
            }
        }
        _ => EntryKind::Other,
    }
}

/// Directory listing calls the walk needs from the server
trait Lister {
    fn lstat(&self, path: &Path) -> Result<FileStat, SessionError>;
    fn readdir(&self, dir: &Path) -> Result<Vec<(PathBuf, FileStat)>, SessionError>;
}

impl Lister for Sftp {
    fn lstat(&self, path: &Path) -> Result<FileStat, SessionError> {
        Ok(Sftp::lstat(self, path)?)
    }

    fn readdir(&self, dir: &Path) -> Result<Vec<(PathBuf, FileStat)>, SessionError> {
        Ok(Sftp::readdir(self, dir)?)
    }
}

enum Step {
    Root(PathBuf),
    Listed(PathBuf, FileStat),
    Descend(PathBuf),
}

/// Pre-order walk: stat the root, then list each directory after yielding it
struct SftpWalk<'a, L> {
    lister: &'a L,
    stack: Vec<Step>,
}

impl<'a, L: Lister> SftpWalk<'a, L> {
    fn new(lister: &'a L, root: &Path) -> Self {
        Self {
            lister,
            stack: vec![Step::Root(root.to_path_buf())],
        }
    }
}

impl<L: Lister> Iterator for SftpWalk<'_, L> {
    type Item = Result<RemoteEntry, WalkError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (path, stat) = match self.stack.pop()? {
                Step::Root(path) => match self.lister.lstat(&path) {
                    Ok(stat) => (path, stat),
                    Err(e) => return Some(Err(WalkError::new(path, e))),
                },
                Step::Listed(path, stat) => (path, stat),
                Step::Descend(dir) => match self.lister.readdir(&dir) {
                    Ok(mut children) => {
                        // Reverse order so the smallest name is popped first
                        children.sort_by(|a, b| b.0.cmp(&a.0));
                        self.stack
                            .extend(children.into_iter().map(|(p, s)| Step::Listed(p, s)));
                        continue;
                    }
                    Err(e) => return Some(Err(WalkError::new(dir, e))),
                },
            };

            let kind = entry_kind(&stat);
            if kind == EntryKind::Directory {
                self.stack.push(Step::Descend(path.clone()));
            }
            return Some(Ok(RemoteEntry { path, kind }));
        }
    }
}

//! Source specifications: `sftp://[user@]host[:port]/path`, `file:///path`,
//! or a bare path

use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSource {
    pub host: String,
    /// `None` when the URL names no port
    pub port: Option<u16>,
    pub username: Option<String>,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
    Sftp(RemoteSource),
    Local(PathBuf),
    /// Neither URL form; host and credentials come from flags
    Path(PathBuf),
}

/// Parse a source argument. Returns `None` for a malformed URL.
pub fn parse_source(s: &str) -> Option<SourceSpec> {
    let s_trim = s.trim();
    let lower = s_trim.to_ascii_lowercase();

    if lower.starts_with("file://") {
        let rest = &s_trim["file://".len()..];
        if rest.is_empty() {
            return None;
        }
        return Some(SourceSpec::Local(PathBuf::from(rest)));
    }

    let Some(rest) = lower
        .starts_with("sftp://")
        .then(|| &s_trim["sftp://".len()..])
    else {
        return Some(SourceSpec::Path(PathBuf::from(s_trim)));
    };

    let (authority, p) = rest.split_once('/').unwrap_or((rest, ""));
    let (username, hp) = match authority.rsplit_once('@') {
        Some((u, hp)) if !u.is_empty() => (Some(u.to_string()), hp),
        Some(_) => return None,
        None => (None, authority),
    };

    let (host, port) = split_host_port(hp)?;
    if host.is_empty() {
        return None;
    }

    Some(SourceSpec::Sftp(RemoteSource {
        host,
        port,
        username,
        path: PathBuf::from(format!("/{}", p)),
    }))
}

fn split_host_port(hp: &str) -> Option<(String, Option<u16>)> {
    // Bracketed IPv6 literal
    if let Some(inner) = hp.strip_prefix('[') {
        let (host, tail) = inner.split_once(']')?;
        let port = match tail {
            "" => None,
            t => Some(t.strip_prefix(':')?.parse().ok()?),
        };
        return Some((host.to_string(), port));
    }
    match hp.split_once(':') {
        Some((h, pr)) => Some((h.to_string(), Some(pr.parse().ok()?))),
        None => Some((hp.to_string(), None)),
    }
}

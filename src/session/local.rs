use std::fs::File;
use std::io;
use std::path::Path;
use walkdir::WalkDir;

use super::{EntryKind, RemoteEntry, RemoteFile, RemoteSession, SessionError, Walk, WalkError};

/// Local directory tree served through the session interface (`file://` sources)
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalSession;

impl LocalSession {
    pub fn new() -> Self {
        Self
    }
}

impl RemoteSession for LocalSession {
    fn open(&self, path: &Path) -> Result<Box<dyn RemoteFile>, SessionError> {
        Ok(Box::new(File::open(path)?))
    }

    fn walk<'a>(&'a self, root: &Path) -> Walk<'a> {
        let root = root.to_path_buf();
        let walker = WalkDir::new(&root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .map(move |item| match item {
                Ok(entry) => {
                    let file_type = entry.file_type();
                    let kind = if file_type.is_dir() {
                        EntryKind::Directory
                    } else if file_type.is_file() {
                        EntryKind::File
                    } else {
                        EntryKind::Other
                    };
                    Ok(RemoteEntry {
                        path: entry.into_path(),
                        kind,
                    })
                }
                Err(err) => {
                    let path = err.path().unwrap_or(root.as_path()).to_path_buf();
                    Err(WalkError::new(path, io::Error::from(err)))
                }
            });
        Box::new(walker)
    }
}

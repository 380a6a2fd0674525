//! Error types for the file watcher.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors raised while setting up the watcher.
///
/// Both are fatal at startup; the distinction matters
/// because the watch-descriptor limit has a platform remediation the user can
/// apply, while a bad path is simply a configuration mistake.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("cannot watch {path}: {reason}")]
    BadPath { path: PathBuf, reason: String },

    #[error(
        "cannot watch {path}: the OS watch-descriptor limit is exhausted \
         (on Linux, raise fs.inotify.max_user_watches, e.g. to 500000)"
    )]
    WatchLimit { path: PathBuf },
}

impl WatchError {
    /// Classify a `notify` error raised for a specific path.
    pub fn from_notify(path: &Path, err: notify::Error) -> Self {
        match err.kind {
            notify::ErrorKind::MaxFilesWatch => WatchError::WatchLimit {
                path: path.to_path_buf(),
            },
            notify::ErrorKind::Io(ref io)
                if io.raw_os_error() == Some(28) || io.raw_os_error() == Some(24) =>
            {
                // ENOSPC / EMFILE both mean watch resources ran out
                WatchError::WatchLimit {
                    path: path.to_path_buf(),
                }
            }
            notify::ErrorKind::PathNotFound => WatchError::BadPath {
                path: path.to_path_buf(),
                reason: "path does not exist".to_string(),
            },
            other => WatchError::BadPath {
                path: path.to_path_buf(),
                reason: format!("{other:?}"),
            },
        }
    }
}

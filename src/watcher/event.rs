//! Normalized change events produced by the file watcher.

use std::path::PathBuf;

/// What happened to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Deleted,
    Modified,
    /// Path moved away. Carries no counterpart when the platform could not
    /// correlate the rename within one processing cycle.
    MovedFrom,
    /// Path moved into place. The counterpart, when present, is the source.
    MovedTo,
    AttributeChanged,
}

/// One normalized filesystem change, consumed exactly once by the mapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Absolute path the event refers to.
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub is_directory: bool,
    /// The other half of a correlated rename.
    pub move_counterpart: Option<PathBuf>,
}

impl ChangeEvent {
    pub fn new(path: PathBuf, kind: ChangeKind, is_directory: bool) -> Self {
        Self {
            path,
            kind,
            is_directory,
            move_counterpart: None,
        }
    }

    pub fn moved_to(from: PathBuf, to: PathBuf, is_directory: bool) -> Self {
        Self {
            path: to,
            kind: ChangeKind::MovedTo,
            is_directory,
            move_counterpart: Some(from),
        }
    }
}

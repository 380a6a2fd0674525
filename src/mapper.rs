//! Mapping from normalized change events to VCS action requests.

use std::path::PathBuf;

use crate::watcher::{ChangeEvent, ChangeKind};

/// The VCS operation a change calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Add,
    Remove,
    Modify,
    Move,
}

/// One request against the VCS: an action plus its path arguments
/// (two for Move: source then destination, one otherwise).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcsAction {
    pub kind: ActionKind,
    pub paths: Vec<PathBuf>,
}

impl VcsAction {
    fn single(kind: ActionKind, path: PathBuf) -> Self {
        Self {
            kind,
            paths: vec![path],
        }
    }

    /// The path this action affects, for pending-change bookkeeping.
    /// For moves that is the destination.
    pub fn affected_path(&self) -> &PathBuf {
        self.paths.last().expect("actions carry at least one path")
    }
}

/// Convert a change event into a VCS action request.
///
/// Directory events are forwarded only as moves (a whole-directory rename
/// must reach the VCS); every other directory-level event is dropped, since
/// the contained files produce their own events. A move destination without
/// a correlated source degrades to Add; a source without a destination
/// degrades to Remove (the path has left the tree).
pub fn map(event: ChangeEvent) -> Option<VcsAction> {
    let is_resolved_move = event.kind == ChangeKind::MovedTo && event.move_counterpart.is_some();
    if event.is_directory && !is_resolved_move {
        return None;
    }

    match event.kind {
        ChangeKind::Created => Some(VcsAction::single(ActionKind::Add, event.path)),
        ChangeKind::Deleted => Some(VcsAction::single(ActionKind::Remove, event.path)),
        ChangeKind::Modified | ChangeKind::AttributeChanged => {
            Some(VcsAction::single(ActionKind::Modify, event.path))
        }
        ChangeKind::MovedTo => match event.move_counterpart {
            Some(from) => Some(VcsAction {
                kind: ActionKind::Move,
                paths: vec![from, event.path],
            }),
            None => Some(VcsAction::single(ActionKind::Add, event.path)),
        },
        ChangeKind::MovedFrom => match event.move_counterpart {
            // the paired destination event already covers this rename
            Some(_) => None,
            None => Some(VcsAction::single(ActionKind::Remove, event.path)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn ev(path: &str, kind: ChangeKind, is_dir: bool) -> ChangeEvent {
        ChangeEvent::new(PathBuf::from(path), kind, is_dir)
    }

    #[test]
    fn file_events_map_to_their_actions() {
        let add = map(ev("/t/a.txt", ChangeKind::Created, false)).unwrap();
        assert_eq!(add.kind, ActionKind::Add);
        assert_eq!(add.paths, vec![PathBuf::from("/t/a.txt")]);

        let rm = map(ev("/t/a.txt", ChangeKind::Deleted, false)).unwrap();
        assert_eq!(rm.kind, ActionKind::Remove);

        let modify = map(ev("/t/a.txt", ChangeKind::Modified, false)).unwrap();
        assert_eq!(modify.kind, ActionKind::Modify);

        let attrib = map(ev("/t/a.txt", ChangeKind::AttributeChanged, false)).unwrap();
        assert_eq!(attrib.kind, ActionKind::Modify);
    }

    #[test]
    fn directory_events_are_dropped_except_moves() {
        assert!(map(ev("/t/dir", ChangeKind::Created, true)).is_none());
        assert!(map(ev("/t/dir", ChangeKind::Deleted, true)).is_none());
        assert!(map(ev("/t/dir", ChangeKind::Modified, true)).is_none());

        let moved = map(ChangeEvent::moved_to(
            PathBuf::from("/t/old"),
            PathBuf::from("/t/new"),
            true,
        ))
        .unwrap();
        assert_eq!(moved.kind, ActionKind::Move);
        assert_eq!(
            moved.paths,
            vec![PathBuf::from("/t/old"), PathBuf::from("/t/new")]
        );
        assert_eq!(moved.affected_path(), Path::new("/t/new"));
    }

    #[test]
    fn unresolved_move_destination_degrades_to_add() {
        let action = map(ev("/t/arrived.txt", ChangeKind::MovedTo, false)).unwrap();
        assert_eq!(action.kind, ActionKind::Add);
    }

    #[test]
    fn unresolved_move_source_degrades_to_remove() {
        let action = map(ev("/t/gone.txt", ChangeKind::MovedFrom, false)).unwrap();
        assert_eq!(action.kind, ActionKind::Remove);
    }

    #[test]
    fn unresolved_directory_move_destination_is_dropped() {
        // without a source there is nothing for the VCS to rename; the
        // directory's files arrive as their own creations
        assert!(map(ev("/t/dir", ChangeKind::MovedTo, true)).is_none());
    }
}

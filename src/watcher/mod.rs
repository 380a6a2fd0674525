//! File watching for the sync daemon.
//!
//! A single `notify::RecommendedWatcher` (inotify, FSEvents or
//! ReadDirectoryChangesW, selected once at startup) feeds a normalizing loop
//! that emits [`ChangeEvent`]s:
//!
//! ```text
//! notify backend -> raw event channel -> FileWatcher::run
//!     rename pairing, sanity filtering, suppression draining,
//!     auto-registration of new directories
//!         -> ChangeEvent channel -> ActionMapper
//! ```
//!
//! Directories are registered individually (`RecursiveMode::NonRecursive`) so
//! excluded subtrees never consume watch descriptors; newly created
//! directories are registered on the fly and their pre-existing entries are
//! rescanned so nothing written before the watch existed is lost.

mod error;
mod event;
mod filter;

pub use error::WatchError;
pub use event::{ChangeEvent, ChangeKind};
pub use filter::PathFilter;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};
use walkdir::WalkDir;

use crate::sync::SyncState;
use crate::{debug_event, log_event};

/// How long an uncorrelated rename source is held before it is flushed as an
/// unpaired move. One processing cycle.
const RENAME_FLUSH: Duration = Duration::from_millis(200);

/// Produces a live, deduplicated, per-path-ordered stream of [`ChangeEvent`]s
/// for a directory tree.
pub struct FileWatcher {
    root: PathBuf,
    filter: Arc<PathFilter>,
    state: Arc<SyncState>,
    watcher: notify::RecommendedWatcher,
    raw_rx: mpsc::Receiver<notify::Result<Event>>,
    out_tx: mpsc::Sender<ChangeEvent>,
    /// Directories currently holding a watch descriptor.
    watched_dirs: HashSet<PathBuf>,
    /// Rename source waiting for its destination half.
    pending_move: Option<PathBuf>,
}

impl FileWatcher {
    /// Set up watches for `root` and every non-excluded subdirectory.
    ///
    /// Fails when the root is missing, not a directory, or the platform's
    /// watch quota runs out during registration.
    pub fn new(
        root: &Path,
        filter: Arc<PathFilter>,
        state: Arc<SyncState>,
    ) -> Result<(Self, mpsc::Receiver<ChangeEvent>), WatchError> {
        if !root.exists() {
            return Err(WatchError::BadPath {
                path: root.to_path_buf(),
                reason: "path does not exist".to_string(),
            });
        }
        if !root.is_dir() {
            return Err(WatchError::BadPath {
                path: root.to_path_buf(),
                reason: "not a directory".to_string(),
            });
        }

        let (raw_tx, raw_rx) = mpsc::channel(1024);
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = raw_tx.blocking_send(res);
        })
        .map_err(|e| WatchError::from_notify(root, e))?;

        let (out_tx, out_rx) = mpsc::channel(256);
        let mut this = Self {
            root: root.to_path_buf(),
            filter,
            state,
            watcher,
            raw_rx,
            out_tx,
            watched_dirs: HashSet::new(),
            pending_move: None,
        };

        // registration failures at startup are fatal, quota exhaustion included
        for dir in this.subdirectories(root) {
            this.watch_dir(&dir)?;
        }
        log_event!(
            "watcher",
            "watching",
            "{} directories under {}",
            this.watched_dirs.len(),
            root.display()
        );

        Ok((this, out_rx))
    }

    /// Non-excluded directories of a subtree, the given one included.
    fn subdirectories(&self, base: &Path) -> Vec<PathBuf> {
        WalkDir::new(base)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !self.filter.is_excluded(e.path()))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
            .map(|e| e.into_path())
            .collect()
    }

    fn watch_dir(&mut self, dir: &Path) -> Result<(), WatchError> {
        if self.watched_dirs.contains(dir) {
            return Ok(());
        }
        self.watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| WatchError::from_notify(dir, e))?;
        self.watched_dirs.insert(dir.to_path_buf());
        debug_event!("watcher", "registered", "{}", dir.display());
        Ok(())
    }

    fn unwatch_dir(&mut self, dir: &Path) {
        if self.watched_dirs.remove(dir) {
            // the kernel drops watches on deleted paths by itself
            let _ = self.watcher.unwatch(dir);
            debug_event!("watcher", "deregistered", "{}", dir.display());
        }
    }

    /// Drain raw events forever, forwarding normalized changes.
    ///
    /// Returns when the event source or the consumer goes away.
    pub async fn run(mut self) {
        log_event!("watcher", "started", "{}", self.root.display());
        loop {
            tokio::select! {
                raw = self.raw_rx.recv() => {
                    match raw {
                        Some(Ok(event)) => {
                            if !self.handle_raw(event).await {
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::error!("[watcher] event error: {e}");
                        }
                        None => {
                            debug_event!("watcher", "event source closed");
                            return;
                        }
                    }
                }
                // a rename source with no destination half degrades to a
                // plain removal after one cycle
                _ = sleep(RENAME_FLUSH), if self.pending_move.is_some() => {
                    if let Some(ev) = self.take_pending_move()
                        && !self.forward(ev).await
                    {
                        return;
                    }
                }
            }
        }
    }

    /// Translate and forward one raw notify event. Returns false when the
    /// downstream consumer is gone.
    async fn handle_raw(&mut self, event: Event) -> bool {
        for ev in self.translate(event) {
            // files can land in a new directory before its watch exists;
            // rescan the subtree and synthesize their creations
            let rescan = ev.is_directory
                && matches!(ev.kind, ChangeKind::Created | ChangeKind::MovedTo)
                && !self.filter.is_excluded(&ev.path);
            let subtree = rescan.then(|| ev.path.clone());

            // topology upkeep happens even while suppressed so the watch set
            // stays current for the post-pull rescan
            self.track_directories(&ev);
            if !self.forward(ev).await {
                return false;
            }

            if let Some(base) = subtree {
                for file in self.files_under(&base) {
                    let synthesized = ChangeEvent::new(file, ChangeKind::Created, false);
                    if !self.forward(synthesized).await {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Non-excluded regular files of a subtree.
    fn files_under(&self, base: &Path) -> Vec<PathBuf> {
        WalkDir::new(base)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !self.filter.is_excluded(e.path()))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect()
    }

    /// Apply suppression, sanity checks and the ignore filter, then emit.
    async fn forward(&mut self, ev: ChangeEvent) -> bool {
        if self.state.suppressed() {
            debug_event!(
                "watcher",
                "suppressed",
                "{:?} {} (remote pull in flight)",
                ev.kind,
                ev.path.display()
            );
            return true;
        }

        // a writer can outrun the event queue: deletions of re-created paths
        // and creations of already-gone paths are editor save artifacts
        match ev.kind {
            ChangeKind::Deleted if ev.path.exists() => {
                debug_event!("watcher", "stale delete", "{}", ev.path.display());
                return true;
            }
            ChangeKind::Created | ChangeKind::Modified if !ev.path.exists() => {
                debug_event!("watcher", "stale create", "{}", ev.path.display());
                return true;
            }
            _ => {}
        }

        if self.filter.is_ignored(&ev.path) {
            debug_event!("watcher", "ignored", "{}", ev.path.display());
            return true;
        }

        self.out_tx.send(ev).await.is_ok()
    }

    /// Keep the registered directory set in step with the tree.
    fn track_directories(&mut self, ev: &ChangeEvent) {
        if !ev.is_directory {
            return;
        }
        match ev.kind {
            ChangeKind::Created | ChangeKind::MovedTo => {
                if !self.filter.is_excluded(&ev.path) {
                    for dir in self.subdirectories(&ev.path.clone()) {
                        if let Err(e) = self.watch_dir(&dir) {
                            tracing::warn!("[watcher] cannot register {}: {e}", dir.display());
                        }
                    }
                }
                if let Some(from) = &ev.move_counterpart {
                    let from = from.clone();
                    self.unwatch_dir(&from);
                }
            }
            ChangeKind::Deleted | ChangeKind::MovedFrom => {
                let path = ev.path.clone();
                self.unwatch_dir(&path);
            }
            _ => {}
        }
    }

    /// Normalize a raw notify event into zero or more change events,
    /// correlating rename halves within one processing cycle.
    fn translate(&mut self, event: Event) -> Vec<ChangeEvent> {
        let mut out = Vec::new();

        // any non-rename traffic means the pending source will not find its
        // destination in this cycle
        let is_rename_half = matches!(
            event.kind,
            EventKind::Modify(ModifyKind::Name(RenameMode::To))
                | EventKind::Modify(ModifyKind::Name(RenameMode::Both))
        );
        if !is_rename_half && let Some(ev) = self.take_pending_move() {
            out.push(ev);
        }

        match event.kind {
            EventKind::Create(_) => {
                for path in event.paths {
                    let is_dir = path.is_dir();
                    out.push(ChangeEvent::new(path, ChangeKind::Created, is_dir));
                }
            }
            EventKind::Remove(_) => {
                for path in event.paths {
                    let was_dir = self.watched_dirs.contains(&path);
                    out.push(ChangeEvent::new(path, ChangeKind::Deleted, was_dir));
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                if event.paths.len() == 2 {
                    let mut paths = event.paths;
                    let to = paths.pop().expect("two paths");
                    let from = paths.pop().expect("two paths");
                    let is_dir = to.is_dir();
                    out.push(ChangeEvent::moved_to(from, to, is_dir));
                } else {
                    for path in event.paths {
                        let is_dir = path.is_dir();
                        out.push(ChangeEvent::new(path, ChangeKind::MovedTo, is_dir));
                    }
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                if let Some(path) = event.paths.into_iter().next() {
                    self.pending_move = Some(path);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                if let Some(to) = event.paths.into_iter().next() {
                    let is_dir = to.is_dir();
                    match self.pending_move.take() {
                        Some(from) => out.push(ChangeEvent::moved_to(from, to, is_dir)),
                        // correlation unavailable: destination degrades to a
                        // plain creation, never dropped
                        None => out.push(ChangeEvent::new(to, ChangeKind::MovedTo, is_dir)),
                    }
                }
            }
            EventKind::Modify(ModifyKind::Metadata(_)) => {
                for path in event.paths {
                    let is_dir = path.is_dir();
                    out.push(ChangeEvent::new(path, ChangeKind::AttributeChanged, is_dir));
                }
            }
            EventKind::Modify(_) => {
                for path in event.paths {
                    let is_dir = path.is_dir();
                    out.push(ChangeEvent::new(path, ChangeKind::Modified, is_dir));
                }
            }
            EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
        }

        out
    }

    /// Flush an uncorrelated rename source as an unpaired MovedFrom.
    fn take_pending_move(&mut self) -> Option<ChangeEvent> {
        let path = self.pending_move.take()?;
        let was_dir = self.watched_dirs.contains(&path);
        debug_event!("watcher", "unpaired move source", "{}", path.display());
        Some(ChangeEvent::new(path, ChangeKind::MovedFrom, was_dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn watcher_for(dir: &Path) -> (FileWatcher, mpsc::Receiver<ChangeEvent>) {
        let filter = Arc::new(PathFilter::from_patterns(
            dir,
            &["*.log"],
            &[".git".to_string()],
        ));
        let state = Arc::new(SyncState::new());
        FileWatcher::new(dir, filter, state).unwrap()
    }

    #[tokio::test]
    async fn setup_rejects_missing_root() {
        let filter = Arc::new(PathFilter::from_patterns(Path::new("/nope"), &[], &[]));
        let state = Arc::new(SyncState::new());
        let err = FileWatcher::new(Path::new("/nonexistent-autosync-root"), filter, state)
            .err()
            .unwrap();
        assert!(matches!(err, WatchError::BadPath { .. }));
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn setup_rejects_file_root() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("plain.txt");
        std::fs::write(&file, b"x").unwrap();

        let filter = Arc::new(PathFilter::from_patterns(dir.path(), &[], &[]));
        let state = Arc::new(SyncState::new());
        let err = FileWatcher::new(&file, filter, state).err().unwrap();
        assert!(matches!(err, WatchError::BadPath { .. }));
        assert!(err.to_string().contains("not a directory"));
    }

    #[tokio::test]
    async fn excluded_subtrees_get_no_watch() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".git/objects")).unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();

        let (watcher, _rx) = watcher_for(dir.path());
        assert!(
            watcher
                .watched_dirs
                .iter()
                .all(|d| !d.components().any(|c| c.as_os_str() == ".git"))
        );
        assert!(watcher.watched_dirs.contains(&dir.path().join("src")));
        assert!(watcher.watched_dirs.contains(&dir.path().to_path_buf()));
    }

    #[tokio::test]
    async fn rename_halves_pair_within_a_cycle() {
        let dir = TempDir::new().unwrap();
        let (mut watcher, _rx) = watcher_for(dir.path());

        let from = dir.path().join("old.txt");
        let to = dir.path().join("new.txt");
        std::fs::write(&to, b"x").unwrap();

        let half = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From)))
            .add_path(from.clone());
        assert!(watcher.translate(half).is_empty());

        let other =
            Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To))).add_path(to.clone());
        let events = watcher.translate(other);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::MovedTo);
        assert_eq!(events[0].path, to);
        assert_eq!(events[0].move_counterpart.as_deref(), Some(from.as_path()));
    }

    #[tokio::test]
    async fn lone_destination_becomes_plain_move_without_counterpart() {
        let dir = TempDir::new().unwrap();
        let (mut watcher, _rx) = watcher_for(dir.path());

        let to = dir.path().join("arrived.txt");
        std::fs::write(&to, b"x").unwrap();

        let ev =
            Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To))).add_path(to.clone());
        let events = watcher.translate(ev);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::MovedTo);
        assert!(events[0].move_counterpart.is_none());
    }

    #[tokio::test]
    async fn stale_rename_source_flushes_on_unrelated_traffic() {
        let dir = TempDir::new().unwrap();
        let (mut watcher, _rx) = watcher_for(dir.path());

        let gone = dir.path().join("gone.txt");
        let half = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From)))
            .add_path(gone.clone());
        watcher.translate(half);

        let created = dir.path().join("other.txt");
        std::fs::write(&created, b"x").unwrap();
        let unrelated = Event::new(EventKind::Create(notify::event::CreateKind::File))
            .add_path(created.clone());
        let events = watcher.translate(unrelated);

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, ChangeKind::MovedFrom);
        assert_eq!(events[0].path, gone);
        assert_eq!(events[1].kind, ChangeKind::Created);
    }

    #[tokio::test]
    async fn suppression_drains_without_forwarding() {
        let dir = TempDir::new().unwrap();
        let (mut watcher, mut rx) = watcher_for(dir.path());

        let path = dir.path().join("file.txt");
        std::fs::write(&path, b"x").unwrap();

        watcher.state.set_suppressed(true);
        let forwarded = watcher
            .forward(ChangeEvent::new(path.clone(), ChangeKind::Modified, false))
            .await;
        assert!(forwarded);
        assert!(rx.try_recv().is_err());

        watcher.state.set_suppressed(false);
        assert!(
            watcher
                .forward(ChangeEvent::new(path, ChangeKind::Modified, false))
                .await
        );
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn stale_delete_and_create_are_dropped() {
        let dir = TempDir::new().unwrap();
        let (mut watcher, mut rx) = watcher_for(dir.path());

        // deletion of a path that was immediately re-created
        let recreated = dir.path().join("atomic.txt");
        std::fs::write(&recreated, b"x").unwrap();
        watcher
            .forward(ChangeEvent::new(
                recreated.clone(),
                ChangeKind::Deleted,
                false,
            ))
            .await;
        assert!(rx.try_recv().is_err());

        // creation of a path that is already gone again
        let vanished = dir.path().join("temp.txt");
        watcher
            .forward(ChangeEvent::new(vanished, ChangeKind::Created, false))
            .await;
        assert!(rx.try_recv().is_err());

        // a genuine delete still goes through
        std::fs::remove_file(&recreated).unwrap();
        watcher
            .forward(ChangeEvent::new(recreated, ChangeKind::Deleted, false))
            .await;
        assert_eq!(rx.try_recv().unwrap().kind, ChangeKind::Deleted);
    }

    #[tokio::test]
    async fn ignored_paths_never_reach_the_consumer() {
        let dir = TempDir::new().unwrap();
        let (mut watcher, mut rx) = watcher_for(dir.path());

        let log = dir.path().join("noise.log");
        std::fs::write(&log, b"x").unwrap();
        watcher
            .forward(ChangeEvent::new(log, ChangeKind::Created, false))
            .await;
        assert!(rx.try_recv().is_err());
    }
}

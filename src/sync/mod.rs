//! Synchronization coordination.
//!
//! [`SyncCoordinator`] serializes every repository-mutating operation under
//! one `tokio::sync::Mutex`: local commit sequences and remote pull sequences
//! exclude each other through that single lock. The conservative pull
//! strategy additionally raises a suppression flag ([`SyncState`]) so the
//! watcher discards the events the pull itself generates, then runs a full
//! startup reconciliation to recover anything real that happened during the
//! window.
//!
//! Command failures are never fatal here. A failed step is logged and the
//! state advances as if it completed; the working tree still holds the
//! unpushed changes, so the next cycle retries naturally.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;

use crate::mapper::{ActionKind, VcsAction};
use crate::peer::{InstanceId, PeerMessage, PeerNotifier};
use crate::scheduler::PushTimer;
use crate::vcs::{VcsCommands, VcsError};
use crate::{debug_event, log_event};

/// Shared flags between the coordinator and the watcher.
///
/// `suppressed` is true only while a conservative pull is in flight; the
/// watcher keeps draining the OS queue but discards everything it reads.
pub struct SyncState {
    suppress: AtomicBool,
}

impl SyncState {
    pub fn new() -> Self {
        Self {
            suppress: AtomicBool::new(false),
        }
    }

    pub fn suppressed(&self) -> bool {
        self.suppress.load(Ordering::SeqCst)
    }

    pub fn set_suppressed(&self, value: bool) {
        self.suppress.store(value, Ordering::SeqCst);
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything that may only be touched under the coordination lock: the
/// command runner and the log of committed-but-unpushed paths.
struct RepoHandle {
    vcs: VcsCommands,
    pending: HashMap<PathBuf, ActionKind>,
}

pub struct SyncCoordinator {
    state: Arc<SyncState>,
    repo: Mutex<RepoHandle>,
    timer: PushTimer,
    identity: InstanceId,
    notifier: Arc<dyn PeerNotifier>,
}

impl SyncCoordinator {
    pub fn new(
        vcs: VcsCommands,
        timer: PushTimer,
        state: Arc<SyncState>,
        identity: InstanceId,
        notifier: Arc<dyn PeerNotifier>,
    ) -> Self {
        Self {
            state,
            repo: Mutex::new(RepoHandle {
                vcs,
                pending: HashMap::new(),
            }),
            timer,
            identity,
            notifier,
        }
    }

    pub fn state(&self) -> Arc<SyncState> {
        Arc::clone(&self.state)
    }

    pub fn timer(&self) -> &PushTimer {
        &self.timer
    }

    pub fn identity(&self) -> &InstanceId {
        &self.identity
    }

    /// Committed-but-unpushed path count.
    pub async fn pending_changes(&self) -> usize {
        self.repo.lock().await.pending.len()
    }

    /// Mirrors one local change into the repository. Runs the action's
    /// command, then the status check; when the tree is dirty, commits and
    /// arms (or rewinds) the push timer. A clean status never touches the
    /// timer, so no-op changes cannot postpone a pending push.
    pub async fn enqueue_local_change(&self, action: VcsAction) {
        if self.state.suppressed() {
            debug_event!(
                "sync",
                "suppressed",
                "dropping {:?} for {}",
                action.kind,
                action.affected_path().display()
            );
            return;
        }

        log_event!(
            "sync",
            "local change",
            "{:?} {}",
            action.kind,
            action.affected_path().display()
        );

        let mut repo = self.repo.lock().await;
        if let Err(err) = Self::run_action_locked(&mut repo, &action).await {
            log_vcs_error("action", &err);
        }
        self.post_action_locked(&mut repo, Some(&action)).await;
    }

    /// Flush consumer: pull before push (conservative), push, clear the
    /// pending log, announce the remote head to peers. Invoked on timer
    /// expiry; any failure leaves retry to the next local change.
    pub async fn push(&self) {
        self.protected_pull().await;

        log_event!("sync", "push", "pushing local commits");
        let remote = {
            let mut repo = self.repo.lock().await;
            if let Err(err) = repo.vcs.push().await {
                log_vcs_error("push", &err);
            }
            repo.pending.clear();
            repo.vcs.remote_url().await
        };

        match remote {
            Ok(url) => {
                let message = PeerMessage {
                    origin: self.identity.clone(),
                    remote_ref: url,
                };
                if let Err(err) = self.notifier.announce(message).await {
                    log_event!("peer", "announce failed", "{}", err);
                }
            }
            Err(err) => {
                log_vcs_error("remote-url", &err);
                log_event!("peer", "announce skipped", "remote url unknown");
            }
        }
    }

    /// Conservative protected pull: suppress local event handling, pull under
    /// the lock, unsuppress, then reconcile via `startup` to pick up real
    /// changes that arrived during the suppression window.
    pub async fn protected_pull(&self) {
        log_event!("sync", "pull", "pulling from remote");
        self.state.set_suppressed(true);
        {
            let mut repo = self.repo.lock().await;
            if let Err(err) = repo.vcs.pull().await {
                log_vcs_error("pull", &err);
            }
        }
        self.state.set_suppressed(false);
        self.startup().await;
    }

    /// Startup reconciliation: run the configured startup command (typically
    /// a recursive add), then commit whatever the status check finds. Invoked
    /// once at boot and after every conservative pull.
    pub async fn startup(&self) {
        debug_event!("sync", "startup", "reconciling working tree");
        let mut repo = self.repo.lock().await;
        if let Err(err) = repo.vcs.startup().await {
            log_vcs_error("startup", &err);
        }
        self.post_action_locked(&mut repo, None).await;
    }

    /// Reacts to a peer's push announcement. The echo of this instance's own
    /// announcement is recognized by identity and ignored.
    pub async fn handle_peer_message(&self, message: PeerMessage) {
        if message.origin == self.identity {
            debug_event!("peer", "loopback", "ignoring own announcement");
            return;
        }
        log_event!(
            "peer",
            "pull requested",
            "{} pushed {}",
            message.origin,
            message.remote_ref
        );
        self.protected_pull().await;
    }

    async fn run_action_locked(repo: &mut RepoHandle, action: &VcsAction) -> Result<(), VcsError> {
        match (&action.kind, action.paths.as_slice()) {
            (ActionKind::Add, [path]) => repo.vcs.add(path).await,
            (ActionKind::Remove, [path]) => repo.vcs.remove(path).await,
            (ActionKind::Modify, [path]) => repo.vcs.modify(path).await,
            (ActionKind::Move, [from, to]) => repo.vcs.mv(from, to).await,
            _ => {
                debug_event!("sync", "malformed action", "{:?}", action);
                Ok(())
            }
        }
    }

    /// Shared status-check/commit tail. Dirty tree: commit, record the path
    /// (when there is one), arm the timer. Clean tree: nothing.
    async fn post_action_locked(&self, repo: &mut RepoHandle, action: Option<&VcsAction>) {
        let clean = match repo.vcs.status_clean().await {
            Ok(clean) => clean,
            Err(err) => {
                log_vcs_error("status", &err);
                return;
            }
        };
        if clean {
            debug_event!("sync", "status", "nothing to commit");
            return;
        }

        if let Err(err) = repo.vcs.commit().await {
            log_vcs_error("commit", &err);
        }
        if let Some(action) = action {
            repo.pending
                .insert(action.affected_path().clone(), action.kind);
        }
        self.timer.arm();
    }
}

fn log_vcs_error(op: &str, err: &VcsError) {
    log_event!("vcs", "error", "{} failed: {}", op, err);
}

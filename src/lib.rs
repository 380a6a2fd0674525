pub mod config;
pub mod logging;
pub mod mapper;
pub mod peer;
pub mod scheduler;
pub mod sync;
pub mod vcs;
pub mod watcher;

pub use config::{ConfigError, PullLock, Settings};
pub use mapper::{ActionKind, VcsAction};
pub use peer::{
    ChannelPeerNotifier, InstanceId, NullPeerNotifier, PeerError, PeerMessage, PeerNotifier,
};
pub use scheduler::PushTimer;
pub use sync::{SyncCoordinator, SyncState};
pub use vcs::{VcsCommands, VcsError};
pub use watcher::{ChangeEvent, ChangeKind, FileWatcher, PathFilter, WatchError};

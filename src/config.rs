//! Layered configuration for the sync daemon.
//!
//! Sources, lowest to highest precedence:
//! - built-in defaults
//! - TOML configuration file
//! - environment variables prefixed with `AUTOSYNC_`, using double
//!   underscores for nesting (`AUTOSYNC_VCS__PUSH="git push origin"` sets
//!   `vcs.push`)

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default config file name, searched in the current directory and `$HOME`.
pub const CONFIG_FILE: &str = ".autosync.toml";

/// Errors that make the configuration unusable. All of these are fatal at
/// startup only.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error(
        "the '{strategy}' pull-lock strategy is not supported; \
         use 'conservative' (event replay for optimistic locking is not implemented)"
    )]
    UnsupportedStrategy { strategy: String },

    #[error("configuration file already exists at {path} (use --force to overwrite)")]
    AlreadyExists { path: PathBuf },

    #[error("cannot write configuration to {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// How local change detection behaves while a remote pull is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PullLock {
    /// Discard all local events during the pull, then re-run the startup
    /// reconciliation to pick up anything that happened in the window.
    Conservative,
    /// Replay suppressed events after the pull. Accepted by the parser so the
    /// rejection can carry a useful message, but refused by `validate`.
    Optimistic,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Schema version of this configuration.
    #[serde(default = "default_version")]
    pub version: u32,

    /// Directory tree to watch. Must be (inside) a DVCS checkout.
    #[serde(default = "default_path")]
    pub path: PathBuf,

    /// Optional pidfile, written at daemon start and removed on shutdown.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pidfile: Option<PathBuf>,

    /// Ignore file read from the watched tree, one glob pattern per line.
    /// Typically the VCS's own ignore file.
    #[serde(default = "default_ignore_file")]
    pub ignore_file: String,

    /// Path prefixes excluded from watch registration entirely, relative to
    /// the watched tree. These never consume watch descriptors.
    #[serde(default = "default_exclude_paths")]
    pub exclude_paths: Vec<String>,

    /// Quiet period in seconds before batched changes are pushed.
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,

    /// Countdown tick resolution in seconds.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,

    /// Pull locking strategy.
    #[serde(default = "default_pull_lock")]
    pub pull_lock: PullLock,

    /// DVCS command templates.
    #[serde(default)]
    pub vcs: VcsConfig,

    /// Peer notification settings.
    #[serde(default)]
    pub peer: PeerConfig,

    /// Logging levels.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Shell command templates for the underlying DVCS.
///
/// Templates may span multiple lines; each line runs as one command with
/// positional `%s` placeholders substituted by path arguments. The status
/// command is the one exception: it runs through the shell (it is
/// conventionally a pipeline) and its exit code 0 means "nothing to commit".
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct VcsConfig {
    #[serde(default = "default_status")]
    pub status: String,

    /// Run once at startup (and after every conservative pull) to stage any
    /// changes made while the daemon was not listening.
    #[serde(default = "default_startup")]
    pub startup: String,

    #[serde(default = "default_add")]
    pub add: String,

    #[serde(default = "default_remove")]
    pub remove: String,

    #[serde(default = "default_modify")]
    pub modify: String,

    /// Takes two path arguments: source, then destination.
    #[serde(rename = "move", default = "default_move")]
    pub mv: String,

    #[serde(default = "default_commit")]
    pub commit: String,

    #[serde(default = "default_push")]
    pub push: String,

    #[serde(default = "default_pull")]
    pub pull: String,

    /// Prints the remote URL announced to peers after a push.
    #[serde(default = "default_remote_url")]
    pub remote_url: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct PeerConfig {
    /// Stable identity of this instance, used for loopback suppression.
    /// Generated from hostname and pid when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,

    /// Peer identities notified after every push.
    #[serde(default)]
    pub notify: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Default level filter: error, warn, info, debug or trace.
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-component overrides.
    #[serde(default)]
    pub components: HashMap<String, String>,
}

fn default_version() -> u32 {
    1
}
fn default_path() -> PathBuf {
    PathBuf::from(".")
}
fn default_ignore_file() -> String {
    ".gitignore".to_string()
}
fn default_exclude_paths() -> Vec<String> {
    vec![".git".to_string()]
}
fn default_debounce_secs() -> u64 {
    5
}
fn default_tick_secs() -> u64 {
    1
}
fn default_pull_lock() -> PullLock {
    PullLock::Conservative
}
fn default_status() -> String {
    // exits 0 when there is nothing to commit
    "git status | grep -iq \"nothing to commit\"".to_string()
}
fn default_startup() -> String {
    "git add -A .".to_string()
}
fn default_add() -> String {
    "git add %s".to_string()
}
fn default_remove() -> String {
    "git rm -r --ignore-unmatch %s".to_string()
}
fn default_modify() -> String {
    "git add %s".to_string()
}
fn default_move() -> String {
    "git mv %s %s".to_string()
}
fn default_commit() -> String {
    "git commit -m autocommit".to_string()
}
fn default_push() -> String {
    "git push".to_string()
}
fn default_pull() -> String {
    "git pull".to_string()
}
fn default_remote_url() -> String {
    "git config --get remote.origin.url".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            path: default_path(),
            pidfile: None,
            ignore_file: default_ignore_file(),
            exclude_paths: default_exclude_paths(),
            debounce_secs: default_debounce_secs(),
            tick_secs: default_tick_secs(),
            pull_lock: default_pull_lock(),
            vcs: VcsConfig::default(),
            peer: PeerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for VcsConfig {
    fn default() -> Self {
        Self {
            status: default_status(),
            startup: default_startup(),
            add: default_add(),
            remove: default_remove(),
            modify: default_modify(),
            mv: default_move(),
            commit: default_commit(),
            push: default_push(),
            pull: default_pull(),
            remote_url: default_remote_url(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            components: HashMap::new(),
        }
    }
}

impl Settings {
    /// Load configuration from the default search path plus environment.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::find_config_file().unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
        Self::load_from(config_path)
    }

    /// Load configuration from a specific file plus environment overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let settings: Settings = Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("AUTOSYNC_").map(|key| {
                key.as_str()
                    .to_lowercase()
                    // double underscore separates nesting levels
                    .replace("__", ".")
                    .into()
            }))
            .extract()
            .map_err(Box::new)?;
        Ok(settings)
    }

    /// Reject configurations the daemon cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.pull_lock {
            PullLock::Conservative => Ok(()),
            PullLock::Optimistic => Err(ConfigError::UnsupportedStrategy {
                strategy: "optimistic".to_string(),
            }),
        }
    }

    /// Search the current directory and `$HOME` for a config file.
    fn find_config_file() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE);
        if local.exists() {
            return Some(local);
        }
        let home = std::env::var_os("HOME").map(PathBuf::from)?;
        let candidate = home.join(CONFIG_FILE);
        candidate.exists().then_some(candidate)
    }

    /// Write this configuration to a file, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        }
        let rendered = toml::to_string_pretty(self).expect("settings serialize to TOML");
        std::fs::write(path, rendered).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Create a default config file in the current directory.
    pub fn init_config_file(force: bool) -> Result<PathBuf, ConfigError> {
        let path = PathBuf::from(CONFIG_FILE);
        if path.exists() && !force {
            return Err(ConfigError::AlreadyExists { path });
        }
        Settings::default().save(&path)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn default_settings_are_conservative_git() {
        let settings = Settings::default();
        assert_eq!(settings.version, 1);
        assert_eq!(settings.pull_lock, PullLock::Conservative);
        assert_eq!(settings.debounce_secs, 5);
        assert_eq!(settings.ignore_file, ".gitignore");
        assert!(settings.vcs.add.contains("%s"));
        assert!(settings.vcs.mv.matches("%s").count() == 2);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn load_from_toml_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("autosync.toml");
        fs::write(
            &config_path,
            r#"
path = "/srv/notes"
debounce_secs = 10
exclude_paths = [".git", ".hg"]

[vcs]
push = "hg push"
move = "hg mv %s %s"

[peer]
identity = "desk"
notify = ["laptop", "server"]
"#,
        )
        .unwrap();

        let settings = Settings::load_from(&config_path).unwrap();
        assert_eq!(settings.path, PathBuf::from("/srv/notes"));
        assert_eq!(settings.debounce_secs, 10);
        assert_eq!(settings.exclude_paths, vec![".git", ".hg"]);
        assert_eq!(settings.vcs.push, "hg push");
        assert_eq!(settings.vcs.mv, "hg mv %s %s");
        // untouched values keep their defaults
        assert_eq!(settings.vcs.pull, "git pull");
        assert_eq!(settings.peer.identity.as_deref(), Some("desk"));
        assert_eq!(settings.peer.notify.len(), 2);
    }

    #[test]
    fn optimistic_strategy_is_rejected() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("autosync.toml");
        fs::write(&config_path, "pull_lock = \"optimistic\"\n").unwrap();

        let settings = Settings::load_from(&config_path).unwrap();
        let err = settings.validate().unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedStrategy { .. }));
        assert!(err.to_string().contains("conservative"));
    }

    #[test]
    fn unknown_strategy_fails_to_parse() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("autosync.toml");
        fs::write(&config_path, "pull_lock = \"pessimistic\"\n").unwrap();
        assert!(Settings::load_from(&config_path).is_err());
    }

    #[test]
    fn save_and_reload_round_trip() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("sub").join("autosync.toml");

        let mut settings = Settings::default();
        settings.path = PathBuf::from("/work/tree");
        settings.debounce_secs = 30;
        settings.save(&config_path).unwrap();

        let loaded = Settings::load_from(&config_path).unwrap();
        assert_eq!(loaded.path, PathBuf::from("/work/tree"));
        assert_eq!(loaded.debounce_secs, 30);
    }
}

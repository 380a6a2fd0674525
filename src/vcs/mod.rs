//! Version control command execution.
//!
//! The daemon never speaks a VCS protocol itself. Every repository operation
//! is a configurable shell command template with positional `%s` placeholders
//! for the affected path(s), so the same binary drives git, mercurial or
//! anything else with a compatible command line.
//!
//! Templates may span multiple lines; each non-blank line is executed as one
//! command, tokenized on whitespace with `%s` placeholders filled in order.
//! The status template is the exception: it is conventionally a pipeline
//! (`git status | grep ...`) and runs through `sh -c`, with exit 0 meaning
//! a clean working tree. All other exit codes are logged but not otherwise
//! interpreted.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;

use crate::config::VcsConfig;
use crate::{debug_event, log_event};

#[derive(Error, Debug)]
pub enum VcsError {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("remote-url command `{command}` produced no output")]
    NoRemoteUrl { command: String },
}

/// One command template, pre-tokenized. Placeholders are filled left to
/// right across all lines of the template.
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    lines: Vec<Vec<String>>,
}

impl CommandTemplate {
    pub fn parse(template: &str) -> Self {
        let lines = template
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| l.split_whitespace().map(str::to_owned).collect())
            .collect();
        Self { lines }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Fill `%s` placeholders with `paths` in order. Placeholders beyond the
    /// supplied paths are left verbatim.
    fn substitute(&self, paths: &[&Path]) -> Vec<Vec<String>> {
        let mut next = 0;
        self.lines
            .iter()
            .map(|line| {
                line.iter()
                    .map(|token| {
                        let mut out = String::new();
                        let mut rest = token.as_str();
                        while let Some(idx) = rest.find("%s") {
                            out.push_str(&rest[..idx]);
                            match paths.get(next) {
                                Some(p) => {
                                    out.push_str(&p.to_string_lossy());
                                    next += 1;
                                }
                                None => out.push_str("%s"),
                            }
                            rest = &rest[idx + 2..];
                        }
                        out.push_str(rest);
                        out
                    })
                    .collect()
            })
            .collect()
    }
}

/// Executes the configured command templates inside the synchronized tree.
pub struct VcsCommands {
    cwd: PathBuf,
    status: String,
    startup: CommandTemplate,
    add: CommandTemplate,
    remove: CommandTemplate,
    modify: CommandTemplate,
    mv: CommandTemplate,
    commit: CommandTemplate,
    push: CommandTemplate,
    pull: CommandTemplate,
    remote_url: CommandTemplate,
}

impl VcsCommands {
    pub fn new(cwd: impl Into<PathBuf>, config: &VcsConfig) -> Self {
        Self {
            cwd: cwd.into(),
            status: config.status.clone(),
            startup: CommandTemplate::parse(&config.startup),
            add: CommandTemplate::parse(&config.add),
            remove: CommandTemplate::parse(&config.remove),
            modify: CommandTemplate::parse(&config.modify),
            mv: CommandTemplate::parse(&config.mv),
            commit: CommandTemplate::parse(&config.commit),
            push: CommandTemplate::parse(&config.push),
            pull: CommandTemplate::parse(&config.pull),
            remote_url: CommandTemplate::parse(&config.remote_url),
        }
    }

    pub async fn add(&self, path: &Path) -> Result<(), VcsError> {
        self.run(&self.add, &[path]).await
    }

    pub async fn remove(&self, path: &Path) -> Result<(), VcsError> {
        self.run(&self.remove, &[path]).await
    }

    pub async fn modify(&self, path: &Path) -> Result<(), VcsError> {
        self.run(&self.modify, &[path]).await
    }

    pub async fn mv(&self, from: &Path, to: &Path) -> Result<(), VcsError> {
        self.run(&self.mv, &[from, to]).await
    }

    pub async fn commit(&self) -> Result<(), VcsError> {
        self.run(&self.commit, &[]).await
    }

    pub async fn push(&self) -> Result<(), VcsError> {
        self.run(&self.push, &[]).await
    }

    pub async fn pull(&self) -> Result<(), VcsError> {
        self.run(&self.pull, &[]).await
    }

    pub async fn startup(&self) -> Result<(), VcsError> {
        self.run(&self.startup, &[]).await
    }

    /// The status check is a shell pipeline; exit 0 means nothing to commit.
    pub async fn status_clean(&self) -> Result<bool, VcsError> {
        debug_event!("vcs", "status", "{}", self.status);
        let status = Command::new("sh")
            .arg("-c")
            .arg(&self.status)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|source| VcsError::Spawn {
                command: self.status.clone(),
                source,
            })?;
        Ok(status.success())
    }

    /// Runs the remote-url command and captures its first line of stdout.
    pub async fn remote_url(&self) -> Result<String, VcsError> {
        let lines = self.remote_url.substitute(&[]);
        let Some(argv) = lines.first().filter(|argv| !argv.is_empty()) else {
            return Err(VcsError::NoRemoteUrl {
                command: String::new(),
            });
        };
        let display = argv.join(" ");
        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| VcsError::Spawn {
                command: display.clone(),
                source,
            })?;
        let url = String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or("")
            .trim()
            .to_owned();
        if url.is_empty() {
            return Err(VcsError::NoRemoteUrl { command: display });
        }
        Ok(url)
    }

    /// Runs every line of a template. A non-zero exit is logged and does not
    /// stop the remaining lines; only a spawn failure is an error.
    async fn run(&self, template: &CommandTemplate, paths: &[&Path]) -> Result<(), VcsError> {
        for argv in template.substitute(paths) {
            let Some(program) = argv.first() else { continue };
            let display = argv.join(" ");
            debug_event!("vcs", "exec", "{}", display);
            let status = Command::new(program)
                .args(&argv[1..])
                .current_dir(&self.cwd)
                .stdin(Stdio::null())
                .status()
                .await
                .map_err(|source| VcsError::Spawn {
                    command: display.clone(),
                    source,
                })?;
            if !status.success() {
                log_event!("vcs", "command failed", "`{}` exited with {}", display, status);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VcsConfig;
    use tempfile::TempDir;

    fn commands(dir: &TempDir, config: VcsConfig) -> VcsCommands {
        VcsCommands::new(dir.path(), &config)
    }

    #[test]
    fn template_substitutes_paths_in_order() {
        let template = CommandTemplate::parse("git mv %s %s");
        let lines = template.substitute(&[Path::new("a.txt"), Path::new("b.txt")]);
        assert_eq!(lines, vec![vec!["git", "mv", "a.txt", "b.txt"]]);
    }

    #[test]
    fn template_runs_one_command_per_line() {
        let template = CommandTemplate::parse("git add %s\n\n  git commit -m auto  ");
        let lines = template.substitute(&[Path::new("x")]);
        assert_eq!(
            lines,
            vec![
                vec!["git", "add", "x"],
                vec!["git", "commit", "-m", "auto"],
            ]
        );
    }

    #[test]
    fn extra_placeholders_stay_verbatim() {
        let template = CommandTemplate::parse("echo %s %s");
        let lines = template.substitute(&[Path::new("only")]);
        assert_eq!(lines, vec![vec!["echo", "only", "%s"]]);
    }

    #[tokio::test]
    async fn status_exit_zero_means_clean() {
        let dir = TempDir::new().unwrap();
        let clean = commands(
            &dir,
            VcsConfig {
                status: "true".into(),
                ..VcsConfig::default()
            },
        );
        assert!(clean.status_clean().await.unwrap());

        let dirty = commands(
            &dir,
            VcsConfig {
                status: "false".into(),
                ..VcsConfig::default()
            },
        );
        assert!(!dirty.status_clean().await.unwrap());
    }

    #[tokio::test]
    async fn status_runs_through_the_shell() {
        let dir = TempDir::new().unwrap();
        let vcs = commands(
            &dir,
            VcsConfig {
                status: "echo dirty | grep -q clean".into(),
                ..VcsConfig::default()
            },
        );
        assert!(!vcs.status_clean().await.unwrap());
    }

    #[tokio::test]
    async fn add_substitutes_the_path() {
        let dir = TempDir::new().unwrap();
        let vcs = commands(
            &dir,
            VcsConfig {
                add: "touch %s".into(),
                ..VcsConfig::default()
            },
        );
        vcs.add(Path::new("added.marker")).await.unwrap();
        assert!(dir.path().join("added.marker").exists());
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let vcs = commands(
            &dir,
            VcsConfig {
                commit: "false\ntouch still-ran".into(),
                ..VcsConfig::default()
            },
        );
        vcs.commit().await.unwrap();
        assert!(dir.path().join("still-ran").exists());
    }

    #[tokio::test]
    async fn remote_url_captures_stdout() {
        let dir = TempDir::new().unwrap();
        let vcs = commands(
            &dir,
            VcsConfig {
                remote_url: "echo ssh://example.org/repo".into(),
                ..VcsConfig::default()
            },
        );
        assert_eq!(vcs.remote_url().await.unwrap(), "ssh://example.org/repo");
    }

    #[tokio::test]
    async fn empty_remote_url_is_an_error() {
        let dir = TempDir::new().unwrap();
        let vcs = commands(
            &dir,
            VcsConfig {
                remote_url: "true".into(),
                ..VcsConfig::default()
            },
        );
        assert!(matches!(
            vcs.remote_url().await,
            Err(VcsError::NoRemoteUrl { .. })
        ));
    }
}

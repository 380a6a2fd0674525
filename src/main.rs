use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use autosync::peer::PeerNotifier;
use autosync::{
    ChannelPeerNotifier, FileWatcher, InstanceId, NullPeerNotifier, PathFilter, PushTimer,
    Settings, SyncCoordinator, SyncState, VcsCommands, log_event, logging, mapper,
};
use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, mpsc};

/// Fatal watcher setup failure (bad path, watch quota).
const EXIT_SETUP: i32 = 100;
/// Fatal configuration failure (unreadable, invalid, unsupported strategy).
const EXIT_CONFIG: i32 = 101;

#[derive(Parser)]
#[command(name = "autosync")]
#[command(about = "Watches a directory tree and mirrors changes into a DVCS")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a default configuration file
    Init {
        /// Overwrite an existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Watch the configured tree and synchronize changes
    Run {
        /// Configuration file (defaults to .autosync.toml in the current
        /// directory, then $HOME)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show the effective configuration
    Config {
        /// Configuration file to inspect
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => match Settings::init_config_file(force) {
            Ok(path) => {
                println!("Created configuration file at {}", path.display());
                println!("Edit it to point `path` at your repository checkout.");
            }
            Err(e) => {
                eprintln!("Error: {e}");
                std::process::exit(EXIT_CONFIG);
            }
        },

        Commands::Config { config } => {
            let settings = load_settings(config);
            match toml::to_string_pretty(&settings) {
                Ok(rendered) => println!("{rendered}"),
                Err(e) => {
                    eprintln!("Error displaying configuration: {e}");
                    std::process::exit(EXIT_CONFIG);
                }
            }
        }

        Commands::Run { config } => {
            let settings = load_settings(config);
            if let Err(code) = run(settings).await {
                std::process::exit(code);
            }
        }
    }
}

fn load_settings(path: Option<PathBuf>) -> Settings {
    let loaded = match path {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    };
    let settings = match loaded {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(EXIT_CONFIG);
        }
    };
    if let Err(e) = settings.validate() {
        eprintln!("Configuration error: {e}");
        std::process::exit(EXIT_CONFIG);
    }
    settings
}

async fn run(settings: Settings) -> Result<(), i32> {
    logging::init_with_config(&settings.logging);

    // Watch registration and ignore anchoring both need an absolute root.
    let root = match settings.path.canonicalize() {
        Ok(root) => root,
        Err(e) => {
            tracing::error!(
                "cannot resolve watch path {}: {}",
                settings.path.display(),
                e
            );
            return Err(EXIT_SETUP);
        }
    };

    let pidfile = settings.pidfile.clone();
    if let Some(path) = &pidfile {
        if let Err(e) = std::fs::write(path, format!("{}\n", std::process::id())) {
            tracing::warn!("cannot write pidfile {}: {}", path.display(), e);
        }
    }

    let filter = Arc::new(PathFilter::load(
        &root,
        &settings.ignore_file,
        &settings.exclude_paths,
    ));
    let state = Arc::new(SyncState::new());
    let (watcher, mut event_rx) =
        match FileWatcher::new(&root, Arc::clone(&filter), Arc::clone(&state)) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!("{e}");
                remove_pidfile(&pidfile);
                return Err(EXIT_SETUP);
            }
        };

    let identity = settings
        .peer
        .identity
        .clone()
        .map(InstanceId::new)
        .unwrap_or_else(InstanceId::generate);

    // Without configured peers the daemon runs local-only. With peers, the
    // broadcast channel stands in for the external transport adapter.
    let (notifier, peer_rx): (Arc<dyn PeerNotifier>, Option<broadcast::Receiver<_>>) =
        if settings.peer.notify.is_empty() {
            (Arc::new(NullPeerNotifier), None)
        } else {
            let channel = ChannelPeerNotifier::new(64);
            let rx = channel.subscribe();
            (Arc::new(channel), Some(rx))
        };

    let (expire_tx, mut expire_rx) = mpsc::channel(4);
    let timer = PushTimer::new(
        Duration::from_secs(settings.debounce_secs),
        Duration::from_secs(settings.tick_secs),
        expire_tx,
    );
    let coordinator = Arc::new(SyncCoordinator::new(
        VcsCommands::new(&root, &settings.vcs),
        timer,
        Arc::clone(&state),
        identity,
        notifier,
    ));

    let watch_task = tokio::spawn(watcher.run());

    let pipeline_task = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if let Some(action) = mapper::map(event) {
                    coordinator.enqueue_local_change(action).await;
                }
            }
        })
    };

    let flush_task = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            while expire_rx.recv().await.is_some() {
                coordinator.push().await;
            }
        })
    };

    let peer_task = peer_rx.map(|mut rx| {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => coordinator.handle_peer_message(message).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("peer channel lagged, skipped {skipped} announcements");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    });

    // Boot sequence: sync down from the remote first, then reconcile any
    // local changes made while the daemon was not running.
    coordinator.protected_pull().await;
    log_event!(
        "main",
        "ready",
        "watching {} as {}",
        root.display(),
        coordinator.identity()
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("cannot listen for shutdown signal: {e}");
    }

    log_event!("main", "shutdown", "stopping");
    coordinator.timer().shutdown();
    watch_task.abort();
    pipeline_task.abort();
    flush_task.abort();
    if let Some(task) = peer_task {
        task.abort();
    }
    remove_pidfile(&pidfile);
    Ok(())
}

fn remove_pidfile(pidfile: &Option<PathBuf>) {
    if let Some(path) = pidfile {
        let _ = std::fs::remove_file(path);
    }
}

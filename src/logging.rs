//! Diagnostic output for the daemon.
//!
//! All user-visible messages go through `tracing` as single-line events.
//! The default level comes from the `[logging]` section of the config, with
//! per-component overrides; the `RUST_LOG` environment variable wins over
//! both.
//!
//! ```toml
//! [logging]
//! default = "info"
//!
//! [logging.components]
//! watcher = "debug"
//! ```

use std::sync::Once;

use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;

static INIT: Once = Once::new();

/// HH:MM:SS.mmm, local time. Long-running daemon logs do not need the date.
struct ClockTime;

impl FormatTime for ClockTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%H:%M:%S%.3f"))
    }
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init_with_config(config: &LoggingConfig) {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            let mut spec = config.default.clone();
            for (component, level) in &config.components {
                // bare component names refer to this crate's modules
                if component.contains("::") {
                    spec.push_str(&format!(",{component}={level}"));
                } else {
                    spec.push_str(&format!(",autosync::{component}={level}"));
                }
            }
            EnvFilter::new(&spec)
        };

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_timer(ClockTime)
            .with_level(true)
            .with_filter(filter);

        tracing_subscriber::registry().with(fmt_layer).init();
    });
}

/// Install the global subscriber with the default level.
pub fn init() {
    init_with_config(&LoggingConfig::default());
}

/// One-line operational event, tagged with the originating component.
///
/// ```ignore
/// log_event!("sync", "pushing", "{} pending changes", n);
/// log_event!("watcher", "started");
/// ```
#[macro_export]
macro_rules! log_event {
    ($component:expr, $event:expr) => {
        tracing::info!("[{}] {}", $component, $event)
    };
    ($component:expr, $event:expr, $($arg:tt)*) => {{
        // Render the caller's format args before entering the tracing macro:
        // tracing's expansion shadows idents like `display`/`debug`.
        let message = format!($($arg)*);
        tracing::info!("[{}] {}: {}", $component, $event, message)
    }};
}

/// Debug-level counterpart of [`log_event!`].
#[macro_export]
macro_rules! debug_event {
    ($component:expr, $event:expr) => {
        tracing::debug!("[{}] {}", $component, $event)
    };
    ($component:expr, $event:expr, $($arg:tt)*) => {{
        let message = format!($($arg)*);
        tracing::debug!("[{}] {}: {}", $component, $event, message)
    }};
}

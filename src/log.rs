//! Structured logging for conductor.
//!
//! Log levels:
//! - ERROR: Task failures and unrecoverable coordination faults
//! - WARN: Dropped messages, review rejections, blocked phases, stale results
//! - INFO: Dispatch, completion, phase transitions, recovery actions
//! - DEBUG: Detailed scheduling traces
//! - TRACE: Message bus traffic
//!
//! Debug mode can be enabled by the caller or with the `CONDUCTOR_DEBUG=1`
//! env var. `RUST_LOG` overrides the default filter entirely.

use std::fs::File;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static LOG_PATH: OnceLock<Option<PathBuf>> = OnceLock::new();

/// Initialize logging to ~/.conductor/conductor.log
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// Only the first call installs a subscriber; later calls are no-ops.
pub fn init_with_debug(debug: bool) {
    LOG_PATH.get_or_init(|| {
        let level = if debug || env_debug() { "debug" } else { "info" };
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("conductor={},warn", level)));

        let path = dirs::home_dir().map(|h| h.join(".conductor").join("conductor.log"));
        let file = path.as_ref().and_then(|p| {
            if let Some(dir) = p.parent() {
                std::fs::create_dir_all(dir).ok()?;
            }
            // Truncate file on startup
            File::create(p).ok()
        });

        let installed = match file {
            Some(file) => tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .try_init()
                .is_ok(),
            None => tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .try_init()
                .is_ok(),
        };

        if installed {
            path
        } else {
            None
        }
    });
}

/// Path of the active log file, if logging went to a file.
pub fn log_path() -> Option<&'static PathBuf> {
    LOG_PATH.get().and_then(|p| p.as_ref())
}

fn env_debug() -> bool {
    std::env::var("CONDUCTOR_DEBUG")
        .map(|v| parse_flag(&v))
        .unwrap_or(false)
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

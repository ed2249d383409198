//! Tracing subscriber setup shared by console and service mode.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install the global subscriber. `RUST_LOG` overrides the configured
/// level. When a log file is configured, output is appended to it
/// without ANSI colors; if it cannot be opened, stderr is used.
pub fn init(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if !config.file.is_empty() {
        match OpenOptions::new().create(true).append(true).open(&config.file) {
            Ok(file) => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .init();
                return;
            }
            Err(e) => eprintln!("cannot open log file {}: {e}", config.file),
        }
    }

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

//! tracing-subscriber initialisation.
//!
//! The interactive REPL owns the terminal, so in that mode logs go to
//! `~/.picoclaw/picoclaw.log`. One-shot commands log to stderr.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};
use crate::error::ConfigError;

const DEFAULT_DIRECTIVES: &str = "picoclaw=info,reqwest=warn,hyper=warn";

/// Where log lines are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    File,
    Stderr,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// Install the global subscriber. A second call is a no-op.
pub fn init(config: &LoggingConfig, target: LogTarget) -> Result<(), ConfigError> {
    match target {
        LogTarget::Stderr => {
            let builder = tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_writer(std::io::stderr);
            let _ = match config.format {
                LogFormat::Text => builder.try_init(),
                LogFormat::Json => builder.json().try_init(),
            };
        }
        LogTarget::File => {
            if let Some(parent) = config.file.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let log_file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&config.file)
                .map_err(|e| {
                    ConfigError::ParseError(format!(
                        "failed to open log file '{}': {e}",
                        config.file.display()
                    ))
                })?;

            let builder = tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_ansi(false)
                .with_writer(Mutex::new(log_file));
            let _ = match config.format {
                LogFormat::Text => builder.try_init(),
                LogFormat::Json => builder.json().try_init(),
            };
        }
    }

    Ok(())
}

//! Tracing setup for the binaries
//!
//! Logs go to stderr and, when a log directory is given, to a per-process
//! file `collab-sync.<pid>.log` in that directory.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{Result, SyncError};

/// Log verbosity accepted on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogLevel {
    Critical,
    Error,
    Warning,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    /// Directive understood by `EnvFilter`
    pub fn as_filter(self) -> &'static str {
        match self {
            Self::Critical | Self::Error => "error",
            Self::Warning => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }
}

/// Install the global subscriber. Keep the returned guard alive for as long
/// as file logs should be flushed.
pub fn init(level: LogLevel, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let directive = format!("collab_sync={}", level.as_filter())
        .parse::<Directive>()
        .map_err(|e| SyncError::config(format!("invalid log directive: {}", e)))?;
    let filter = EnvFilter::from_default_env().add_directive(directive);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_name = format!("collab-sync.{}.log", std::process::id());
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .map_err(|e| SyncError::config(format!("logging already initialized: {}", e)))?;

    Ok(guard)
}

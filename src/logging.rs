//! Logging setup.
//!
//! Installs a `tracing` subscriber with an env-driven filter, a terminal
//! layer and, optionally, a daily-rotated file under the log directory.

use crate::config::LoggingConfig;
use crate::error::{Error, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Keeps the background log writer alive. Drop it last.
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Initialize the global subscriber.
///
/// `RUST_LOG` wins over `config.filter` when set.
pub fn init(config: &LoggingConfig) -> Result<LogGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .map_err(|e| Error::config(format!("invalid log filter: {e}")))?;

    let (file_layer, guard) = if config.log_to_file {
        let dir = crate::config::log_dir()?;
        std::fs::create_dir_all(&dir)?;
        let appender = tracing_appender::rolling::daily(dir, "marketsync.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (
            Some(fmt::layer().with_writer(writer).with_ansi(false)),
            Some(guard),
        )
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::application(format!("logging already initialized: {e}")))?;

    Ok(LogGuard { _file: guard })
}

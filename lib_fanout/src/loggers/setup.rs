use std::io;
use std::path::Path;

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// File name prefix of the daily rolling log.
pub const LOG_FILE_PREFIX: &str = "fanout";

/// Sets up console plus daily-rolling JSON file logging.
///
/// `RUST_LOG` wins over `log_level` when set. Logs land in
/// `<log_dir>/fanout.<date>`, written through a non-blocking appender.
///
/// # Returns
/// The appender's [`WorkerGuard`]. Keep it alive for the life of the process,
/// dropping it flushes and stops file logging.
pub fn setup_logging(log_dir: &Path, log_level: &str) -> io::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking_appender, guard) = non_blocking(file_appender);

    let console_layer = fmt::layer().with_target(true).with_ansi(true);

    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking_appender)
        .json();

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e))?;

    info!("Logging initialized with level: {}", log_level);
    Ok(guard)
}

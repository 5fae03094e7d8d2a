use std::path::Path;
use std::sync::OnceLock;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

#[derive(Debug, thiserror::Error)]
pub enum LogSetupError {
    #[error("Invalid log filter")]
    Filter(#[from] tracing_subscriber::filter::ParseError),
    #[error("Failed to create log directory '{0}'")]
    Directory(String, #[source] std::io::Error),
    #[error("Failed to create log file appender")]
    Appender(#[from] tracing_appender::rolling::InitError),
    #[error("Logging already initialized")]
    AlreadyInitialized,
}

/// Installs console and daily-rolling file logging under `log_dir`.
///
/// `RUST_LOG` overrides `base_level` when set. Warnings and errors are
/// mirrored to stderr; files are named `<file_prefix>.<date>.log`.
pub fn setup_logging_in(
    log_dir: impl AsRef<Path>,
    base_level: &str,
    file_prefix: &str,
) -> Result<(), LogSetupError> {
    let log_dir = log_dir.as_ref();
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(base_level)?,
    };

    std::fs::create_dir_all(log_dir)
        .map_err(|e| LogSetupError::Directory(log_dir.display().to_string(), e))?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(file_prefix)
        .filename_suffix("log")
        .max_log_files(5)
        .build(log_dir)?;

    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    LOG_GUARD
        .set(guard)
        .map_err(|_| LogSetupError::AlreadyInitialized)?;

    let console_writer = std::io::stdout
        .with_max_level(Level::INFO)
        .and(std::io::stderr.with_max_level(Level::WARN));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_ansi(true)
                .with_writer(console_writer),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .try_init()
        .map_err(|_| LogSetupError::AlreadyInitialized)
}

/// [`setup_logging_in`] with files under `./logs`.
pub fn setup_logging(base_level: &str, file_prefix: &str) -> Result<(), LogSetupError> {
    setup_logging_in("logs", base_level, file_prefix)
}

/// Console-only logging for tests. Safe to call from every test.
pub fn setup_test_logging() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

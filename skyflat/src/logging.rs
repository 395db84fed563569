//! Tracing subscriber setup

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Keeps the non-blocking file writer flushing for the life of the process
static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
static LOG_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Install the global subscriber.
///
/// Console output always; with `log_directory`, also a daily rolling
/// `skyflat.log` there. The level comes from `RUST_LOG`, default `debug`.
/// Fails if a subscriber is already installed.
pub fn init_logging(log_directory: Option<&Path>) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    match log_directory {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir)?;

            let file_appender = tracing_appender::rolling::daily(log_dir, "skyflat.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            let console_layer = fmt::layer().with_target(false).with_ansi(true);
            let file_layer = fmt::layer().with_target(true).with_ansi(false).with_writer(non_blocking);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .with(file_layer)
                .try_init()?;

            LOG_GUARD.set(guard).ok();
            LOG_DIR.set(log_dir.to_path_buf()).ok();
            tracing::info!("Sky flat logging to {}", log_dir.display());
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_target(false))
                .try_init()?;
        }
    }

    Ok(())
}

/// Directory given to [`init_logging`], if file logging is active
pub fn log_directory() -> Option<&'static Path> {
    LOG_DIR.get().map(PathBuf::as_path)
}

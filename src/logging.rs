//! Tracing setup for embedders.
//!
//! Scans log to the systemd journal on Linux when it is reachable, and to a
//! daily rolling file otherwise.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const FILTER_VAR: &str = "PHOTOSCAN_LOG";
#[cfg(target_os = "linux")]
/// Set to `file` to skip journald even where it is available.
const BACKEND_VAR: &str = "PHOTOSCAN_LOG_BACKEND";
/// ONNX Runtime logs every session build at info.
const DEFAULT_FILTER: &str = "info,ort=warn";

/// Install the global subscriber.
///
/// The level comes from `PHOTOSCAN_LOG` in `EnvFilter` syntax
/// (`debug`, `photoscan::faces=trace`, ...). Calling this twice is an error.
pub fn init(log_dir: Option<PathBuf>) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        if !force_file_backend() {
            if let Ok(journald) = tracing_journald::layer() {
                tracing_subscriber::registry()
                    .with(env_filter())
                    .with(journald)
                    .try_init()
                    .context("Failed to install journald subscriber")?;

                tracing::info!("Logging to journald");
                return Ok(());
            }
        }
    }

    let log_dir = log_dir.unwrap_or_else(default_log_dir);
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "photoscan.log"));

    // Dropping the guard stops the writer thread.
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_writer(writer).with_ansi(false).with_thread_names(true))
        .try_init()
        .context("Failed to install file subscriber")?;

    tracing::info!(dir = %log_dir.display(), "Logging to file");
    Ok(())
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(FILTER_VAR).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

#[cfg(target_os = "linux")]
fn force_file_backend() -> bool {
    std::env::var(BACKEND_VAR).is_ok_and(|v| v.eq_ignore_ascii_case("file"))
}

pub fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("photoscan")
        .join("logs")
}

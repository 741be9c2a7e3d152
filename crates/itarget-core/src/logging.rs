//! Logging configuration using tracing

use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::Result;

/// Initialize the logging subsystem
///
/// Logs are written to `~/.local/share/itarget/logs/`
/// Log level is controlled by the `ITARGET_LOG` environment variable.
///
/// # Examples
/// ```bash
/// ITARGET_LOG=debug itarget list
/// ITARGET_LOG=trace itarget install ./build/MyApp.app
/// ```
pub fn init() -> Result<()> {
    let log_dir = get_log_directory();
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "itarget.log");

    // Default to info, allow override via ITARGET_LOG
    let env_filter = EnvFilter::try_from_env("ITARGET_LOG").unwrap_or_else(|_| {
        EnvFilter::new("itarget=info,itarget_core=info,itarget_backend=info,itarget_app=info,warn")
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(true)
                .with_line_number(true)
                .with_timer(fmt::time::ChronoLocal::new(
                    "%Y-%m-%d %H:%M:%S%.3f".to_string(),
                )),
        )
        .init();

    tracing::info!("itarget starting, log directory: {}", log_dir.display());

    Ok(())
}

/// Get the log directory path
fn get_log_directory() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("itarget").join("logs")
}

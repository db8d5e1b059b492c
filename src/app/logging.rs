//! Usage: Install the tracing subscriber (stderr + daily-rolling file under `<working_dir>/logs`).

use crate::infra::app_paths;
use crate::shared::error::AppResult;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_FILE_PREFIX: &str = "oauth-hub.log";

/// Keep the returned guard alive for the whole process; dropping it flushes the file writer.
pub fn init(working_dir: &Path, verbose: bool) -> AppResult<Option<WorkerGuard>> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    let logs_dir = app_paths::logs_dir(working_dir);
    let (file_layer, guard) = match std::fs::create_dir_all(&logs_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(&logs_dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .boxed();
            (Some(layer), Some(guard))
        }
        Err(err) => {
            // Read-only working dirs still get stderr logging.
            eprintln!("log dir unavailable ({}): {err}", logs_dir.display());
            (None, None)
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| format!("SYSTEM_ERROR: failed to initialize logging: {e}"))?;

    tracing::debug!(logs_dir = %logs_dir.display(), "logging initialized");
    Ok(guard)
}

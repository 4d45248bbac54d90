use std::{fs, path::Path, sync::OnceLock};

use tracing_appender::non_blocking::{self, WorkerGuard};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::Result;

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the tracing subscriber: env-filtered stdout output, plus a
/// non-blocking file layer when a log file is configured. Safe to call
/// more than once; later calls are no-ops.
pub fn init(log_file: Option<&Path>) -> Result<()> {
    if FILE_GUARD.get().is_some() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer().with_target(false);

    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
            let (file_writer, guard) = non_blocking::NonBlockingBuilder::default()
                .lossy(false)
                .finish(file);
            let file_layer = fmt::layer()
                .with_writer(file_writer)
                .with_target(true)
                .with_ansi(false);

            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(stdout_layer)
                .with(file_layer);
            match subscriber.try_init() {
                Ok(_) => {
                    let _ = FILE_GUARD.set(guard);
                }
                Err(_) => {
                    // Subscriber already installed elsewhere; drop guard so
                    // the worker thread exits.
                    drop(guard);
                }
            }
        }
        None => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(stdout_layer);
            let _ = subscriber.try_init();
        }
    }

    Ok(())
}

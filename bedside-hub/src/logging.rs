use std::str::FromStr;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::LogConfig;

/// Keeps the file writer alive, logs are flushed when this is dropped
pub struct LoggingGuard {
    _guard: Option<WorkerGuard>,
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("log file {0} has no file name")]
    FileName(std::path::PathBuf),
    #[error("failed to create log directory: {0}")]
    Dir(#[from] std::io::Error),
}

fn filter(settings: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::from_str(&settings.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Console logging, plus a file when `settings.file` is set
pub fn init(settings: &LogConfig) -> Result<LoggingGuard, LoggingError> {
    let (file_layer, guard) = match &settings.file {
        Some(path) => {
            let name = path
                .file_name()
                .ok_or_else(|| LoggingError::FileName(path.clone()))?;
            let dir = match path.parent() {
                Some(dir) if !dir.as_os_str().is_empty() => dir,
                _ => std::path::Path::new("."),
            };
            std::fs::create_dir_all(dir)?;
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter(settings))
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    Ok(LoggingGuard { _guard: guard })
}

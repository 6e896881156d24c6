// Logging - tracing subscriber writing to stderr and an append-only log file

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::error::Result;

/// Default log file, relative to the working directory.
pub const DEFAULT_LOG_FILE: &str = "mcp_pipe.log";

/// `RUST_LOG` takes precedence over `default_level`.
pub fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Install the global subscriber. Returns whether the file layer is active.
///
/// A log file that cannot be opened only disables the file layer.
pub fn init(default_level: &str, log_file: Option<&Path>) -> Result<bool> {
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let (file_layer, file_error) = match log_file.map(open_log_file) {
        Some(Ok(file)) => (
            Some(
                fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .boxed(),
            ),
            None,
        ),
        Some(Err(e)) => (None, Some(e)),
        None => (None, None),
    };
    let file_active = file_layer.is_some();

    tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| crate::error::PipeError::Config(format!("logging already initialised: {}", e)))?;

    if let (Some(path), Some(e)) = (log_file, file_error) {
        tracing::warn!("Could not open log file {}: {}", path.display(), e);
    }
    Ok(file_active)
}

fn open_log_file(path: &Path) -> std::io::Result<std::fs::File> {
    OpenOptions::new().create(true).append(true).open(path)
}

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::process::ExitStatus;

#[derive(Error, Debug)]
pub enum PipeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to connect to endpoint: {0}")]
    Connect(#[source] tungstenite::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("Transport closed unexpectedly")]
    TransportClosed,

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Child process I/O error: {0}")]
    ChildIo(#[source] std::io::Error),

    #[error("Child process exited unexpectedly ({0})")]
    ChildExited(ExitStatus),

    #[error("Received binary message that is not valid UTF-8")]
    InvalidUtf8,

    #[error("Pump task failed: {0}")]
    Pump(#[from] tokio::task::JoinError),

    #[error("Signal delivery failed: {0}")]
    Signal(#[from] nix::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipeError {
    /// Only configuration problems stop the pipe; everything else is retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipeError::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, PipeError>;

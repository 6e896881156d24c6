// Configuration - endpoint resolution and runtime settings

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{PipeError, Result};
use crate::process::ChildCommand;
use crate::supervisor::RetryConfig;

/// Environment variable carrying the endpoint URL.
pub const ENDPOINT_ENV: &str = "MCP_ENDPOINT";

/// Config file shared with the desktop configuration editor.
pub const CONFIG_FILE_NAME: &str = ".xiaozhi_mcp_config.json";

/// The subset of the shared JSON config file the pipe reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    #[serde(rename = "MCP_ENDPOINT")]
    pub mcp_endpoint: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// A missing or malformed file is treated as empty.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(PipeError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config file at {}", path.display());
                Self::default()
            }
            Err(e) => {
                warn!("Ignoring config file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(CONFIG_FILE_NAME))
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn dotenv_outcome<T>(loaded: std::result::Result<T, dotenvy::Error>) -> Result<Option<T>> {
    match loaded {
        Ok(found) => Ok(Some(found)),
        Err(e) if e.not_found() => Ok(None),
        Err(e) => Err(PipeError::Config(format!("invalid .env file: {}", e))),
    }
}

/// Load `.env` from the working directory or a parent. A missing file is
/// `Ok(None)`; a malformed one is an error for the caller to report.
pub fn load_dotenv() -> Result<Option<PathBuf>> {
    dotenv_outcome(dotenvy::dotenv())
}

/// Load a specific `.env` file. Returns whether it existed.
pub fn load_dotenv_from(path: &Path) -> Result<bool> {
    dotenv_outcome(dotenvy::from_path(path)).map(|loaded| loaded.is_some())
}

/// The override (CLI flag or environment) wins over the config file.
pub fn resolve_endpoint(override_url: Option<&str>, config_path: Option<&Path>) -> Result<String> {
    if let Some(url) = non_empty(override_url) {
        return Ok(url);
    }

    let from_file = config_path
        .map(FileConfig::load_or_default)
        .and_then(|config| non_empty(config.mcp_endpoint.as_deref()));

    from_file.ok_or_else(|| {
        PipeError::Config(format!(
            "{} not found. Please set the {} environment variable or use --endpoint",
            ENDPOINT_ENV, ENDPOINT_ENV
        ))
    })
}

/// Everything the pipe needs to run.
#[derive(Debug, Clone)]
pub struct PipeSettings {
    pub endpoint: String,
    pub command: ChildCommand,
    pub retry: RetryConfig,
    pub terminate_timeout: Duration,
}

impl PipeSettings {
    pub fn validate(&self) -> Result<()> {
        if self.command.program.trim().is_empty() {
            return Err(PipeError::Config("child command is empty".into()));
        }
        if self.terminate_timeout.is_zero() {
            return Err(PipeError::Config("terminate timeout must be positive".into()));
        }
        self.retry.validate()
    }
}

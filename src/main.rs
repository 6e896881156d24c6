use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mcp_pipe::config::{self, PipeSettings, ENDPOINT_ENV};
use mcp_pipe::logging::{self, DEFAULT_LOG_FILE};
use mcp_pipe::{
    ChildCommand, ConnectionSession, ConnectionSupervisor, ProcessBridge, RetryConfig,
    ShutdownSignals,
};

/// Connect a local MCP server process to a remote WebSocket endpoint.
#[derive(Debug, Parser)]
#[command(name = "mcp-pipe", version, about)]
struct Cli {
    /// Program (or script) to run as the child process
    program: String,

    /// Arguments passed to the program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// WebSocket endpoint URL (overrides the config file)
    #[arg(long, env = ENDPOINT_ENV)]
    endpoint: Option<String>,

    /// JSON config file holding MCP_ENDPOINT
    #[arg(long)]
    config: Option<PathBuf>,

    /// Interpreter for the program; `.py` scripts default to python
    #[arg(long)]
    interpreter: Option<String>,

    /// Initial reconnection back-off in seconds
    #[arg(long, default_value_t = 1.0)]
    initial_backoff: f64,

    /// Maximum reconnection back-off in seconds
    #[arg(long, default_value_t = 600.0)]
    max_backoff: f64,

    /// Random jitter added to each back-off, as a fraction
    #[arg(long, default_value_t = 0.1)]
    jitter: f64,

    /// Seconds to wait after SIGTERM before killing the child
    #[arg(long, default_value_t = 5.0)]
    terminate_timeout: f64,

    /// Log file, appended to
    #[arg(long, default_value = DEFAULT_LOG_FILE)]
    log_file: PathBuf,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn seconds(name: &str, value: f64) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("invalid --{}: {}", name, value))
}

impl Cli {
    fn settings(&self) -> anyhow::Result<PipeSettings> {
        let config_path = self.config.clone().or_else(config::default_config_path);
        let endpoint = config::resolve_endpoint(self.endpoint.as_deref(), config_path.as_deref())?;

        let settings = PipeSettings {
            endpoint,
            command: ChildCommand::for_script(
                &self.program,
                self.args.clone(),
                self.interpreter.as_deref(),
            ),
            retry: RetryConfig {
                initial_backoff: seconds("initial-backoff", self.initial_backoff)?,
                max_backoff: seconds("max-backoff", self.max_backoff)?,
                jitter_fraction: self.jitter,
            },
            terminate_timeout: seconds("terminate-timeout", self.terminate_timeout)?,
        };
        settings.validate()?;
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env never overrides variables that are already set
    // Before parsing, so `.env` can supply MCP_ENDPOINT.
    let dotenv = config::load_dotenv();
    let cli = Cli::parse();

    logging::init(&cli.log_level, Some(cli.log_file.as_path()))?;
    match dotenv {
        Ok(Some(path)) => debug!("Loaded environment from {}", path.display()),
        Ok(None) => {}
        Err(e) => warn!("{}; continuing without it", e),
    }

    let settings = match cli.settings() {
        Ok(settings) => settings,
        Err(e) => {
            error!("{:#}", e);
            return Err(e);
        }
    };

    info!("Using MCP endpoint: {}", settings.endpoint);
    info!("Child command: {}", settings.command);

    let cancel = CancellationToken::new();
    let signals = ShutdownSignals::new().context("installing signal handlers")?;
    let listener = signals.cancel_on_signal(cancel.clone());

    let session = ConnectionSession::new(
        ProcessBridge::new(settings.terminate_timeout),
        settings.command.clone(),
    );
    let mut supervisor = ConnectionSupervisor::new(settings.retry.clone());
    supervisor.run(&session, &settings.endpoint, &cancel).await;

    listener.abort();
    info!("Program interrupted by user");
    Ok(())
}

use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, info};

use crate::error::{PipeError, Result};
use crate::process::lifecycle::{self, ExitStatus, Termination};

/// Default interpreter for `.py` scripts.
pub const DEFAULT_SCRIPT_INTERPRETER: &str = "python";

/// Argument vector for the bridged child. The content is not interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ChildCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Build the command for `program`, running it through `interpreter`
    /// when one is given, or through python when `program` is a `.py` script.
    pub fn for_script(program: &str, args: Vec<String>, interpreter: Option<&str>) -> Self {
        let is_python = Path::new(program)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("py"));

        match interpreter.or(is_python.then_some(DEFAULT_SCRIPT_INTERPRETER)) {
            Some(interp) => Self::new(interp).arg(program).args(args),
            None => Self::new(program).args(args),
        }
    }
}

impl fmt::Display for ChildCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Writes newline-terminated lines and flushes each one immediately.
pub struct LineWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        self.inner
            .write_all(line.as_bytes())
            .await
            .map_err(PipeError::ChildIo)?;
        if !line.ends_with('\n') {
            self.inner.write_all(b"\n").await.map_err(PipeError::ChildIo)?;
        }
        self.inner.flush().await.map_err(PipeError::ChildIo)
    }

    /// Close the stream so the reader observes end-of-input.
    pub async fn close(&mut self) -> Result<()> {
        self.inner.shutdown().await.map_err(PipeError::ChildIo)
    }
}

/// Reads raw lines (terminator included) from a child output stream.
pub struct LineReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
        }
    }

    /// Next line, or `None` once the stream is closed.
    pub async fn next_line(&mut self) -> Result<Option<Vec<u8>>> {
        let mut buf = Vec::new();
        let n = self
            .inner
            .read_until(b'\n', &mut buf)
            .await
            .map_err(PipeError::ChildIo)?;
        if n == 0 {
            Ok(None)
        } else {
            Ok(Some(buf))
        }
    }
}

/// The three stdio pipes of a spawned child.
pub struct ChildPipes {
    pub stdin: LineWriter<ChildStdin>,
    pub stdout: LineReader<ChildStdout>,
    pub stderr: LineReader<ChildStderr>,
}

/// A live child process owned by one session.
pub struct ChildHandle {
    child: Child,
    pid: u32,
    command: ChildCommand,
}

impl ChildHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn command(&self) -> &ChildCommand {
        &self.command
    }

    /// Take ownership of the stdio pipes. Only succeeds once.
    pub fn take_pipes(&mut self) -> Result<ChildPipes> {
        let missing = || {
            PipeError::ChildIo(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "child stdio already taken",
            ))
        };
        let stdin = self.child.stdin.take().ok_or_else(missing)?;
        let stdout = self.child.stdout.take().ok_or_else(missing)?;
        let stderr = self.child.stderr.take().ok_or_else(missing)?;
        Ok(ChildPipes {
            stdin: LineWriter::new(stdin),
            stdout: LineReader::new(stdout),
            stderr: LineReader::new(stderr),
        })
    }

    /// Wait for the child to exit on its own.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let status = self.child.wait().await.map_err(PipeError::ChildIo)?;
        Ok(status.into())
    }
}

impl Drop for ChildHandle {
    fn drop(&mut self) {
        debug!("Dropping ChildHandle, child_pid: {}", self.pid);
    }
}

/// Spawns children with piped stdio and tears them down in two phases.
#[derive(Debug, Clone)]
pub struct ProcessBridge {
    terminate_timeout: Duration,
}

impl ProcessBridge {
    pub fn new(terminate_timeout: Duration) -> Self {
        Self { terminate_timeout }
    }

    pub fn spawn(&self, command: &ChildCommand) -> Result<ChildHandle> {
        info!("Spawning child: {}", command);

        let child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PipeError::Spawn {
                program: command.program.clone(),
                source,
            })?;

        let pid = child.id().ok_or_else(|| PipeError::Spawn {
            program: command.program.clone(),
            source: std::io::Error::other("child exited before its pid was read"),
        })?;
        info!("Started {} (pid {})", command.program, pid);

        Ok(ChildHandle {
            child,
            pid,
            command: command.clone(),
        })
    }

    /// Guarantees the OS process is no longer running when this returns `Ok`.
    pub async fn terminate(&self, handle: &mut ChildHandle) -> Result<Termination> {
        info!("Terminating {} process (pid {})", handle.command.program, handle.pid);
        let outcome = lifecycle::terminate(&mut handle.child, self.terminate_timeout).await?;
        info!(
            "{} process terminated: {:?}",
            handle.command.program, outcome
        );
        Ok(outcome)
    }
}

impl Default for ProcessBridge {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

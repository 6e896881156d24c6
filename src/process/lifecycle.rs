use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::time::Duration;

use nix::errno::Errno;
use tokio::process::Child;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{PipeError, Result};
use crate::process::signals::ChildSignaller;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Code(i32),
    Signal(i32),
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExitStatus::Code(code) => Some(*code),
            _ => None,
        }
    }

    pub fn signal(&self) -> Option<i32> {
        match self {
            ExitStatus::Signal(sig) => Some(*sig),
            _ => None,
        }
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ExitStatus::Code(code),
            (None, Some(sig)) => ExitStatus::Signal(sig),
            // Neither a code nor a signal only happens for stopped processes,
            // which wait() never reports.
            (None, None) => ExitStatus::Code(-1),
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Code(code) => write!(f, "exit code {}", code),
            ExitStatus::Signal(sig) => write!(f, "signal {}", sig),
        }
    }
}

/// How a child was brought down at the end of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The child had already exited before teardown began.
    AlreadyExited(ExitStatus),
    /// The child exited within the grace period after SIGTERM.
    Graceful(ExitStatus),
    /// The child ignored SIGTERM and was killed.
    Killed(ExitStatus),
}

impl Termination {
    pub fn status(&self) -> ExitStatus {
        match self {
            Termination::AlreadyExited(status)
            | Termination::Graceful(status)
            | Termination::Killed(status) => *status,
        }
    }

    pub fn was_forced(&self) -> bool {
        matches!(self, Termination::Killed(_))
    }
}

/// Wait for the child to exit, giving up after `limit`.
pub async fn wait_with_timeout(child: &mut Child, limit: Duration) -> Result<Option<ExitStatus>> {
    match timeout(limit, child.wait()).await {
        Ok(Ok(status)) => Ok(Some(status.into())),
        Ok(Err(e)) => Err(PipeError::ChildIo(e)),
        Err(_) => Ok(None),
    }
}

/// Two-phase shutdown: SIGTERM, wait up to `grace`, then SIGKILL.
///
/// Returns only once the OS process has been reaped.
pub async fn terminate(child: &mut Child, grace: Duration) -> Result<Termination> {
    if let Some(status) = child.try_wait().map_err(PipeError::ChildIo)? {
        debug!("Child already exited with {}", ExitStatus::from(status));
        return Ok(Termination::AlreadyExited(status.into()));
    }

    let Some(pid) = child.id() else {
        let status = child.wait().await.map_err(PipeError::ChildIo)?;
        return Ok(Termination::AlreadyExited(status.into()));
    };

    let signaller = ChildSignaller::from_raw(pid);
    match signaller.terminate() {
        Ok(()) => {
            debug!("Sent SIGTERM to child {}", pid);
            if let Some(status) = wait_with_timeout(child, grace).await? {
                info!("Child {} exited gracefully ({})", pid, status);
                return Ok(Termination::Graceful(status));
            }
            warn!("Child {} still running after {:?}, sending SIGKILL", pid, grace);
        }
        Err(Errno::ESRCH) => {
            let status = child.wait().await.map_err(PipeError::ChildIo)?;
            return Ok(Termination::AlreadyExited(status.into()));
        }
        Err(e) => {
            warn!("Failed to send SIGTERM to child {}: {}, escalating", pid, e);
        }
    }

    // Not yet reaped, so the pid still names our child.
    match signaller.kill() {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => return Err(e.into()),
    }
    let status: ExitStatus = child.wait().await.map_err(PipeError::ChildIo)?.into();
    info!("Child {} killed ({})", pid, status);
    Ok(Termination::Killed(status))
}

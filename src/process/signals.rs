use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Delivers signals to one child process.
#[derive(Debug, Clone, Copy)]
pub struct ChildSignaller {
    child_pid: Pid,
}

impl ChildSignaller {
    pub fn new(child_pid: Pid) -> Self {
        Self { child_pid }
    }

    pub fn from_raw(pid: u32) -> Self {
        Self::new(Pid::from_raw(pid as i32))
    }

    fn send_signal(&self, sig: Signal) -> Result<(), nix::Error> {
        signal::kill(self.child_pid, sig)
    }

    /// Send SIGTERM to child
    pub fn terminate(&self) -> Result<(), nix::Error> {
        self.send_signal(Signal::SIGTERM)
    }

    /// Send SIGKILL to child (force kill)
    pub fn kill(&self) -> Result<(), nix::Error> {
        self.send_signal(Signal::SIGKILL)
    }

    /// Liveness check via signal 0.
    pub fn is_alive(&self) -> bool {
        signal::kill(self.child_pid, None).is_ok()
    }

    pub fn pid(&self) -> Pid {
        self.child_pid
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    Interrupt,
    Terminate,
}

/// Operator-facing shutdown signals for the pipe itself.
pub struct ShutdownSignals {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    pub fn new() -> Result<Self, std::io::Error> {
        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the next SIGINT or SIGTERM.
    pub async fn recv(&mut self) -> SignalEvent {
        tokio::select! {
            _ = self.sigint.recv() => {
                debug!("Received SIGINT");
                SignalEvent::Interrupt
            }
            _ = self.sigterm.recv() => {
                debug!("Received SIGTERM");
                SignalEvent::Terminate
            }
        }
    }

    /// Cancel `token` on the first shutdown signal.
    pub fn cancel_on_signal(mut self, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tokio::select! {
                event = self.recv() => {
                    info!("Received {:?} signal, shutting down...", event);
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        })
    }
}

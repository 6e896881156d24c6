// Connection session - one connect, spawn, pump, teardown cycle

use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::{PipeError, Result};
use crate::process::{ChildCommand, ChildHandle, ProcessBridge};
use crate::pump::{self, PumpExit};

/// How long cancelled pumps get to wind down before they are aborted.
const PUMP_GRACE: Duration = Duration::from_millis(250);

/// Why a session ended without an error. A child exiting on its own is
/// reported as `PipeError::ChildExited` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The remote peer closed the transport.
    RemoteClosed,
    /// The operator asked the pipe to stop.
    Cancelled,
}

struct Leg {
    name: &'static str,
    handle: JoinHandle<Result<PumpExit>>,
    done: bool,
}

impl Leg {
    fn spawn<F>(name: &'static str, pump: F) -> Self
    where
        F: std::future::Future<Output = Result<PumpExit>> + Send + 'static,
    {
        Self {
            name,
            handle: tokio::spawn(pump.in_current_span()),
            done: false,
        }
    }

    /// Record a finished leg and flatten its result.
    fn finish(
        &mut self,
        joined: std::result::Result<Result<PumpExit>, tokio::task::JoinError>,
    ) -> Result<PumpExit> {
        self.done = true;
        let exit = joined.map_err(PipeError::from).and_then(|r| r);
        match &exit {
            Ok(how) => info!("Pump {} finished: {:?}", self.name, how),
            Err(e) => warn!("Pump {} failed: {}", self.name, e),
        }
        exit
    }

    /// Wait a bounded time for a cancelled leg, then abort it.
    async fn reap(&mut self, grace: Duration) {
        if self.done {
            return;
        }
        self.done = true;
        match timeout(grace, &mut self.handle).await {
            Ok(Ok(Ok(how))) => debug!("Pump {} stopped: {:?}", self.name, how),
            Ok(Ok(Err(e))) => debug!("Pump {} stopped with error: {}", self.name, e),
            Ok(Err(e)) => debug!("Pump {} task ended abnormally: {}", self.name, e),
            Err(_) => {
                warn!("Pump {} did not stop in {:?}, aborting", self.name, grace);
                self.handle.abort();
            }
        }
    }
}

/// Runs one session: open the transport, spawn the child, pump until the
/// first terminal event, tear everything down.
#[derive(Debug, Clone)]
pub struct ConnectionSession {
    bridge: ProcessBridge,
    command: ChildCommand,
    pump_grace: Duration,
}

impl ConnectionSession {
    pub fn new(bridge: ProcessBridge, command: ChildCommand) -> Self {
        Self {
            bridge,
            command,
            pump_grace: PUMP_GRACE,
        }
    }

    pub fn with_pump_grace(mut self, grace: Duration) -> Self {
        self.pump_grace = grace;
        self
    }

    /// Connect to `endpoint` and bridge it to a fresh child process.
    pub async fn run(&self, endpoint: &str, cancel: &CancellationToken) -> Result<SessionEnd> {
        let span = info_span!("session", id = %Uuid::new_v4());
        async move {
            info!("Connecting to WebSocket server: {}", endpoint);
            let connected = tokio::select! {
                _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
                connected = tokio_tungstenite::connect_async(endpoint) => connected,
            };
            let (ws, _response) = connected.map_err(PipeError::Connect)?;
            info!("Successfully connected to WebSocket server");

            let (sink, stream) = ws.split();
            self.run_with_transport(stream, sink, cancel).await
        }
        .instrument(span)
        .await
    }

    /// Bridge an already-open transport to a fresh child process.
    pub async fn run_with_transport<St, E, Si>(
        &self,
        stream: St,
        mut sink: Si,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd>
    where
        St: Stream<Item = std::result::Result<Message, E>> + Unpin + Send + 'static,
        E: Send + 'static,
        PipeError: From<E>,
        Si: Sink<Message> + Unpin + Send + 'static,
        Si::Error: Send + 'static,
        PipeError: From<Si::Error>,
    {
        let mut child = match self.bridge.spawn(&self.command) {
            Ok(child) => child,
            Err(e) => {
                error!("Could not start {}: {}", self.command, e);
                let _ = sink.close().await;
                return Err(e);
            }
        };

        let outcome = self.drive(&mut child, stream, sink, cancel).await;

        let termination = self.bridge.terminate(&mut child).await;
        match &outcome {
            Ok(end) => info!("Session ended: {:?}", end),
            Err(e) => error!("Session failed: {}", e),
        }
        if let Err(e) = &termination {
            error!("Failed to terminate child {}: {}", child.pid(), e);
        }
        outcome.and_then(|end| termination.map(|_| end))
    }

    async fn drive<St, E, Si>(
        &self,
        child: &mut ChildHandle,
        stream: St,
        sink: Si,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd>
    where
        St: Stream<Item = std::result::Result<Message, E>> + Unpin + Send + 'static,
        E: Send + 'static,
        PipeError: From<E>,
        Si: Sink<Message> + Unpin + Send + 'static,
        Si::Error: Send + 'static,
        PipeError: From<Si::Error>,
    {
        let pid = child.pid();
        let pipes = child.take_pipes()?;
        let pumps = cancel.child_token();

        let mut inbound = Leg::spawn(
            "remote->stdin",
            pump::remote_to_process(stream, pipes.stdin, pumps.clone()),
        );
        let mut outbound = Leg::spawn(
            "stdout->remote",
            pump::process_to_remote(pipes.stdout, sink, pumps.clone()),
        );
        let mut diagnostics = Leg::spawn(
            "stderr->diagnostics",
            pump::process_stderr_to_diagnostics(pipes.stderr, tokio::io::stderr(), pumps.clone()),
        );

        let end = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(SessionEnd::Cancelled),
                joined = &mut inbound.handle, if !inbound.done => {
                    break inbound.finish(joined).map(|how| closed_as(how, SessionEnd::RemoteClosed));
                }
                // output streams closing alone do not end the session
                joined = &mut outbound.handle, if !outbound.done => {
                    if let Err(e) = outbound.finish(joined) {
                        break Err(e);
                    }
                }
                joined = &mut diagnostics.handle, if !diagnostics.done => {
                    if let Err(e) = diagnostics.finish(joined) {
                        break Err(e);
                    }
                }
                status = child.wait() => {
                    break match status {
                        Ok(status) => {
                            warn!("Child {} exited with {}", pid, status);
                            Err(PipeError::ChildExited(status))
                        }
                        Err(e) => Err(e),
                    };
                }
            }
        };

        // Let output already written by an exited child reach the remote.
        if matches!(end, Err(PipeError::ChildExited(_))) && !outbound.done {
            if let Ok(joined) = timeout(self.pump_grace, &mut outbound.handle).await {
                let _ = outbound.finish(joined);
            }
        }

        pumps.cancel();
        for leg in [&mut inbound, &mut outbound, &mut diagnostics] {
            leg.reap(self.pump_grace).await;
        }
        end
    }
}

fn closed_as(how: PumpExit, end: SessionEnd) -> SessionEnd {
    match how {
        PumpExit::Cancelled => SessionEnd::Cancelled,
        PumpExit::SourceClosed => end,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{ChildSignaller, ExitStatus};
    use futures::channel::mpsc;
    use std::time::Instant;

    type Inbound = mpsc::UnboundedSender<std::result::Result<Message, PipeError>>;

    fn transport() -> (
        Inbound,
        mpsc::UnboundedReceiver<std::result::Result<Message, PipeError>>,
        impl Sink<Message, Error = PipeError> + Unpin + Send + 'static,
        mpsc::UnboundedReceiver<Message>,
    ) {
        let (in_tx, in_rx) = mpsc::unbounded();
        let (out_tx, out_rx) = mpsc::unbounded();
        (
            in_tx,
            in_rx,
            out_tx.sink_map_err(|_| PipeError::TransportClosed),
            out_rx,
        )
    }

    fn session(script: &str) -> ConnectionSession {
        ConnectionSession::new(
            ProcessBridge::new(Duration::from_secs(2)),
            ChildCommand::new("/bin/sh").arg("-c").arg(script),
        )
    }

    #[tokio::test]
    async fn test_echo_until_remote_closes() {
        let (in_tx, in_rx, sink, mut out_rx) = transport();
        let session = session("cat; exec sleep 30");
        let cancel = CancellationToken::new();

        let run = tokio::spawn(async move { session.run_with_transport(in_rx, sink, &cancel).await });

        in_tx.unbounded_send(Ok(Message::text("hello"))).unwrap();
        let echoed = out_rx.next().await.unwrap();
        assert_eq!(echoed, Message::text("hello"));

        in_tx.unbounded_send(Ok(Message::Close(None))).unwrap();
        let end = run.await.unwrap().unwrap();
        assert_eq!(end, SessionEnd::RemoteClosed);
    }

    #[tokio::test]
    async fn test_child_exit_is_a_failure_after_forwarding_output() {
        let (_in_tx, in_rx, sink, out_rx) = transport();
        let session = session("echo '[GUI_LOG]hello'; echo done; exit 2");

        let result = session
            .run_with_transport(in_rx, sink, &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(PipeError::ChildExited(ExitStatus::Code(2)))
        ));

        let sent: Vec<Message> = out_rx.collect().await;
        assert_eq!(
            sent,
            vec![Message::text("[GUI_LOG]hello"), Message::text("done")]
        );
    }

    #[tokio::test]
    async fn test_closed_stdout_keeps_session_alive() {
        let (in_tx, in_rx, sink, mut out_rx) = transport();
        let session = session("echo $$; exec >&-; exec sleep 30");
        let cancel = CancellationToken::new();

        let mut run = tokio::spawn(async move { session.run_with_transport(in_rx, sink, &cancel).await });

        let pid: u32 = match out_rx.next().await.unwrap() {
            Message::Text(t) => t.as_str().parse().unwrap(),
            other => panic!("unexpected message {:?}", other),
        };

        // stdout is gone but the child is still running
        assert!(timeout(Duration::from_millis(500), &mut run).await.is_err());
        assert!(ChildSignaller::from_raw(pid).is_alive());

        in_tx.unbounded_send(Ok(Message::Close(None))).unwrap();
        let end = run.await.unwrap().unwrap();
        assert_eq!(end, SessionEnd::RemoteClosed);
        assert!(!ChildSignaller::from_raw(pid).is_alive());
    }

    #[tokio::test]
    async fn test_outbound_failure_ends_session_while_inbound_idle() {
        let (_in_tx, in_rx, sink, out_rx) = transport();
        drop(out_rx);
        let session = session("echo $$; exec sleep 30");

        let result = session
            .run_with_transport(in_rx, sink, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(PipeError::TransportClosed)));
    }

    #[tokio::test]
    async fn test_cancel_terminates_child() {
        let (_in_tx, in_rx, sink, mut out_rx) = transport();
        let session = session("echo $$; exec sleep 30");
        let cancel = CancellationToken::new();

        let run = {
            let cancel = cancel.clone();
            tokio::spawn(async move { session.run_with_transport(in_rx, sink, &cancel).await })
        };

        let pid: u32 = match out_rx.next().await.unwrap() {
            Message::Text(t) => t.as_str().parse().unwrap(),
            other => panic!("unexpected message {:?}", other),
        };
        assert!(ChildSignaller::from_raw(pid).is_alive());

        let started = Instant::now();
        cancel.cancel();
        let end = run.await.unwrap().unwrap();
        assert_eq!(end, SessionEnd::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!ChildSignaller::from_raw(pid).is_alive());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_session_error() {
        let (_in_tx, in_rx, sink, _out_rx) = transport();
        let session = ConnectionSession::new(
            ProcessBridge::default(),
            ChildCommand::new("/nonexistent/server"),
        );

        let result = session
            .run_with_transport(in_rx, sink, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(PipeError::Spawn { .. })));
    }
}

// Stream pumps - the three forwarding legs of a session
// remote -> child stdin, child stdout -> remote, child stderr -> local diagnostics

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{PipeError, Result};
use crate::process::{LineReader, LineWriter};

/// Tag for child diagnostics that must reach the remote peer.
pub const GUI_LOG_PREFIX: &str = "[GUI_LOG]";

const PREVIEW_CHARS: usize = 120;

/// Build a `[GUI_LOG]`-tagged line for a child to print on stdout.
pub fn gui_log(message: &str) -> String {
    format!("{}{}", GUI_LOG_PREFIX, message)
}

/// One unit of transfer: a single line of text without its terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedLine(String);

impl ForwardedLine {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// Decode a raw line from the child, replacing invalid UTF-8.
    pub fn from_child_output(raw: &[u8]) -> Self {
        let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        Self(String::from_utf8_lossy(raw).into_owned())
    }

    /// Text carried by a transport message. Control frames carry none.
    pub fn from_message(message: Message) -> Result<Option<Self>> {
        match message {
            Message::Text(text) => Ok(Some(Self(text.as_str().to_owned()))),
            Message::Binary(bytes) => std::str::from_utf8(&bytes)
                .map(|text| Some(Self(text.to_owned())))
                .map_err(|_| PipeError::InvalidUtf8),
            Message::Ping(_) | Message::Pong(_) | Message::Close(_) | Message::Frame(_) => Ok(None),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_gui_log(&self) -> bool {
        self.0.starts_with(GUI_LOG_PREFIX)
    }

    pub fn into_message(self) -> Message {
        Message::text(self.0)
    }

    fn preview(&self) -> String {
        self.0.chars().take(PREVIEW_CHARS).collect()
    }
}

/// Why a pump stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// The source reached end-of-stream or the remote closed cooperatively.
    SourceClosed,
    /// The session cancelled the pump.
    Cancelled,
}

/// Remote -> child stdin. Closes stdin on the way out so the child sees EOF.
pub async fn remote_to_process<S, E, W>(
    mut source: S,
    mut stdin: LineWriter<W>,
    cancel: CancellationToken,
) -> Result<PumpExit>
where
    S: Stream<Item = std::result::Result<Message, E>> + Unpin,
    PipeError: From<E>,
    W: AsyncWrite + Unpin,
{
    let exit = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break Ok(PumpExit::Cancelled),
            next = source.next() => next,
        };

        let message = match next {
            None => {
                info!("Remote stream ended");
                break Ok(PumpExit::SourceClosed);
            }
            Some(Err(e)) => break Err(PipeError::from(e)),
            Some(Ok(Message::Close(frame))) => {
                info!("Remote closed the connection: {:?}", frame);
                break Ok(PumpExit::SourceClosed);
            }
            Some(Ok(message)) => message,
        };

        let line = match ForwardedLine::from_message(message) {
            Ok(Some(line)) => line,
            Ok(None) => continue,
            Err(e) => break Err(e),
        };

        debug!("<< {}", line.preview());
        if let Err(e) = stdin.write_line(line.as_str()).await {
            break Err(e);
        }
    };

    if let Err(e) = stdin.close().await {
        debug!("Closing child stdin: {}", e);
    }
    if let Err(e) = &exit {
        error!("Error in remote to process pipe: {}", e);
    }
    exit
}

/// Child stdout -> remote. Tagged and untagged lines are sent the same way.
/// Sends a close frame only when cancelled.
pub async fn process_to_remote<R, Si>(
    mut stdout: LineReader<R>,
    mut sink: Si,
    cancel: CancellationToken,
) -> Result<PumpExit>
where
    R: AsyncRead + Unpin,
    Si: Sink<Message> + Unpin,
    PipeError: From<Si::Error>,
{
    let exit = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break Ok(PumpExit::Cancelled),
            next = stdout.next_line() => next,
        };

        let raw = match next {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                info!("Process has ended output");
                break Ok(PumpExit::SourceClosed);
            }
            Err(e) => break Err(e),
        };

        let line = ForwardedLine::from_child_output(&raw);
        if line.is_gui_log() {
            debug!("gui >> {}", line.preview());
        } else {
            debug!(">> {}", line.preview());
        }
        if let Err(e) = sink.send(line.into_message()).await {
            break Err(PipeError::from(e));
        }
    };

    // On stdout EOF the transport stays up for the inbound leg.
    match &exit {
        Ok(PumpExit::Cancelled) => {
            if sink.close().await.is_err() {
                debug!("Transport already closed");
            }
        }
        Ok(PumpExit::SourceClosed) => {}
        Err(e) => error!("Error in process to remote pipe: {}", e),
    }
    exit
}

/// Child stderr -> local diagnostic sink, byte for byte.
pub async fn process_stderr_to_diagnostics<R, W>(
    mut stderr: LineReader<R>,
    mut diagnostics: W,
    cancel: CancellationToken,
) -> Result<PumpExit>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let exit = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break Ok(PumpExit::Cancelled),
            next = stderr.next_line() => next,
        };

        let raw = match next {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                info!("Process has ended stderr output");
                break Ok(PumpExit::SourceClosed);
            }
            Err(e) => break Err(e),
        };

        if let Err(e) = diagnostics.write_all(&raw).await {
            break Err(PipeError::Io(e));
        }
        if let Err(e) = diagnostics.flush().await {
            break Err(PipeError::Io(e));
        }
    };

    if let Err(e) = &exit {
        error!("Error in process stderr pipe: {}", e);
    }
    exit
}

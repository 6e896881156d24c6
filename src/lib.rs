//! mcp-pipe - bridge a remote WebSocket endpoint to a local child process
//!
//! The pipe keeps one WebSocket connection open at all times and relays it,
//! line by line, to the standard streams of a freshly spawned child.
//!
//! ## Components
//!
//! - **Process Bridge**: spawning, line-oriented stdio and two-phase teardown
//! - **Stream Pumps**: remote -> stdin, stdout -> remote, stderr -> diagnostics
//! - **Connection Session**: one connect, spawn, pump, teardown cycle
//! - **Connection Supervisor**: endless reconnection with jittered back-off

pub mod config;
pub mod error;
pub mod logging;
pub mod process;
pub mod pump;
pub mod session;
pub mod supervisor;

// Re-export commonly used types
pub use config::{resolve_endpoint, PipeSettings};
pub use error::{PipeError, Result};
pub use process::{ChildCommand, ProcessBridge, ShutdownSignals};
pub use pump::{gui_log, ForwardedLine, GUI_LOG_PREFIX};
pub use session::{ConnectionSession, SessionEnd};
pub use supervisor::{ConnectionSupervisor, RetryConfig, RetryState};

pub mod bridge;
pub mod lifecycle;
pub mod signals;

pub use bridge::{ChildCommand, ChildHandle, ChildPipes, LineReader, LineWriter, ProcessBridge};
pub use lifecycle::{ExitStatus, Termination};
pub use signals::{ChildSignaller, ShutdownSignals, SignalEvent};

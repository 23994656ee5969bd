//! The bridged shell.
//!
//! [`pty`] owns the shell process and its terminal; [`aggregator`] turns the
//! terminal's output stream into quiet-window-delimited chunks.

pub mod aggregator;
pub mod pty;

pub use aggregator::{FinishReason, OutputAggregator, OutputChunk};
pub use pty::{PtyError, PtyOutput, PtyProcess, ReadOutcome, ShellInput, ShellStatus, TERM_VALUE};

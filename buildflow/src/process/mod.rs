//! External process execution.
//!
//! This module provides:
//! - [`ProcessRunner`]: spawn, stream, timeout with terminate/kill escalation
//! - [`ProcessHandle`]: the runner's current-process slot used to cancel it

mod handle;
mod runner;

pub use handle::ProcessHandle;
pub use runner::{
    OutputChunk, OutputObserver, ProcessOutput, ProcessRunner, ProcessSpec, KILL_GRACE_PERIOD,
};

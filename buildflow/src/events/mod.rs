//! Progress reporting.
//!
//! Every phase transition, step dispatch, retry and captured output chunk is
//! reported as a [`ProgressEvent`] to a [`ProgressSink`].

mod sink;

pub use sink::{CollectingProgressSink, LoggingProgressSink, NoOpProgressSink, ProgressSink};

use crate::core::{OutputStream, PipelinePhase};
use serde::{Deserialize, Serialize};

/// Percent value reported when progress cannot be estimated.
pub const INDETERMINATE: i32 = -1;

/// A single progress notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// The phase emitting the event.
    pub phase: PipelinePhase,
    /// Human-readable message.
    pub message: String,
    /// Completion percentage, or [`INDETERMINATE`].
    pub percent: i32,
    /// 1-based index of the current item within the phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<usize>,
    /// Number of items in the phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<usize>,
    /// A line captured from a child's stdout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_chunk: Option<String>,
    /// A line captured from a child's stderr.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_chunk: Option<String>,
}

impl ProgressEvent {
    /// Creates an indeterminate event.
    #[must_use]
    pub fn new(phase: PipelinePhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            percent: INDETERMINATE,
            current_step: None,
            total_steps: None,
            stdout_chunk: None,
            stderr_chunk: None,
        }
    }

    /// Sets the completion percentage.
    #[must_use]
    pub fn with_percent(mut self, percent: i32) -> Self {
        self.percent = percent.clamp(INDETERMINATE, 100);
        self
    }

    /// Sets the step position and derives a percentage from it.
    #[must_use]
    pub fn with_step(mut self, current: usize, total: usize) -> Self {
        self.current_step = Some(current);
        self.total_steps = Some(total);
        if total > 0 && self.percent == INDETERMINATE {
            let pct = (current.saturating_sub(1) * 100) / total;
            self.percent = i32::try_from(pct).unwrap_or(100);
        }
        self
    }

    /// Attaches a stdout line.
    #[must_use]
    pub fn with_stdout(mut self, chunk: impl Into<String>) -> Self {
        self.stdout_chunk = Some(chunk.into());
        self
    }

    /// Attaches a stderr line.
    #[must_use]
    pub fn with_stderr(mut self, chunk: impl Into<String>) -> Self {
        self.stderr_chunk = Some(chunk.into());
        self
    }

    /// Attaches a line to the field matching its stream.
    #[must_use]
    pub fn with_output(self, stream: OutputStream, chunk: impl Into<String>) -> Self {
        match stream {
            OutputStream::Stdout => self.with_stdout(chunk),
            OutputStream::Stderr => self.with_stderr(chunk),
        }
    }
}

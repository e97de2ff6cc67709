//! Core domain enums shared by every layer of the engine.
//!
//! - Step status and kind
//! - Pipeline phases
//! - Process output streams

mod status;

pub use status::{OutputStream, PipelinePhase, StepKind, StepStatus};

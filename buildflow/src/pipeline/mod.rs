//! Multi-repository pipeline runs.
//!
//! This module provides:
//! - [`PipelineConfig`]: the declarative, JSON-loadable pipeline definition
//! - [`PipelineOptions`]: component selection and phase switches for one run
//! - [`Orchestrator`]: the clone → build → image build → verify state machine
//! - [`PipelineResult`]: the run record, serializable as the JSON report

mod config;
mod options;
mod orchestrator;
mod result;

pub use config::{
    infer_step_kind, BuildOrder, BuildStepConfig, Component, ImageBuildDescriptor, PipelineConfig,
    RepositoryDescriptor,
};
pub use options::PipelineOptions;
pub use orchestrator::{Orchestrator, VERIFY_ARTIFACTS};
pub use result::PipelineResult;

//! # Buildflow
//!
//! A build pipeline orchestration engine for multi-repository projects.
//!
//! Buildflow clones a set of repositories, resolves their dependency order,
//! runs each repository's build steps as shell processes, builds container
//! images and verifies build artifacts. It provides:
//!
//! - **Dependency resolution**: cycle detection and deterministic topological order
//! - **Build chains**: ordered steps with dependency skips and per-kind retries
//! - **Process supervision**: timeouts, streamed output and graceful termination
//! - **Cancellation**: a shared token that stops the running process and skips the rest
//! - **Progress reporting**: structured events for every phase and step
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use buildflow::prelude::*;
//!
//! let config = PipelineConfig::load("pipeline.json")?;
//! let orchestrator = Orchestrator::new(config, PipelineOptions::new())
//!     .with_sink(Arc::new(LoggingProgressSink::default()));
//!
//! let result = orchestrator.run().await;
//! println!("{}", result.summary());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod chain;
pub mod collaborators;
pub mod core;
pub mod errors;
pub mod events;
pub mod graph;
pub mod observability;
pub mod pipeline;
pub mod process;
pub mod retry;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::chain::{
        BuildChainExecutor, ChainConfig, ChainResult, ImageSpec, KindRetryPolicies, Step,
        StepResult,
    };
    pub use crate::collaborators::{
        CloneCollaborator, DockerImageBuilder, GitCloner, ImageBuildCollaborator,
    };
    pub use crate::core::{OutputStream, PipelinePhase, StepKind, StepStatus};
    pub use crate::errors::{
        BuildflowError, ConfigError, ErrorKind, GraphError, PipelineError, ProcessError,
        ValidationError,
    };
    pub use crate::events::{
        CollectingProgressSink, LoggingProgressSink, NoOpProgressSink, ProgressEvent,
        ProgressSink,
    };
    pub use crate::graph::DependencyGraph;
    pub use crate::pipeline::{
        BuildStepConfig, Orchestrator, PipelineConfig, PipelineOptions, PipelineResult,
        RepositoryDescriptor,
    };
    pub use crate::process::{ProcessOutput, ProcessRunner, ProcessSpec};
    pub use crate::retry::{RetryExecutor, RetryPolicy};
}

//! Error types for the buildflow engine.
//!
//! Every failure is classified into one of four [`ErrorKind`]s before it is
//! allowed to propagate, so that the pipeline can decide between aborting and
//! recording without inspecting message text.

use crate::core::PipelinePhase;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for buildflow operations.
#[derive(Debug, Error)]
pub enum BuildflowError {
    /// A configuration or graph validation error occurred.
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// The dependency graph is malformed.
    #[error("{0}")]
    Graph(#[from] GraphError),

    /// The configuration document could not be loaded.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// An external process failed.
    #[error("{0}")]
    Process(#[from] ProcessError),

    /// A pipeline phase failed.
    #[error("{0}")]
    Phase(#[from] PipelineError),

    /// A cancellation occurred.
    #[error("Pipeline cancelled: {0}")]
    Cancelled(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildflowError {
    /// Returns the classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::Graph(_) | Self::Config(_) => ErrorKind::Validation,
            Self::Process(e) => e.kind(),
            Self::Phase(e) => e.kind,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Io(_) => ErrorKind::FatalEnvironment,
        }
    }
}

/// Classification of a failure, deciding how it propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed configuration, unknown dependency or cycle. Never retried.
    Validation,
    /// Non-zero exit, timeout, connection refusal. Retried up to policy limits.
    Transient,
    /// Missing required input on a non-optional item. Aborts, never retried.
    FatalEnvironment,
    /// Recorded and execution continues.
    NonFatal,
    /// The user cancelled the run.
    Cancelled,
}

/// Machine-readable metadata attached to validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ErrorInfo {
    /// Error code (e.g., "GRAPH-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Errors produced while validating a dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// The same node id appears twice.
    #[error("Duplicate node '{node}' in dependency graph")]
    DuplicateNode {
        /// The repeated id.
        node: String,
    },

    /// A node depends on an id that is not part of the graph.
    #[error("Node '{node}' depends on unknown node '{dependency}'")]
    UnknownDependency {
        /// The node declaring the dependency.
        node: String,
        /// The missing dependency id.
        dependency: String,
    },

    /// The graph contains a cycle.
    #[error("Dependency cycle detected: {}", path.join(" -> "))]
    Cycle {
        /// The nodes forming the cycle; first and last entries are equal.
        path: Vec<String>,
    },
}

impl GraphError {
    /// Returns the node ids involved in the error.
    #[must_use]
    pub fn nodes(&self) -> Vec<String> {
        match self {
            Self::DuplicateNode { node } => vec![node.clone()],
            Self::UnknownDependency { node, dependency } => vec![node.clone(), dependency.clone()],
            Self::Cycle { path } => path.clone(),
        }
    }

    /// Returns diagnostic metadata for the error.
    #[must_use]
    pub fn info(&self) -> ErrorInfo {
        match self {
            Self::DuplicateNode { node } => {
                ErrorInfo::new("GRAPH-DUPLICATE", format!("Node '{node}' is declared twice"))
                    .with_fix_hint("Give every step or repository a unique id.")
            }
            Self::UnknownDependency { node, dependency } => ErrorInfo::new(
                "GRAPH-UNKNOWN-DEP",
                format!("Dependency '{dependency}' not found"),
            )
            .with_fix_hint("Check the dependency id for typos or add the missing node.")
            .with_context_entry("node", node.clone()),
            Self::Cycle { path } => ErrorInfo::new(
                "GRAPH-CYCLE",
                format!("Graph contains a dependency cycle: {}", path.join(" -> ")),
            )
            .with_fix_hint("Remove one of the dependencies in the cycle to break it."),
        }
    }
}

/// Error raised when configuration or graph validation fails.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ValidationError {
    /// The error message.
    pub message: String,
    /// The steps, repositories or components involved.
    pub items: Vec<String>,
    /// Optional diagnostic metadata.
    pub error_info: Option<ErrorInfo>,
}

impl ValidationError {
    /// Creates a new validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            items: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the items involved.
    #[must_use]
    pub fn with_items(mut self, items: Vec<String>) -> Self {
        self.items = items;
        self
    }

    /// Sets the diagnostic metadata.
    #[must_use]
    pub fn with_error_info(mut self, info: ErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }
}

impl From<GraphError> for ValidationError {
    fn from(err: GraphError) -> Self {
        Self {
            message: err.to_string(),
            items: err.nodes(),
            error_info: Some(err.info()),
        }
    }
}

/// Errors raised while loading a configuration document.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Failed to read configuration '{}': {source}", path.display())]
    Io {
        /// The configuration path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid JSON or is missing required fields.
    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// The document parsed but is semantically invalid.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors raised by the process runner.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    /// The process could not be started at all.
    #[error("Failed to spawn '{command}': {message}")]
    Spawn {
        /// The command line.
        command: String,
        /// The OS error message.
        message: String,
    },

    /// The requested working directory does not exist.
    #[error("Working directory does not exist: {}", path.display())]
    MissingWorkingDirectory {
        /// The missing directory.
        path: PathBuf,
    },

    /// The process exited unsuccessfully.
    #[error("Command '{command}' exited with code {}: {stderr}", code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    NonZeroExit {
        /// The command line.
        command: String,
        /// The exit code, `None` when terminated by a signal.
        code: Option<i32>,
        /// The full captured stderr.
        stderr: String,
    },

    /// The process exceeded its timeout and was terminated.
    #[error("Command '{command}' timed out after {timeout_ms}ms")]
    TimedOut {
        /// The command line.
        command: String,
        /// The configured timeout.
        timeout_ms: u64,
    },

    /// The process was cancelled through its handle.
    #[error("Command '{command}' was cancelled")]
    Cancelled {
        /// The command line.
        command: String,
    },

    /// Reading output or waiting on the child failed.
    #[error("I/O error while running '{command}': {message}")]
    Io {
        /// The command line.
        command: String,
        /// The error message.
        message: String,
    },
}

impl ProcessError {
    /// Returns the classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Spawn { .. } | Self::MissingWorkingDirectory { .. } => ErrorKind::FatalEnvironment,
            Self::NonZeroExit { .. } | Self::TimedOut { .. } | Self::Io { .. } => ErrorKind::Transient,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Returns true for failures another attempt could fix.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Returns the exit code, if the process exited on its own.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::NonZeroExit { code, .. } => *code,
            _ => None,
        }
    }
}

/// A classified failure recorded against a pipeline phase and component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("[{phase}] {component}: {message}")]
pub struct PipelineError {
    /// The phase in which the failure happened.
    pub phase: PipelinePhase,
    /// The repository, step or component id.
    pub component: String,
    /// Human-readable description.
    pub message: String,
    /// Classification used for propagation decisions.
    pub kind: ErrorKind,
}

impl PipelineError {
    /// Creates a new pipeline error.
    #[must_use]
    pub fn new(
        phase: PipelinePhase,
        component: impl Into<String>,
        message: impl Into<String>,
        kind: ErrorKind,
    ) -> Self {
        Self {
            phase,
            component: component.into(),
            message: message.into(),
            kind,
        }
    }

    /// Creates a non-fatal error.
    #[must_use]
    pub fn non_fatal(
        phase: PipelinePhase,
        component: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(phase, component, message, ErrorKind::NonFatal)
    }

    /// Creates a validation error raised during initialization.
    #[must_use]
    pub fn validation(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(PipelinePhase::Initializing, component, message, ErrorKind::Validation)
    }

    /// Creates the error recorded when the user cancels a phase.
    #[must_use]
    pub fn cancelled(phase: PipelinePhase, component: impl Into<String>) -> Self {
        Self::new(phase, component, "cancelled by user", ErrorKind::Cancelled)
    }

    /// Returns true if this error should abort the run.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.kind != ErrorKind::NonFatal
    }
}

//! Step status, step kind and pipeline phase enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of work a build step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Installs third-party dependencies (`npm install`, `pip install`, ...).
    DependencyInstall,
    /// Runs a project build script (`npm run build`, `cargo build`, ...).
    BuildScript,
    /// Builds a container image.
    ImageBuild,
    /// Any other command.
    CustomScript,
}

impl Default for StepKind {
    fn default() -> Self {
        Self::CustomScript
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DependencyInstall => write!(f, "dependency_install"),
            Self::BuildScript => write!(f, "build_script"),
            Self::ImageBuild => write!(f, "image_build"),
            Self::CustomScript => write!(f, "custom_script"),
        }
    }
}

/// The execution status of a build step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Step has not been visited yet.
    Pending,
    /// Step is currently running.
    InProgress,
    /// Step finished successfully.
    Completed,
    /// Step ran and failed.
    Failed,
    /// Step was never attempted.
    Skipped,
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl StepStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// The phases of a pipeline run.
///
/// `Failed` and `Cancelled` are terminal and reachable from every
/// in-progress phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    /// Loading configuration and resolving build order.
    Initializing,
    /// Cloning repositories.
    Cloning,
    /// Running build steps.
    Building,
    /// Building container images.
    ImageBuilding,
    /// Checking for build artifacts.
    Verifying,
    /// The run finished.
    Complete,
    /// The run aborted on a fatal error.
    Failed,
    /// The run was cancelled by the user.
    Cancelled,
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Cloning => write!(f, "cloning"),
            Self::Building => write!(f, "building"),
            Self::ImageBuilding => write!(f, "image_building"),
            Self::Verifying => write!(f, "verifying"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl PipelinePhase {
    /// Returns true if no further transitions are possible.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }
}

/// Which output stream of a child process a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

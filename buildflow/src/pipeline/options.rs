//! Per-run options.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Options controlling one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    /// Components to run; every enabled component when empty.
    pub selected_components: Vec<String>,
    /// Skip the cloning phase.
    pub skip_clone: bool,
    /// Skip the building phase.
    pub skip_build: bool,
    /// Skip the image building phase.
    pub skip_image_build: bool,
    /// Skip the verification phase.
    pub skip_verify: bool,
    /// Re-clone repositories whose target already exists.
    pub force: bool,
    /// Overrides the configuration's base clone path.
    pub working_directory: Option<PathBuf>,
}

impl PipelineOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects a component.
    #[must_use]
    pub fn with_component(mut self, id: impl Into<String>) -> Self {
        self.selected_components.push(id.into());
        self
    }

    /// Skips cloning.
    #[must_use]
    pub fn skip_clone(mut self) -> Self {
        self.skip_clone = true;
        self
    }

    /// Skips building.
    #[must_use]
    pub fn skip_build(mut self) -> Self {
        self.skip_build = true;
        self
    }

    /// Skips image building.
    #[must_use]
    pub fn skip_image_build(mut self) -> Self {
        self.skip_image_build = true;
        self
    }

    /// Skips verification.
    #[must_use]
    pub fn skip_verify(mut self) -> Self {
        self.skip_verify = true;
        self
    }

    /// Re-clones existing targets.
    #[must_use]
    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }

    /// Overrides the base clone path.
    #[must_use]
    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }
}

//! Build steps and their per-run results.

use crate::collaborators::ImageBuildOptions;
use crate::core::{StepKind, StepStatus};
use crate::errors::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Reason recorded on steps skipped after a chain abort.
pub const SKIPPED_PREVIOUS_FAILURE: &str = "skipped due to previous failure";

/// Reason recorded on steps skipped after cancellation.
pub const SKIPPED_CANCELLED: &str = "cancelled";

/// Describes a container image to build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSpec {
    /// Image repository name (e.g. `acme/web`).
    pub repository: String,
    /// Image tag.
    pub tag: String,
    /// Build context directory.
    pub context: PathBuf,
    /// Build file; `<context>/Dockerfile` when unset.
    #[serde(alias = "dockerfile")]
    pub build_file: Option<PathBuf>,
    /// `--build-arg` values.
    pub build_args: HashMap<String, String>,
    /// Multi-stage target.
    pub target: Option<String>,
    /// Target platform (e.g. `linux/amd64`).
    pub platform: Option<String>,
    /// Disable the layer cache.
    pub no_cache: bool,
}

impl ImageSpec {
    /// Creates an image spec.
    #[must_use]
    pub fn new(repository: impl Into<String>, tag: impl Into<String>, context: impl Into<PathBuf>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
            context: context.into(),
            ..Self::default()
        }
    }

    /// Returns `repository:tag`, or just the repository when the tag is empty.
    #[must_use]
    pub fn image_name(&self) -> String {
        if self.tag.is_empty() {
            self.repository.clone()
        } else {
            format!("{}:{}", self.repository, self.tag)
        }
    }

    /// Returns the options passed to an image build collaborator.
    #[must_use]
    pub fn build_options(&self) -> ImageBuildOptions {
        ImageBuildOptions {
            build_file: Some(self.resolved_build_file()),
            build_args: self.build_args.clone(),
            target: self.target.clone(),
            platform: self.platform.clone(),
            no_cache: self.no_cache,
            ..ImageBuildOptions::default()
        }
    }

    /// Returns the build file path, defaulting to `Dockerfile` in the context.
    #[must_use]
    pub fn resolved_build_file(&self) -> PathBuf {
        self.build_file
            .clone()
            .unwrap_or_else(|| self.context.join("Dockerfile"))
    }
}

/// Kind-specific options of a step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    /// Command line. Install and build steps fall back to npm defaults; image
    /// builds fall back to a `docker build` derived from [`image`](Self::image).
    pub command: Option<String>,
    /// Working directory; relative paths resolve against the chain's
    /// working directory.
    pub working_dir: Option<PathBuf>,
    /// Hard timeout in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Environment overrides.
    pub env: HashMap<String, String>,
    /// Extra arguments appended to the command.
    pub flags: Vec<String>,
    /// Image to build, for image-build steps.
    pub image: Option<ImageSpec>,
    /// Shell override.
    pub shell: Option<String>,
}

/// A unit of work inside a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Unique id within the chain.
    pub id: String,
    /// Display name.
    pub name: String,
    /// What the step does.
    pub kind: StepKind,
    /// Kind-specific options.
    #[serde(default)]
    pub config: StepConfig,
    /// Ids of steps that must complete first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Keep the chain going when this step fails.
    #[serde(default)]
    pub continue_on_failure: bool,
    /// Current status.
    #[serde(default)]
    pub status: StepStatus,
    /// When execution started.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When execution ended.
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Captured stdout lines.
    #[serde(default)]
    pub stdout: Vec<String>,
    /// Captured stderr lines.
    #[serde(default)]
    pub stderr: Vec<String>,
    /// Failure or skip reason.
    #[serde(default)]
    pub error: Option<String>,
}

impl Step {
    /// Creates a pending step.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            config: StepConfig::default(),
            depends_on: Vec::new(),
            continue_on_failure: false,
            status: StepStatus::Pending,
            started_at: None,
            ended_at: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            error: None,
        }
    }

    /// Sets the command.
    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.config.command = Some(command.into());
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.working_dir = Some(dir.into());
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.timeout_ms = Some(timeout_ms);
        self
    }

    /// Adds an environment override.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.insert(key.into(), value.into());
        self
    }

    /// Sets the image to build.
    #[must_use]
    pub fn with_image(mut self, image: ImageSpec) -> Self {
        self.config.image = Some(image);
        self
    }

    /// Adds a dependency.
    #[must_use]
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        if !self.depends_on.contains(&id) {
            self.depends_on.push(id);
        }
        self
    }

    /// Lets the chain continue when this step fails.
    #[must_use]
    pub fn continue_on_failure(mut self) -> Self {
        self.continue_on_failure = true;
        self
    }

    /// Wall-clock duration of the step's execution, if it ran.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => u64::try_from((end - start).num_milliseconds()).unwrap_or(0),
            _ => 0,
        }
    }

    pub(crate) fn mark_in_progress(&mut self) {
        self.status = StepStatus::InProgress;
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn mark_completed(&mut self) {
        self.status = StepStatus::Completed;
        self.ended_at = Some(Utc::now());
        self.error = None;
    }

    pub(crate) fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.ended_at = Some(Utc::now());
        self.error = Some(error.into());
    }

    pub(crate) fn mark_skipped(&mut self, reason: impl Into<String>) {
        self.status = StepStatus::Skipped;
        self.error = Some(reason.into());
    }
}

/// Outcome of one step within a [`ChainResult`](super::ChainResult).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    /// Snapshot of the step after the run, including captured output.
    pub step: Step,
    /// Whether the step completed.
    pub success: bool,
    /// Human-readable outcome.
    pub message: String,
    /// Execution time in milliseconds; zero for skipped steps.
    pub duration_ms: u64,
    /// Attempts made; zero for skipped steps.
    pub attempts: u32,
    /// Classification of the failure, for failed steps.
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
}

impl StepResult {
    /// Captured stdout lines.
    #[must_use]
    pub fn stdout(&self) -> &[String] {
        &self.step.stdout
    }

    /// Captured stderr lines.
    #[must_use]
    pub fn stderr(&self) -> &[String] {
        &self.step.stderr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_builder() {
        let step = Step::new("build", "Build", StepKind::BuildScript)
            .with_command("make")
            .depends_on("install")
            .depends_on("install")
            .continue_on_failure();

        assert_eq!(step.depends_on, vec!["install".to_string()]);
        assert!(step.continue_on_failure);
        assert_eq!(step.status, StepStatus::Pending);
    }

    #[test]
    fn test_image_spec_defaults() {
        let image = ImageSpec::new("acme/web", "1.2", "/src/web");
        assert_eq!(image.image_name(), "acme/web:1.2");
        assert_eq!(image.resolved_build_file(), PathBuf::from("/src/web/Dockerfile"));
        assert_eq!(ImageSpec::new("acme/web", "", ".").image_name(), "acme/web");
    }

    #[test]
    fn test_step_deserialize_minimal() {
        let step: Step = serde_json::from_str(
            r#"{"id": "lint", "name": "Lint", "kind": "custom_script", "config": {"command": "npm run lint"}}"#,
        )
        .unwrap();

        assert_eq!(step.kind, StepKind::CustomScript);
        assert_eq!(step.config.command.as_deref(), Some("npm run lint"));
        assert!(step.depends_on.is_empty());
    }

    #[test]
    fn test_status_transitions_record_times() {
        let mut step = Step::new("a", "A", StepKind::CustomScript);
        step.mark_in_progress();
        assert!(step.started_at.is_some());
        step.mark_failed("boom");
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.error.as_deref(), Some("boom"));
        assert!(step.ended_at.is_some());
    }
}

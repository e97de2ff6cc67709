//! The multi-phase pipeline state machine.

use super::config::{BuildStepConfig, PipelineConfig, RepositoryDescriptor};
use super::options::PipelineOptions;
use super::result::PipelineResult;
use crate::cancellation::CancellationToken;
use crate::chain::{BuildChainExecutor, ChainConfig, ImageSpec, Step};
use crate::collaborators::{
    CloneCollaborator, CloneOptions, DockerImageBuilder, GitCloner, ImageBuildCollaborator,
};
use crate::core::{PipelinePhase, StepStatus};
use crate::errors::{ErrorKind, PipelineError, ValidationError};
use crate::events::{NoOpProgressSink, ProgressEvent, ProgressSink};
use crate::graph::DependencyGraph;
use crate::process::ProcessRunner;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Paths whose presence marks a repository as having produced output.
pub const VERIFY_ARTIFACTS: &[&str] = &["dist", "build", "target/release", "out", "node_modules", ".next"];

const CANCEL_REASON: &str = "cancelled by user";

/// Why a run stopped before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    Failed,
    Cancelled,
}

/// Drives a run through `initializing → cloning → building →
/// image_building → verifying → complete`.
///
/// Every phase works through its items one at a time and checks the
/// cancellation token before each item. A run always yields a
/// [`PipelineResult`], including when validation fails up front.
pub struct Orchestrator {
    config: PipelineConfig,
    options: PipelineOptions,
    runner: ProcessRunner,
    cloner: Arc<dyn CloneCollaborator>,
    image_builder: Arc<dyn ImageBuildCollaborator>,
    sink: Arc<dyn ProgressSink>,
    token: Arc<CancellationToken>,
    phase: Mutex<PipelinePhase>,
    cancel_hooked: AtomicBool,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("options", &self.options)
            .field("runner", &self.runner)
            .field("phase", &self.phase())
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator using `git` and `docker` from `PATH`.
    #[must_use]
    pub fn new(config: PipelineConfig, options: PipelineOptions) -> Self {
        Self {
            config,
            options,
            runner: ProcessRunner::new(),
            cloner: Arc::new(GitCloner::new()),
            image_builder: Arc::new(DockerImageBuilder::new()),
            sink: Arc::new(NoOpProgressSink),
            token: Arc::new(CancellationToken::new()),
            phase: Mutex::new(PipelinePhase::Initializing),
            cancel_hooked: AtomicBool::new(false),
        }
    }

    /// Uses a specific runner for build steps.
    #[must_use]
    pub fn with_runner(mut self, runner: ProcessRunner) -> Self {
        self.runner = runner;
        self
    }

    /// Uses a specific clone collaborator.
    #[must_use]
    pub fn with_cloner(mut self, cloner: Arc<dyn CloneCollaborator>) -> Self {
        self.cloner = cloner;
        self
    }

    /// Uses a specific image build collaborator.
    #[must_use]
    pub fn with_image_builder(mut self, builder: Arc<dyn ImageBuildCollaborator>) -> Self {
        self.image_builder = builder;
        self
    }

    /// Reports progress to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Shares an externally owned cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: Arc<CancellationToken>) -> Self {
        self.token = token;
        self
    }

    /// Returns the cancellation token of this orchestrator.
    #[must_use]
    pub fn cancellation_token(&self) -> Arc<CancellationToken> {
        self.token.clone()
    }

    /// Requests cancellation. The running command, if any, is terminated
    /// and the run ends in [`PipelinePhase::Cancelled`].
    pub fn cancel(&self) {
        self.token.cancel(CANCEL_REASON);
    }

    /// Returns the current phase.
    #[must_use]
    pub fn phase(&self) -> PipelinePhase {
        *self.phase.lock()
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn base_path(&self) -> &Path {
        self.options
            .working_directory
            .as_deref()
            .unwrap_or(&self.config.base_clone_path)
    }

    /// Validates the configuration and resolves the build graph of the
    /// selected repositories without running anything.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] for broken references, unknown
    /// components, duplicate ids or cycles.
    pub fn plan(&self) -> Result<DependencyGraph, ValidationError> {
        self.config.validate()?;
        let selected = self.config.select_repositories(&self.options.selected_components)?;
        self.config.build_graph(&selected)
    }

    /// Runs the pipeline.
    pub async fn run(&self) -> PipelineResult {
        let mut result = PipelineResult::started();
        info!(run_id = %result.run_id, "Starting pipeline run");

        if !self.cancel_hooked.swap(true, Ordering::SeqCst) {
            let handle = self.runner.handle();
            self.token.on_cancel(move || {
                handle.cancel();
            });
        }

        let phase = match self.drive(&mut result).await {
            Ok(()) => PipelinePhase::Complete,
            Err(Halt::Failed) => PipelinePhase::Failed,
            Err(Halt::Cancelled) => PipelinePhase::Cancelled,
        };
        let result = result.finish(phase);
        self.enter(phase, result.summary());

        match phase {
            PipelinePhase::Complete => info!(
                run_id = %result.run_id,
                duration_ms = result.duration_ms,
                errors = result.errors.len(),
                "Pipeline complete"
            ),
            PipelinePhase::Cancelled => warn!(run_id = %result.run_id, "Pipeline cancelled"),
            _ => error!(run_id = %result.run_id, summary = %result.summary(), "Pipeline failed"),
        }
        result
    }

    async fn drive(&self, result: &mut PipelineResult) -> Result<(), Halt> {
        self.enter(PipelinePhase::Initializing, "Validating configuration");
        let graph = self.plan().map_err(|e| {
            result.errors.push(PipelineError::validation("configuration", describe(&e)));
            Halt::Failed
        })?;
        let order = graph.order().map_err(|e| {
            result.errors.push(PipelineError::validation("configuration", e.to_string()));
            Halt::Failed
        })?;
        result.build_order = order;
        info!(order = ?result.build_order, "Resolved build order");

        let selected: Vec<&RepositoryDescriptor> = self
            .config
            .repositories
            .iter()
            .filter(|r| graph.nodes().contains(&r.id))
            .collect();

        if self.options.skip_clone {
            debug!("Skipping clone phase");
        } else {
            self.clone_phase(&selected, result).await?;
        }

        if self.options.skip_build {
            debug!("Skipping build phase");
        } else {
            self.build_phase(result).await?;
        }

        if self.options.skip_image_build {
            debug!("Skipping image build phase");
        } else {
            self.image_phase(result).await?;
        }

        if self.options.skip_verify {
            debug!("Skipping verify phase");
        } else {
            self.verify_phase(result)?;
        }
        Ok(())
    }

    fn enter(&self, phase: PipelinePhase, message: impl Into<String>) {
        *self.phase.lock() = phase;
        let message = message.into();
        info!(%phase, "{message}");
        self.sink.emit(&ProgressEvent::new(phase, message));
    }

    fn checkpoint(
        &self,
        result: &mut PipelineResult,
        phase: PipelinePhase,
        component: &str,
    ) -> Result<(), Halt> {
        if self.token.is_cancelled() {
            result.errors.push(PipelineError::cancelled(phase, component));
            return Err(Halt::Cancelled);
        }
        Ok(())
    }

    fn progress(&self, phase: PipelinePhase, message: String, current: usize, total: usize) {
        self.sink
            .emit(&ProgressEvent::new(phase, message).with_step(current, total));
    }

    async fn clone_phase(
        &self,
        repositories: &[&RepositoryDescriptor],
        result: &mut PipelineResult,
    ) -> Result<(), Halt> {
        const PHASE: PipelinePhase = PipelinePhase::Cloning;
        self.enter(PHASE, format!("Cloning {} repositories", repositories.len()));
        let base = self.base_path().to_path_buf();

        for (index, repo) in repositories.iter().enumerate() {
            self.checkpoint(result, PHASE, &repo.id)?;
            let target = repo.clone_path(&base);

            if target.exists() {
                if !self.options.force {
                    info!(repository = %repo.id, target = %target.display(), "Already cloned");
                    result.cloned_repositories.push(repo.id.clone());
                    continue;
                }
                debug!(repository = %repo.id, "Removing existing clone");
                if let Err(e) = tokio::fs::remove_dir_all(&target).await {
                    let message = format!("cannot remove existing clone {}: {e}", target.display());
                    if self.record_clone_failure(result, repo, message) {
                        return Err(Halt::Failed);
                    }
                    continue;
                }
            }

            self.progress(
                PHASE,
                format!("Cloning {}", repo.display_name()),
                index + 1,
                repositories.len(),
            );
            let outcome = self
                .cloner
                .clone_repository(&repo.url, &target, self.clone_options(repo), &self.token)
                .await;

            if outcome.success {
                info!(repository = %repo.id, "Cloned");
                result.cloned_repositories.push(repo.id.clone());
            } else if !self.token.is_cancelled() {
                let message = outcome.error.unwrap_or_else(|| "clone failed".to_string());
                if self.record_clone_failure(result, repo, message) {
                    return Err(Halt::Failed);
                }
            }
            self.checkpoint(result, PHASE, &repo.id)?;
        }
        Ok(())
    }

    /// Records a clone failure and returns true when it is fatal.
    fn record_clone_failure(
        &self,
        result: &mut PipelineResult,
        repo: &RepositoryDescriptor,
        message: String,
    ) -> bool {
        if repo.optional {
            warn!(repository = %repo.id, error = %message, "Optional repository failed to clone; skipping it");
            result
                .errors
                .push(PipelineError::non_fatal(PipelinePhase::Cloning, &repo.id, message));
            result.skipped_repositories.push(repo.id.clone());
            false
        } else {
            error!(repository = %repo.id, error = %message, "Required repository failed to clone");
            result.errors.push(PipelineError::new(
                PipelinePhase::Cloning,
                &repo.id,
                message,
                ErrorKind::FatalEnvironment,
            ));
            true
        }
    }

    fn clone_options(&self, repo: &RepositoryDescriptor) -> CloneOptions {
        let sink = self.sink.clone();
        let name = repo.display_name().to_string();
        let mut options = CloneOptions::default()
            .with_sparse_paths(repo.sparse_paths.clone())
            .with_progress(move |percent, message| {
                sink.emit(
                    &ProgressEvent::new(PipelinePhase::Cloning, format!("{name}: {message}"))
                        .with_percent(percent),
                );
            });
        options.branch = repo.branch.clone();
        options.depth = repo.depth;
        options
    }

    /// Build steps of the build order, ordered by repository then
    /// declaration, paired with their repository id.
    fn planned_steps(&self, order: &[String]) -> Vec<(String, Step)> {
        let base = self.base_path();
        let mut steps = Vec::new();
        for repo_id in order {
            let Some(repo) = self.config.repository(repo_id) else {
                continue;
            };
            let root = repo.clone_path(base);
            let configured = self
                .config
                .build_steps
                .iter()
                .filter(|s| &s.repository_id == repo_id);
            for (index, step) in configured.enumerate() {
                steps.push((repo_id.clone(), to_chain_step(repo_id, index, step, &root)));
            }
        }
        steps
    }

    async fn build_phase(&self, result: &mut PipelineResult) -> Result<(), Halt> {
        const PHASE: PipelinePhase = PipelinePhase::Building;
        self.checkpoint(result, PHASE, "build")?;

        let planned = self.planned_steps(&result.active_order());
        self.enter(PHASE, format!("Running {} build steps", planned.len()));
        if planned.is_empty() {
            return Ok(());
        }

        let owners: HashMap<String, String> = planned
            .iter()
            .map(|(repo, step)| (step.id.clone(), repo.clone()))
            .collect();
        let steps: Vec<Step> = planned.into_iter().map(|(_, step)| step).collect();

        let mut chain_config = ChainConfig::default().with_retry(self.config.retry.clone());
        chain_config.env = self.config.global_env.clone();

        let executor = BuildChainExecutor::new(self.runner.clone(), self.sink.clone())
            .with_cancellation(self.token.clone())
            .with_phase(PHASE);
        let chain = executor.run(steps, &chain_config).await.map_err(|e| {
            result.errors.push(PipelineError::validation("build steps", describe(&e)));
            Halt::Failed
        })?;

        let mut fatal = false;
        for step_result in chain.failed() {
            let step = &step_result.step;
            let owner = owners.get(&step.id).map_or(step.id.as_str(), String::as_str);
            let message = format!("{}: {}", step.name, step_result.message);
            if step.continue_on_failure {
                result.errors.push(PipelineError::non_fatal(PHASE, owner, message));
            } else {
                fatal = true;
                let kind = step_result.error_kind.unwrap_or(ErrorKind::Transient);
                result.errors.push(PipelineError::new(PHASE, owner, message, kind));
            }
        }

        for repo_id in &result.active_order() {
            let mut owned = chain
                .step_results
                .iter()
                .filter(|r| owners.get(&r.step.id) == Some(repo_id))
                .peekable();
            if owned.peek().is_some() && owned.all(|r| r.step.status == StepStatus::Completed) {
                result.built_repositories.push(repo_id.clone());
            }
        }
        result.steps = chain.step_results;

        if chain.cancelled || self.token.is_cancelled() {
            result.errors.push(PipelineError::cancelled(PHASE, "build"));
            return Err(Halt::Cancelled);
        }
        if fatal {
            return Err(Halt::Failed);
        }
        Ok(())
    }

    async fn image_phase(&self, result: &mut PipelineResult) -> Result<(), Halt> {
        const PHASE: PipelinePhase = PipelinePhase::ImageBuilding;
        let base = self.base_path().to_path_buf();
        let order = result.active_order();
        let targets: Vec<(&RepositoryDescriptor, &ImageSpec)> = order
            .iter()
            .filter_map(|id| Some((self.config.repository(id)?, self.config.image_builds.get(id)?)))
            .collect();
        self.enter(PHASE, format!("Building {} images", targets.len()));

        for (index, (repo, image)) in targets.iter().enumerate() {
            self.checkpoint(result, PHASE, &repo.id)?;

            let root = repo.clone_path(&base);
            let context = resolve_under(&root, &image.context);
            let build_file = image
                .build_file
                .as_ref()
                .map_or_else(|| context.join("Dockerfile"), |f| resolve_under(&context, f));
            if !build_file.exists() {
                info!(repository = %repo.id, build_file = %build_file.display(), "No build file, skipping image");
                self.sink.emit(&ProgressEvent::new(
                    PHASE,
                    format!("Skipping image for {}: no build file", repo.display_name()),
                ));
                continue;
            }

            let image_name = image.image_name();
            self.progress(PHASE, format!("Building image {image_name}"), index + 1, targets.len());

            let mut options = image.build_options();
            options.build_file = Some(build_file);
            let sink = self.sink.clone();
            options.on_progress = Some(Arc::new(move |percent: i32, line: &str| {
                sink.emit(&ProgressEvent::new(PHASE, "output").with_percent(percent).with_stdout(line));
            }));

            let outcome = self
                .image_builder
                .build(&context, &image_name, options, &self.token)
                .await;

            if outcome.success {
                info!(repository = %repo.id, image = %image_name, "Image built");
                result.image_built_repositories.push(repo.id.clone());
            } else if !self.token.is_cancelled() {
                let message = outcome.error.unwrap_or_else(|| "image build failed".to_string());
                warn!(repository = %repo.id, error = %message, "Image build failed");
                result.errors.push(PipelineError::non_fatal(PHASE, &repo.id, message));
            }
            self.checkpoint(result, PHASE, &repo.id)?;
        }
        Ok(())
    }

    fn verify_phase(&self, result: &mut PipelineResult) -> Result<(), Halt> {
        const PHASE: PipelinePhase = PipelinePhase::Verifying;
        self.enter(PHASE, "Verifying build artifacts");
        let base = self.base_path().to_path_buf();
        let order = result.active_order();

        for (index, repo_id) in order.iter().enumerate() {
            self.checkpoint(result, PHASE, repo_id)?;
            let Some(repo) = self.config.repository(repo_id) else {
                continue;
            };
            self.progress(PHASE, format!("Verifying {}", repo.display_name()), index + 1, order.len());

            let root = repo.clone_path(&base);
            let found: Vec<&str> = VERIFY_ARTIFACTS
                .iter()
                .copied()
                .filter(|artifact| root.join(artifact).exists())
                .collect();
            if found.is_empty() {
                warn!(repository = %repo_id, "No build artifacts found");
                result.errors.push(PipelineError::non_fatal(
                    PHASE,
                    repo_id,
                    format!("no build artifacts found (looked for {})", VERIFY_ARTIFACTS.join(", ")),
                ));
            } else {
                debug!(repository = %repo_id, artifacts = ?found, "Verified");
                result.verified_repositories.push(repo_id.clone());
            }
        }
        Ok(())
    }
}

fn to_chain_step(repo_id: &str, index: usize, config: &BuildStepConfig, root: &Path) -> Step {
    let mut step = Step::new(format!("{repo_id}#{}", index + 1), config.name.clone(), config.resolved_kind())
        .with_command(config.command.clone())
        .with_working_dir(
            config
                .working_dir
                .as_ref()
                .map_or_else(|| root.to_path_buf(), |dir| resolve_under(root, dir)),
        );
    if let Some(seconds) = config.timeout_seconds {
        step = step.with_timeout_ms(seconds.saturating_mul(1000));
    }
    step.config.env = config.env.clone();
    step.continue_on_failure = config.continue_on_error;
    step
}

fn resolve_under(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

fn describe(error: &ValidationError) -> String {
    if error.items.is_empty() {
        error.message.clone()
    } else {
        format!("{}: {}", error.message, error.items.join("; "))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::events::CollectingProgressSink;
    use crate::pipeline::config::Component;
    use crate::testing::{
        assert_pipeline_phase, assert_pipeline_succeeded, two_repository_config, write_file,
        MockCloner, MockImageBuilder,
    };
    use pretty_assertions::assert_eq;
    use std::time::{Duration, Instant};

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| (*s).to_string()).collect()
    }

    fn orchestrator(
        config: PipelineConfig,
        options: PipelineOptions,
    ) -> (Orchestrator, Arc<MockCloner>, Arc<MockImageBuilder>) {
        let cloner = Arc::new(MockCloner::new());
        let builder = Arc::new(MockImageBuilder::new());
        let orchestrator = Orchestrator::new(config, options)
            .with_runner(ProcessRunner::new().with_grace_period(Duration::from_millis(200)))
            .with_cloner(cloner.clone())
            .with_image_builder(builder.clone());
        (orchestrator, cloner, builder)
    }

    #[tokio::test]
    async fn test_end_to_end_respects_dependency_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = two_repository_config(dir.path());
        let sink = Arc::new(CollectingProgressSink::new());
        let (orchestrator, cloner, _) = orchestrator(config, PipelineOptions::new());
        let orchestrator = orchestrator.with_sink(sink.clone());

        let result = orchestrator.run().await;

        assert_pipeline_succeeded(&result);
        assert_pipeline_phase(&result, PipelinePhase::Complete);
        assert_eq!(result.build_order, ids(&["a", "b"]));
        assert_eq!(result.cloned_repositories, ids(&["a", "b"]));
        assert_eq!(result.built_repositories, ids(&["a", "b"]));
        assert_eq!(result.verified_repositories, ids(&["a", "b"]));
        assert_eq!(cloner.call_count(), 2);

        let log = std::fs::read_to_string(dir.path().join("build.log")).unwrap();
        assert_eq!(log.lines().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(!sink.matching("Verifying build artifacts").is_empty());
        assert_eq!(orchestrator.phase(), PipelinePhase::Complete);
    }

    #[tokio::test]
    async fn test_existing_clones_are_not_recloned() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        std::fs::create_dir_all(dir.path().join("b")).unwrap();
        let (orchestrator, cloner, _) = orchestrator(
            two_repository_config(dir.path()),
            PipelineOptions::new().skip_build().skip_verify(),
        );

        let result = orchestrator.run().await;

        assert!(result.success);
        assert_eq!(cloner.call_count(), 0);
        assert_eq!(result.cloned_repositories, ids(&["a", "b"]));
    }

    #[tokio::test]
    async fn test_force_reclones_existing_targets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/stale")).unwrap();
        let (orchestrator, cloner, _) = orchestrator(
            two_repository_config(dir.path()),
            PipelineOptions::new().force().skip_build().skip_verify(),
        );

        let result = orchestrator.run().await;

        assert!(result.success);
        assert_eq!(cloner.call_count(), 2);
        assert!(!dir.path().join("a/stale").exists());
    }

    #[tokio::test]
    async fn test_optional_clone_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = two_repository_config(dir.path());
        config.repositories[1].optional = true;
        let (orchestrator, cloner, _) =
            orchestrator(config, PipelineOptions::new().skip_build().skip_verify());
        cloner.fail_url("https://example.com/b.git", "repository not found");

        let result = orchestrator.run().await;

        assert!(result.success);
        assert_eq!(result.cloned_repositories, ids(&["a"]));
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].kind, ErrorKind::NonFatal);
        assert_eq!(result.errors[0].component, "b");
    }

    #[tokio::test]
    async fn test_optional_clone_failure_skips_later_phases() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = two_repository_config(dir.path());
        config.repositories[1].optional = true;
        let (orchestrator, cloner, _) = orchestrator(config, PipelineOptions::new());
        cloner.fail_url("https://example.com/b.git", "repository not found");

        let result = orchestrator.run().await;

        assert_pipeline_succeeded(&result);
        assert_eq!(result.skipped_repositories, ids(&["b"]));
        assert_eq!(result.built_repositories, ids(&["a"]));
        assert_eq!(result.verified_repositories, ids(&["a"]));
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].phase, PipelinePhase::Cloning);
    }

    #[tokio::test]
    async fn test_duplicate_repository_fails_before_cloning() {
        let dir = tempfile::tempdir().unwrap();
        let config = two_repository_config(dir.path())
            .with_repository(RepositoryDescriptor::new("a", "https://example.com/other.git"));
        let (orchestrator, cloner, _) = orchestrator(config, PipelineOptions::new());

        let result = orchestrator.run().await;

        assert_pipeline_phase(&result, PipelinePhase::Failed);
        assert_eq!(result.errors[0].kind, ErrorKind::Validation);
        assert_eq!(cloner.call_count(), 0);
    }

    #[tokio::test]
    async fn test_required_clone_failure_fails_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, cloner, builder) =
            orchestrator(two_repository_config(dir.path()), PipelineOptions::new());
        cloner.fail_url("https://example.com/a.git", "network unreachable");

        let result = orchestrator.run().await;

        assert!(!result.success);
        assert_eq!(result.phase, PipelinePhase::Failed);
        assert_eq!(cloner.call_count(), 1);
        assert_eq!(builder.call_count(), 0);
        assert!(result.steps.is_empty());
        assert!(result.summary().contains("network unreachable"));
    }

    #[tokio::test]
    async fn test_validation_failure_runs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = two_repository_config(dir.path())
            .with_build_step(BuildStepConfig::new("ghost", "Build", "true"));
        let (orchestrator, cloner, _) = orchestrator(config, PipelineOptions::new());

        let result = orchestrator.run().await;

        assert_eq!(result.phase, PipelinePhase::Failed);
        assert_eq!(result.errors[0].kind, ErrorKind::Validation);
        assert_eq!(result.errors[0].phase, PipelinePhase::Initializing);
        assert!(result.is_invalid_configuration());
        assert_eq!(cloner.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_component_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, _, _) = orchestrator(
            two_repository_config(dir.path()),
            PipelineOptions::new().with_component("missing"),
        );
        assert!(orchestrator.plan().is_err());
        assert_eq!(orchestrator.run().await.phase, PipelinePhase::Failed);
    }

    #[tokio::test]
    async fn test_component_selection_limits_repositories() {
        let dir = tempfile::tempdir().unwrap();
        let config = two_repository_config(dir.path()).with_component(Component {
            id: "core".into(),
            name: "Core".into(),
            repositories: vec!["a".into()],
            enabled: true,
        });
        let (orchestrator, cloner, _) = orchestrator(config, PipelineOptions::new().skip_verify());

        let result = orchestrator.run().await;

        assert!(result.success, "{}", result.summary());
        assert_eq!(result.build_order, ids(&["a"]));
        assert_eq!(cloner.call_count(), 1);
        assert_eq!(result.built_repositories, ids(&["a"]));
    }

    #[tokio::test]
    async fn test_step_failure_with_continue_on_error_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let mut step = BuildStepConfig::new("a", "Lint", "exit 1");
        step.continue_on_error = true;
        let config = two_repository_config(dir.path()).with_build_step(step);
        let (orchestrator, _, _) = orchestrator(config, PipelineOptions::new().skip_verify());

        let result = orchestrator.run().await;

        assert!(result.success, "{}", result.summary());
        assert_eq!(result.built_repositories, ids(&["b"]));
        assert_eq!(result.errors.len(), 1);
        assert!(!result.errors[0].is_fatal());
    }

    #[tokio::test]
    async fn test_step_failure_fails_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let config = two_repository_config(dir.path())
            .with_build_step(BuildStepConfig::new("a", "Broken", "exit 3"));
        let (orchestrator, _, builder) = orchestrator(config, PipelineOptions::new());

        let result = orchestrator.run().await;

        assert_eq!(result.phase, PipelinePhase::Failed);
        assert_eq!(result.errors[0].phase, PipelinePhase::Building);
        assert_eq!(result.errors[0].component, "a");
        assert_eq!(builder.call_count(), 0);
        let skipped = result
            .steps
            .iter()
            .filter(|s| s.step.status == StepStatus::Skipped)
            .count();
        assert_eq!(skipped, 1);
    }

    #[tokio::test]
    async fn test_image_phase_skips_missing_build_file_and_records_failures() {
        let dir = tempfile::tempdir().unwrap();
        let config = two_repository_config(dir.path())
            .with_image_build("a", ImageSpec::new("acme/a", "dev", "."))
            .with_image_build("b", ImageSpec::new("acme/b", "dev", "."));
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        std::fs::create_dir_all(dir.path().join("b")).unwrap();
        write_file(dir.path(), "a/Dockerfile", "FROM scratch\n");
        let (orchestrator, _, builder) =
            orchestrator(config, PipelineOptions::new().skip_build().skip_verify());
        builder.fail_with("daemon not running");

        let result = orchestrator.run().await;

        assert!(result.success);
        assert_eq!(builder.call_count(), 1);
        assert!(result.image_built_repositories.is_empty());
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].phase, PipelinePhase::ImageBuilding);
    }

    #[tokio::test]
    async fn test_image_built_when_build_file_present() {
        let dir = tempfile::tempdir().unwrap();
        let config = two_repository_config(dir.path())
            .with_image_build("b", ImageSpec::new("acme/b", "1.0", "."));
        std::fs::create_dir_all(dir.path().join("b")).unwrap();
        write_file(dir.path(), "b/Dockerfile", "FROM scratch\n");
        let (orchestrator, _, builder) = orchestrator(
            config,
            PipelineOptions::new().skip_clone().skip_build().skip_verify(),
        );

        let result = orchestrator.run().await;

        assert_eq!(result.image_built_repositories, ids(&["b"]));
        assert_eq!(builder.images(), ids(&["acme/b:1.0"]));
    }

    #[tokio::test]
    async fn test_missing_artifacts_are_non_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/dist")).unwrap();
        let (orchestrator, _, _) = orchestrator(
            two_repository_config(dir.path()),
            PipelineOptions::new().skip_clone().skip_build().skip_image_build(),
        );

        let result = orchestrator.run().await;

        assert!(result.success);
        assert_eq!(result.verified_repositories, ids(&["a"]));
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].component, "b");
        assert_eq!(result.summary(), "Pipeline completed with 1 failures");
    }

    #[tokio::test]
    async fn test_cancel_before_run() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, cloner, _) =
            orchestrator(two_repository_config(dir.path()), PipelineOptions::new());
        orchestrator.cancel();

        let result = orchestrator.run().await;

        assert_eq!(result.phase, PipelinePhase::Cancelled);
        assert_eq!(result.summary(), "Pipeline cancelled");
        assert_eq!(result.errors[0].message, "cancelled by user");
        assert_eq!(cloner.call_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_terminates_running_step() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::new(dir.path())
            .with_repository(RepositoryDescriptor::new("slow", "https://example.com/slow.git"))
            .with_build_step(BuildStepConfig::new("slow", "Sleep", "sleep 30"));
        let (orchestrator, _, _) = orchestrator(config, PipelineOptions::new());
        let orchestrator = Arc::new(orchestrator);

        let token = orchestrator.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            token.cancel("test");
        });

        let start = Instant::now();
        let result = orchestrator.run().await;

        assert_eq!(result.phase, PipelinePhase::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(result.steps[0].step.status, StepStatus::Failed);
    }

    /// Clones successfully but fires the token while doing so.
    struct CancelDuringClone;

    #[async_trait::async_trait]
    impl CloneCollaborator for CancelDuringClone {
        async fn clone_repository(
            &self,
            _url: &str,
            target: &Path,
            _options: CloneOptions,
            cancel: &CancellationToken,
        ) -> crate::collaborators::CloneOutcome {
            std::fs::create_dir_all(target).unwrap();
            cancel.cancel("test");
            crate::collaborators::CloneOutcome::ok()
        }
    }

    #[tokio::test]
    async fn test_clone_finished_during_cancel_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, _, _) =
            orchestrator(two_repository_config(dir.path()), PipelineOptions::new());
        let orchestrator = orchestrator.with_cloner(Arc::new(CancelDuringClone));

        let result = orchestrator.run().await;

        assert_pipeline_phase(&result, PipelinePhase::Cancelled);
        assert_eq!(result.cloned_repositories, ids(&["a"]));
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].kind, ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_during_clone_records_only_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, cloner, _) =
            orchestrator(two_repository_config(dir.path()), PipelineOptions::new());
        cloner.set_delay(Duration::from_secs(30));

        let token = orchestrator.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel("test");
        });

        let result = orchestrator.run().await;

        assert_pipeline_phase(&result, PipelinePhase::Cancelled);
        assert!(result.cloned_repositories.is_empty());
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].phase, PipelinePhase::Cloning);
        assert_eq!(result.errors[0].kind, ErrorKind::Cancelled);
        assert_eq!(cloner.call_count(), 1);
    }

    #[tokio::test]
    async fn test_repeated_runs_register_one_cancel_hook() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, _, _) = orchestrator(
            two_repository_config(dir.path()),
            PipelineOptions::new().skip_build().skip_verify(),
        );

        let _ = orchestrator.run().await;
        let _ = orchestrator.run().await;

        assert_eq!(orchestrator.cancellation_token().pending_callbacks(), 1);
    }
}

//! Sequential execution of a step chain.

use super::handlers;
use super::policy::KindRetryPolicies;
use super::step::{Step, StepResult, SKIPPED_CANCELLED, SKIPPED_PREVIOUS_FAILURE};
use crate::cancellation::CancellationToken;
use crate::core::{OutputStream, PipelinePhase, StepStatus};
use crate::errors::{ErrorKind, ProcessError, ValidationError};
use crate::events::{NoOpProgressSink, ProgressEvent, ProgressSink, INDETERMINATE};
use crate::graph::DependencyGraph;
use crate::process::{OutputChunk, OutputObserver, ProcessRunner};
use crate::retry::RetryExecutor;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Chain-wide execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Stop at the first failure of a step without `continue_on_failure`.
    pub stop_on_failure: bool,
    /// Base directory for steps; relative step directories resolve here.
    pub working_directory: Option<PathBuf>,
    /// Environment applied to every step, below step overrides.
    pub env: HashMap<String, String>,
    /// Retry policy per step kind.
    pub retry: KindRetryPolicies,
    /// Timeout for steps that do not declare one.
    pub default_timeout_ms: Option<u64>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            stop_on_failure: true,
            working_directory: None,
            env: HashMap::new(),
            retry: KindRetryPolicies::default(),
            default_timeout_ms: None,
        }
    }
}

impl ChainConfig {
    /// Sets whether the chain stops at the first failure.
    #[must_use]
    pub fn with_stop_on_failure(mut self, stop: bool) -> Self {
        self.stop_on_failure = stop;
        self
    }

    /// Sets the base working directory.
    #[must_use]
    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Adds a chain-wide environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the retry policies.
    #[must_use]
    pub fn with_retry(mut self, retry: KindRetryPolicies) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the default step timeout.
    #[must_use]
    pub fn with_default_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = Some(timeout_ms);
        self
    }
}

/// Aggregate outcome of a chain run.
///
/// `success_count + failure_count + skipped_count` always equals the number
/// of steps submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainResult {
    /// True when no step failed and the run was not cancelled.
    pub success: bool,
    /// One result per step, in input order.
    pub step_results: Vec<StepResult>,
    /// Completed steps.
    pub success_count: usize,
    /// Failed steps.
    pub failure_count: usize,
    /// Skipped steps.
    pub skipped_count: usize,
    /// Whether cancellation was observed.
    pub cancelled: bool,
    /// When the run started.
    pub start_time: DateTime<Utc>,
    /// When the run ended.
    pub end_time: DateTime<Utc>,
}

impl ChainResult {
    /// Wall-clock duration of the run.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        u64::try_from((self.end_time - self.start_time).num_milliseconds()).unwrap_or(0)
    }

    /// Returns the result of a step by id.
    #[must_use]
    pub fn step(&self, id: &str) -> Option<&StepResult> {
        self.step_results.iter().find(|r| r.step.id == id)
    }

    /// Returns the failed steps.
    pub fn failed(&self) -> impl Iterator<Item = &StepResult> {
        self.step_results
            .iter()
            .filter(|r| r.step.status == StepStatus::Failed)
    }
}

struct StepRun {
    success: bool,
    message: String,
    attempts: u32,
    error_kind: Option<ErrorKind>,
}

/// Runs a list of steps in order through a [`ProcessRunner`].
///
/// Steps run strictly one after another in input order. A step runs only
/// when every step it depends on completed; otherwise it is skipped.
pub struct BuildChainExecutor {
    runner: ProcessRunner,
    sink: Arc<dyn ProgressSink>,
    cancel: Option<Arc<CancellationToken>>,
    phase: PipelinePhase,
}

impl std::fmt::Debug for BuildChainExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildChainExecutor")
            .field("runner", &self.runner)
            .field("phase", &self.phase)
            .field("has_cancel_token", &self.cancel.is_some())
            .finish_non_exhaustive()
    }
}

impl BuildChainExecutor {
    /// Creates an executor reporting to `sink`.
    #[must_use]
    pub fn new(runner: ProcessRunner, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            runner,
            sink,
            cancel: None,
            phase: PipelinePhase::Building,
        }
    }

    /// Creates an executor that reports nothing.
    #[must_use]
    pub fn silent(runner: ProcessRunner) -> Self {
        Self::new(runner, Arc::new(NoOpProgressSink))
    }

    /// Observes `token` before every step and between retries.
    #[must_use]
    pub fn with_cancellation(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Sets the phase attached to emitted progress events.
    #[must_use]
    pub fn with_phase(mut self, phase: PipelinePhase) -> Self {
        self.phase = phase;
        self
    }

    /// Returns the runner.
    #[must_use]
    pub fn runner(&self) -> &ProcessRunner {
        &self.runner
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }

    fn emit(&self, event: ProgressEvent) {
        self.sink.emit(&event);
    }

    /// Runs the chain.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] before any step starts when ids are
    /// duplicated, a dependency is unknown, the steps form a cycle, or a
    /// step lacks the configuration its kind requires. Step failures are
    /// reported in the [`ChainResult`], never as an error.
    pub async fn run(
        &self,
        steps: Vec<Step>,
        config: &ChainConfig,
    ) -> Result<ChainResult, ValidationError> {
        let graph = steps_graph(&steps);
        graph.validate()?;
        handlers::check_all_runnable(&steps)?;

        let start_time = Utc::now();
        let total = steps.len();
        let mut statuses: HashMap<String, StepStatus> = HashMap::with_capacity(total);
        let mut results = Vec::with_capacity(total);
        let mut aborted = false;
        let mut cancelled = false;

        info!(steps = total, stop_on_failure = config.stop_on_failure, "Starting build chain");

        for (index, mut step) in steps.into_iter().enumerate() {
            if !cancelled && self.is_cancelled() {
                warn!(step = %step.id, "Cancellation observed, skipping remaining steps");
                cancelled = true;
            }

            let skip_reason = if cancelled {
                Some(SKIPPED_CANCELLED.to_string())
            } else if aborted {
                Some(SKIPPED_PREVIOUS_FAILURE.to_string())
            } else {
                step.depends_on
                    .iter()
                    .find(|dep| statuses.get(dep.as_str()) != Some(&StepStatus::Completed))
                    .map(|dep| format!("skipped: dependency '{dep}' did not complete"))
            };

            if let Some(reason) = skip_reason {
                debug!(step = %step.id, reason = %reason, "Skipping step");
                step.mark_skipped(reason.clone());
                statuses.insert(step.id.clone(), StepStatus::Skipped);
                results.push(StepResult {
                    step,
                    success: false,
                    message: reason,
                    duration_ms: 0,
                    attempts: 0,
                    error_kind: None,
                });
                continue;
            }

            step.mark_in_progress();
            self.emit(
                ProgressEvent::new(self.phase, format!("Running step '{}'", step.name))
                    .with_step(index + 1, total),
            );
            info!(step = %step.id, kind = %step.kind, "Running step");

            let run = self.execute_step(&mut step, config).await;

            if run.success {
                step.mark_completed();
                info!(step = %step.id, attempts = run.attempts, duration_ms = step.duration_ms(), "Step completed");
            } else {
                step.mark_failed(run.message.clone());
                warn!(step = %step.id, attempts = run.attempts, error = %run.message, "Step failed");
                if config.stop_on_failure && !step.continue_on_failure {
                    aborted = true;
                }
            }

            statuses.insert(step.id.clone(), step.status);
            results.push(StepResult {
                duration_ms: step.duration_ms(),
                success: run.success,
                message: run.message,
                attempts: run.attempts,
                error_kind: run.error_kind,
                step,
            });
        }

        let count = |status: StepStatus| results.iter().filter(|r| r.step.status == status).count();
        let success_count = count(StepStatus::Completed);
        let failure_count = count(StepStatus::Failed);
        let skipped_count = count(StepStatus::Skipped);

        let result = ChainResult {
            success: failure_count == 0 && !cancelled,
            step_results: results,
            success_count,
            failure_count,
            skipped_count,
            cancelled,
            start_time,
            end_time: Utc::now(),
        };

        info!(
            success = result.success,
            completed = success_count,
            failed = failure_count,
            skipped = skipped_count,
            duration_ms = result.duration_ms(),
            "Build chain finished"
        );
        Ok(result)
    }

    async fn execute_step(&self, step: &mut Step, config: &ChainConfig) -> StepRun {
        let spec = match handlers::process_spec(step, config) {
            Ok(spec) => spec,
            Err(message) => {
                return StepRun {
                    success: false,
                    message,
                    attempts: 0,
                    error_kind: Some(ErrorKind::Validation),
                }
            }
        };

        let captured: Arc<Mutex<Vec<OutputChunk>>> = Arc::new(Mutex::new(Vec::new()));
        let observer: OutputObserver = {
            let captured = captured.clone();
            let sink = self.sink.clone();
            let phase = self.phase;
            Arc::new(move |chunk: &OutputChunk| {
                captured.lock().push(chunk.clone());
                sink.emit(
                    &ProgressEvent::new(phase, "output")
                        .with_percent(INDETERMINATE)
                        .with_output(chunk.stream, chunk.chunk.clone()),
                );
            })
        };

        let retry = {
            let sink = self.sink.clone();
            let phase = self.phase;
            let name = step.name.clone();
            RetryExecutor::new(config.retry.for_kind(step.kind).clone()).with_observer(
                move |error, attempt, delay_ms| {
                    sink.emit(&ProgressEvent::new(
                        phase,
                        format!("Retrying '{name}' after attempt {attempt} in {delay_ms}ms: {error}"),
                    ));
                },
            )
        };

        let runner = &self.runner;
        let spec = &spec;
        let token = self.cancel.as_deref();
        let outcome = retry
            .execute_when(
                move || {
                    let observer = Some(observer.clone());
                    async move {
                        match token {
                            Some(token) => runner.run_until_cancelled(spec, observer, token).await,
                            None => runner.run_with_observer(spec, observer).await,
                        }
                    }
                },
                &step.id,
                |error: &ProcessError| error.is_transient() && !self.is_cancelled(),
            )
            .await;

        for chunk in captured.lock().drain(..) {
            match chunk.stream {
                OutputStream::Stdout => step.stdout.push(chunk.chunk),
                OutputStream::Stderr => step.stderr.push(chunk.chunk),
            }
        }

        let attempts = outcome.attempts_made;
        match outcome.into_result() {
            Ok(output) => StepRun {
                success: true,
                message: format!("completed in {}ms", output.duration_ms),
                attempts,
                error_kind: None,
            },
            Err(error) => StepRun {
                success: false,
                message: error.to_string(),
                attempts,
                error_kind: Some(error.kind()),
            },
        }
    }
}

fn steps_graph(steps: &[Step]) -> DependencyGraph {
    let mut graph = DependencyGraph::new(steps.iter().map(|s| s.id.clone()));
    for step in steps {
        for dep in &step.depends_on {
            graph.add_dependency(step.id.clone(), dep.clone());
        }
    }
    graph
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::StepKind;
    use crate::events::CollectingProgressSink;
    use crate::retry::RetryPolicy;
    use crate::testing::{assert_counts_consistent, assert_step_status};
    use pretty_assertions::assert_eq;

    fn executor() -> (BuildChainExecutor, Arc<CollectingProgressSink>) {
        let sink = Arc::new(CollectingProgressSink::new());
        (BuildChainExecutor::new(ProcessRunner::new(), sink.clone()), sink)
    }

    fn fast_retry() -> KindRetryPolicies {
        KindRetryPolicies::default().with_policy(
            StepKind::BuildScript,
            RetryPolicy::new()
                .with_max_attempts(3)
                .with_initial_delay_ms(1)
                .with_jitter_factor(0.0),
        )
    }

    fn script(id: &str, command: &str) -> Step {
        Step::new(id, id, StepKind::CustomScript).with_command(command)
    }

    #[tokio::test]
    async fn test_all_steps_complete_and_capture_output() {
        let (executor, sink) = executor();
        let steps = vec![script("a", "echo first"), script("b", "echo second").depends_on("a")];

        let result = executor.run(steps, &ChainConfig::default()).await.unwrap();

        assert!(result.success);
        assert_eq!(result.success_count, 2);
        assert_eq!(result.step("b").unwrap().stdout().to_vec(), vec!["second".to_string()]);
        assert!(!sink.matching("Running step 'a'").is_empty());
        assert!(sink.events().iter().any(|e| e.stdout_chunk.as_deref() == Some("first")));
    }

    #[tokio::test]
    async fn test_dependency_failure_skips_dependent() {
        let (executor, _) = executor();
        let steps = vec![
            script("a", "exit 1").continue_on_failure(),
            script("b", "echo b").depends_on("a"),
            script("c", "echo c"),
        ];

        let result = executor.run(steps, &ChainConfig::default()).await.unwrap();

        assert!(!result.success);
        assert_step_status(&result, "a", StepStatus::Failed);
        assert_step_status(&result, "b", StepStatus::Skipped);
        assert_step_status(&result, "c", StepStatus::Completed);
        assert_eq!(
            result.step("b").unwrap().message,
            "skipped: dependency 'a' did not complete"
        );
        assert_counts_consistent(&result);
    }

    #[tokio::test]
    async fn test_stop_on_failure_skips_rest() {
        let (executor, _) = executor();
        let steps = vec![script("a", "exit 2"), script("b", "echo b"), script("c", "echo c")];

        let result = executor.run(steps, &ChainConfig::default()).await.unwrap();

        assert_eq!(result.failure_count, 1);
        assert_eq!(result.skipped_count, 2);
        assert_eq!(result.step("c").unwrap().message, SKIPPED_PREVIOUS_FAILURE);
    }

    #[tokio::test]
    async fn test_without_stop_on_failure_runs_everything() {
        let (executor, _) = executor();
        let steps = vec![script("a", "exit 2"), script("b", "echo b")];
        let config = ChainConfig::default().with_stop_on_failure(false);

        let result = executor.run(steps, &config).await.unwrap();

        assert_eq!(result.failure_count, 1);
        assert_eq!(result.success_count, 1);
    }

    #[tokio::test]
    async fn test_cycle_rejected_before_any_step_runs() {
        let (executor, sink) = executor();
        let steps = vec![
            script("a", "echo a").depends_on("b"),
            script("b", "echo b").depends_on("a"),
        ];

        let err = executor.run(steps, &ChainConfig::default()).await.unwrap_err();

        assert!(err.items.contains(&"a".to_string()));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_dependency_rejected() {
        let (executor, _) = executor();
        let steps = vec![script("a", "echo a").depends_on("ghost")];
        assert!(executor.run(steps, &ChainConfig::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_custom_script_not_retried_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("count");
        let command = format!("echo x >> {} && exit 1", counter.display());
        let (executor, _) = executor();

        let result = executor
            .run(vec![script("a", &command)], &ChainConfig::default())
            .await
            .unwrap();

        assert_eq!(result.step("a").unwrap().attempts, 1);
        assert_eq!(std::fs::read_to_string(&counter).unwrap().lines().count(), 1);
    }

    #[tokio::test]
    async fn test_build_script_retried_until_success() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("count");
        let command = format!(
            "echo x >> {0}; test $(wc -l < {0}) -ge 3",
            counter.display()
        );
        let (executor, sink) = executor();
        let step = Step::new("b", "Build", StepKind::BuildScript).with_command(command);

        let result = executor
            .run(vec![step], &ChainConfig::default().with_retry(fast_retry()))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.step("b").unwrap().attempts, 3);
        assert_eq!(sink.matching("Retrying 'Build'").len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_token_skips_all_steps() {
        let (executor, _) = executor();
        let token = Arc::new(CancellationToken::new());
        token.cancel("user");
        let executor = executor.with_cancellation(token);

        let result = executor
            .run(vec![script("a", "echo a"), script("b", "echo b")], &ChainConfig::default())
            .await
            .unwrap();

        assert!(result.cancelled);
        assert!(!result.success);
        assert_eq!(result.skipped_count, 2);
        assert_eq!(result.step("a").unwrap().message, SKIPPED_CANCELLED);
    }
}

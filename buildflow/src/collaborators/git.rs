//! Cloning through the `git` command line.

use super::{CloneCollaborator, CloneOptions, CloneOutcome};
use crate::cancellation::CancellationToken;
use crate::chain::shell_quote;
use crate::core::OutputStream;
use crate::process::{OutputChunk, OutputObserver, ProcessRunner, ProcessSpec};
use async_trait::async_trait;
use regex::Regex;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

static PERCENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3})%").expect("percent pattern is valid"));

/// Extracts the last `NN%` figure from a line of `git --progress` output.
///
/// Git rewrites its progress line with carriage returns, so one captured
/// line may hold several updates; the latest wins.
#[must_use]
pub fn parse_progress_percent(line: &str) -> Option<i32> {
    PERCENT
        .captures_iter(line)
        .last()
        .and_then(|caps| caps[1].parse::<i32>().ok())
        .map(|p| p.clamp(0, 100))
}

fn latest_segment(line: &str) -> &str {
    line.rsplit('\r').find(|s| !s.trim().is_empty()).unwrap_or(line).trim()
}

/// [`CloneCollaborator`] that runs `git clone`.
#[derive(Debug, Clone)]
pub struct GitCloner {
    runner: ProcessRunner,
    program: String,
}

impl Default for GitCloner {
    fn default() -> Self {
        Self {
            runner: ProcessRunner::new(),
            program: "git".to_string(),
        }
    }
}

impl GitCloner {
    /// Creates a cloner using `git` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a specific runner.
    #[must_use]
    pub fn with_runner(mut self, runner: ProcessRunner) -> Self {
        self.runner = runner;
        self
    }

    /// Uses a different git executable.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Builds the `git clone` command line.
    #[must_use]
    pub fn clone_command(&self, url: &str, target: &Path, options: &CloneOptions) -> String {
        let mut parts = vec![shell_quote(&self.program), "clone".into(), "--progress".into()];
        if let Some(depth) = options.depth {
            parts.push(format!("--depth {depth}"));
        }
        if let Some(branch) = &options.branch {
            parts.push(format!("--branch {}", shell_quote(branch)));
        }
        if !options.sparse_paths.is_empty() {
            parts.push("--filter=blob:none --sparse".into());
        }
        parts.push("--".into());
        parts.push(shell_quote(url));
        parts.push(shell_quote(&target.to_string_lossy()));
        parts.join(" ")
    }

    fn sparse_command(&self, paths: &[String]) -> String {
        let quoted: Vec<String> = paths.iter().map(|p| shell_quote(p)).collect();
        format!("{} sparse-checkout set {}", shell_quote(&self.program), quoted.join(" "))
    }

    fn progress_observer(options: &CloneOptions) -> Option<OutputObserver> {
        let callback = options.on_progress.clone()?;
        Some(Arc::new(move |chunk: &OutputChunk| {
            if chunk.stream != OutputStream::Stderr {
                return;
            }
            if let Some(percent) = parse_progress_percent(&chunk.chunk) {
                callback(percent, latest_segment(&chunk.chunk));
            }
        }))
    }
}

#[async_trait]
impl CloneCollaborator for GitCloner {
    async fn clone_repository(
        &self,
        url: &str,
        target: &Path,
        options: CloneOptions,
        cancel: &CancellationToken,
    ) -> CloneOutcome {
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return CloneOutcome::failed(format!(
                    "cannot create {}: {e}",
                    parent.display()
                ));
            }
        }

        let mut spec = ProcessSpec::new(self.clone_command(url, target, &options))
            .with_env([("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())]);
        if let Some(timeout) = options.timeout {
            spec = spec.with_timeout(timeout);
        }

        info!(url, target = %target.display(), "Cloning repository");
        let observer = Self::progress_observer(&options);
        if let Err(e) = self.runner.run_until_cancelled(&spec, observer, cancel).await {
            warn!(url, error = %e, "Clone failed");
            return CloneOutcome::failed(e.to_string());
        }

        if !options.sparse_paths.is_empty() {
            debug!(paths = ?options.sparse_paths, "Configuring sparse checkout");
            let spec = ProcessSpec::new(self.sparse_command(&options.sparse_paths)).with_cwd(target);
            if let Err(e) = self.runner.run_until_cancelled(&spec, None, cancel).await {
                return CloneOutcome::failed(format!("sparse checkout failed: {e}"));
            }
        }

        if let Some(callback) = &options.on_progress {
            callback(100, "Clone complete");
        }
        CloneOutcome::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_progress_percent() {
        assert_eq!(parse_progress_percent("Receiving objects:  45% (450/1000)"), Some(45));
        assert_eq!(
            parse_progress_percent("Receiving objects:  10% (1/10)\rReceiving objects:  90% (9/10)"),
            Some(90)
        );
        assert_eq!(parse_progress_percent("Cloning into 'repo'..."), None);
    }

    #[test]
    fn test_latest_segment() {
        assert_eq!(latest_segment("a: 10%\rb: 20%\r"), "b: 20%");
    }

    #[test]
    fn test_clone_command() {
        let cloner = GitCloner::new();
        let options = CloneOptions::default()
            .with_branch("main")
            .with_depth(1)
            .with_sparse_paths(vec!["web".into()]);

        assert_eq!(
            cloner.clone_command("https://example.com/r.git", Path::new("/w/r"), &options),
            "git clone --progress --depth 1 --branch main --filter=blob:none --sparse -- https://example.com/r.git /w/r"
        );
        assert_eq!(
            cloner.clone_command("u", Path::new("/w/my repo"), &CloneOptions::default()),
            "git clone --progress -- u '/w/my repo'"
        );
        assert_eq!(
            cloner.clone_command("--upload-pack=x", Path::new("/w/r"), &CloneOptions::default()),
            "git clone --progress -- --upload-pack=x /w/r"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_program_output_drives_progress() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let fake_git = dir.path().join("fake-git");
        std::fs::write(
            &fake_git,
            "#!/bin/sh\necho 'Receiving objects:  50% (1/2)' >&2\nexit 0\n",
        )
        .unwrap();
        std::fs::set_permissions(&fake_git, std::fs::Permissions::from_mode(0o755)).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let options = CloneOptions::default().with_progress(move |p, _| sink.lock().push(p));
        let cloner = GitCloner::new().with_program(fake_git.to_string_lossy());

        let outcome = cloner
            .clone_repository("u", &dir.path().join("r"), options, &CancellationToken::new())
            .await;

        assert!(outcome.success);
        assert_eq!(*seen.lock(), vec![50, 100]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_carriage_return_progress_is_incremental() {
        use std::os::unix::fs::PermissionsExt;
        use std::time::Instant;

        let dir = tempfile::tempdir().unwrap();
        let fake_git = dir.path().join("fake-git");
        std::fs::write(
            &fake_git,
            "#!/bin/sh\n\
             printf 'Receiving objects:  10%% (1/10)\\r' >&2\n\
             sleep 1\n\
             printf 'Receiving objects:  50%% (5/10)\\r' >&2\n\
             sleep 1\n\
             printf 'Receiving objects: 100%% (10/10), done.\\n' >&2\n",
        )
        .unwrap();
        std::fs::set_permissions(&fake_git, std::fs::Permissions::from_mode(0o755)).unwrap();

        let start = Instant::now();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let options = CloneOptions::default()
            .with_progress(move |p, _| sink.lock().push((p, start.elapsed())));
        let cloner = GitCloner::new().with_program(fake_git.to_string_lossy());

        let outcome = cloner
            .clone_repository("u", &dir.path().join("r"), options, &CancellationToken::new())
            .await;

        assert!(outcome.success);
        let seen = seen.lock().clone();
        let percents: Vec<i32> = seen.iter().map(|(p, _)| *p).collect();
        assert_eq!(percents, vec![10, 50, 100, 100]);
        assert!(seen[0].1 < seen[1].1 - std::time::Duration::from_millis(500));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_clone_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let cloner = GitCloner::new().with_program("false");

        let outcome = cloner
            .clone_repository("u", &dir.path().join("r"), CloneOptions::default(), &CancellationToken::new())
            .await;

        assert!(!outcome.success);
        assert!(outcome.error.is_some());
    }
}

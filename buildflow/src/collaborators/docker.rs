//! Image builds through the `docker` command line.

use super::{ImageBuildCollaborator, ImageBuildOptions, ImageBuildOutcome};
use crate::cancellation::CancellationToken;
use crate::chain::shell_quote;
use crate::events::INDETERMINATE;
use crate::process::{OutputChunk, OutputObserver, ProcessRunner, ProcessSpec};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// [`ImageBuildCollaborator`] that runs `docker build`.
#[derive(Debug, Clone)]
pub struct DockerImageBuilder {
    runner: ProcessRunner,
    program: String,
}

impl Default for DockerImageBuilder {
    fn default() -> Self {
        Self {
            runner: ProcessRunner::new(),
            program: "docker".to_string(),
        }
    }
}

impl DockerImageBuilder {
    /// Creates a builder using `docker` from `PATH`.
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

    /// Uses a compatible executable such as `podman`.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Builds the `build` command line.
    #[must_use]
    pub fn build_command(&self, context: &Path, image_name: &str, options: &ImageBuildOptions) -> String {
        let mut parts = vec![shell_quote(&self.program), "build".to_string()];
        parts.push(format!("-t {}", shell_quote(image_name)));
        for tag in &options.tags {
            parts.push(format!("-t {}", shell_quote(tag)));
        }

        let build_file = options
            .build_file
            .clone()
            .unwrap_or_else(|| context.join("Dockerfile"));
        parts.push(format!("-f {}", shell_quote(&build_file.to_string_lossy())));

        let mut args: Vec<_> = options.build_args.iter().collect();
        args.sort();
        for (key, value) in args {
            parts.push(format!("--build-arg {}", shell_quote(&format!("{key}={value}"))));
        }
        if let Some(target) = &options.target {
            parts.push(format!("--target {}", shell_quote(target)));
        }
        if let Some(platform) = &options.platform {
            parts.push(format!("--platform {}", shell_quote(platform)));
        }
        if options.no_cache {
            parts.push("--no-cache".to_string());
        }
        parts.push(shell_quote(&context.to_string_lossy()));
        parts.join(" ")
    }
}

#[async_trait]
impl ImageBuildCollaborator for DockerImageBuilder {
    async fn build(
        &self,
        context: &Path,
        image_name: &str,
        options: ImageBuildOptions,
        cancel: &CancellationToken,
    ) -> ImageBuildOutcome {
        let mut spec = ProcessSpec::new(self.build_command(context, image_name, &options));
        if let Some(timeout) = options.timeout {
            spec = spec.with_timeout(timeout);
        }

        let observer: Option<OutputObserver> = options.on_progress.clone().map(|callback| {
            Arc::new(move |chunk: &OutputChunk| callback(INDETERMINATE, &chunk.chunk)) as OutputObserver
        });

        info!(image = image_name, context = %context.display(), "Building image");
        match self.runner.run_until_cancelled(&spec, observer, cancel).await {
            Ok(_) => ImageBuildOutcome::ok(image_name),
            Err(e) => {
                warn!(image = image_name, error = %e, "Image build failed");
                ImageBuildOutcome::failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::path::PathBuf;

    #[test]
    fn test_build_command() {
        let builder = DockerImageBuilder::new();
        let options = ImageBuildOptions {
            build_file: Some(PathBuf::from("/src/app/Dockerfile.prod")),
            build_args: HashMap::from([("B".to_string(), "2".to_string()), ("A".to_string(), "1".to_string())]),
            tags: vec!["acme/app:latest".into()],
            target: Some("runtime".into()),
            platform: Some("linux/amd64".into()),
            no_cache: true,
            ..ImageBuildOptions::default()
        };

        assert_eq!(
            builder.build_command(Path::new("/src/app"), "acme/app:1.0", &options),
            "docker build -t acme/app:1.0 -t acme/app:latest -f /src/app/Dockerfile.prod \
             --build-arg A=1 --build-arg B=2 --target runtime --platform linux/amd64 --no-cache /src/app"
        );
    }

    #[test]
    fn test_default_build_file() {
        let command = DockerImageBuilder::new().with_program("podman").build_command(
            Path::new("ctx"),
            "img",
            &ImageBuildOptions::default(),
        );
        assert_eq!(command, "podman build -t img -f ctx/Dockerfile ctx");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_program_is_reported() {
        let builder = DockerImageBuilder::new().with_program("false");
        let outcome = builder
            .build(Path::new("."), "img", ImageBuildOptions::default(), &CancellationToken::new())
            .await;

        assert!(!outcome.success);
        assert!(outcome.error.is_some());
    }
}

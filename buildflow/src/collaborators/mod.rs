//! External collaborators the orchestrator delegates to.
//!
//! Cloning and image building are behind traits so that runs can be driven
//! by the shelling-out implementations here ([`GitCloner`],
//! [`DockerImageBuilder`]) or by scripted doubles in tests.

mod docker;
mod git;

pub use docker::DockerImageBuilder;
pub use git::{parse_progress_percent, GitCloner};

use crate::cancellation::CancellationToken;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Callback receiving `(percent, message)` while a collaborator works.
pub type ProgressCallback = Arc<dyn Fn(i32, &str) + Send + Sync>;

/// Options for a clone operation.
#[derive(Clone, Default)]
pub struct CloneOptions {
    /// Branch to check out.
    pub branch: Option<String>,
    /// Shallow clone depth.
    pub depth: Option<u32>,
    /// Paths for a sparse checkout; full checkout when empty.
    pub sparse_paths: Vec<String>,
    /// Hard timeout for the clone.
    pub timeout: Option<Duration>,
    /// Progress callback.
    pub on_progress: Option<ProgressCallback>,
}

impl fmt::Debug for CloneOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloneOptions")
            .field("branch", &self.branch)
            .field("depth", &self.depth)
            .field("sparse_paths", &self.sparse_paths)
            .field("timeout", &self.timeout)
            .field("has_on_progress", &self.on_progress.is_some())
            .finish()
    }
}

impl CloneOptions {
    /// Sets the branch.
    #[must_use]
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Sets the shallow clone depth.
    #[must_use]
    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = Some(depth);
        self
    }

    /// Sets the sparse checkout paths.
    #[must_use]
    pub fn with_sparse_paths(mut self, paths: Vec<String>) -> Self {
        self.sparse_paths = paths;
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the progress callback.
    #[must_use]
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(i32, &str) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }
}

/// Result of a clone operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneOutcome {
    /// Whether the clone succeeded.
    pub success: bool,
    /// Failure description.
    pub error: Option<String>,
}

impl CloneOutcome {
    /// A successful clone.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    /// A failed clone.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Clones a repository into a local directory.
#[async_trait]
pub trait CloneCollaborator: Send + Sync {
    /// Clones `url` into `target`.
    ///
    /// Implementations must stop promptly once `cancel` fires and report the
    /// interruption as a failed outcome.
    async fn clone_repository(
        &self,
        url: &str,
        target: &Path,
        options: CloneOptions,
        cancel: &CancellationToken,
    ) -> CloneOutcome;
}

/// Options for an image build.
#[derive(Clone, Default)]
pub struct ImageBuildOptions {
    /// Build file; `<context>/Dockerfile` when unset.
    pub build_file: Option<PathBuf>,
    /// `--build-arg` values.
    pub build_args: HashMap<String, String>,
    /// Additional tags.
    pub tags: Vec<String>,
    /// Multi-stage target.
    pub target: Option<String>,
    /// Target platform.
    pub platform: Option<String>,
    /// Disable the layer cache.
    pub no_cache: bool,
    /// Hard timeout for the build.
    pub timeout: Option<Duration>,
    /// Progress callback.
    pub on_progress: Option<ProgressCallback>,
}

impl fmt::Debug for ImageBuildOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageBuildOptions")
            .field("build_file", &self.build_file)
            .field("build_args", &self.build_args)
            .field("tags", &self.tags)
            .field("target", &self.target)
            .field("platform", &self.platform)
            .field("no_cache", &self.no_cache)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Result of an image build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageBuildOutcome {
    /// Whether the build succeeded.
    pub success: bool,
    /// The image reference that was built.
    pub image: Option<String>,
    /// Failure description.
    pub error: Option<String>,
}

impl ImageBuildOutcome {
    /// A successful build.
    #[must_use]
    pub fn ok(image: impl Into<String>) -> Self {
        Self {
            success: true,
            image: Some(image.into()),
            error: None,
        }
    }

    /// A failed build.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            image: None,
            error: Some(error.into()),
        }
    }
}

/// Builds a container image.
#[async_trait]
pub trait ImageBuildCollaborator: Send + Sync {
    /// Builds `image_name` from `context`.
    async fn build(
        &self,
        context: &Path,
        image_name: &str,
        options: ImageBuildOptions,
        cancel: &CancellationToken,
    ) -> ImageBuildOutcome;
}

//! Scripted collaborators for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cancellation::CancellationToken;
use crate::collaborators::{
    CloneCollaborator, CloneOptions, CloneOutcome, ImageBuildCollaborator, ImageBuildOptions,
    ImageBuildOutcome,
};

/// A clone collaborator that creates the target directory instead of
/// cloning, unless a failure was scripted for the URL.
#[derive(Debug, Default)]
pub struct MockCloner {
    failures: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<(String, PathBuf)>>,
    delay: Mutex<Option<Duration>>,
}

impl MockCloner {
    /// Creates a cloner that succeeds for every URL.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes clones of `url` fail with `error`.
    pub fn fail_url(&self, url: impl Into<String>, error: impl Into<String>) {
        self.failures.lock().insert(url.into(), error.into());
    }

    /// Makes every clone take `delay` unless cancelled.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Returns the number of clone calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Returns the URLs cloned, in call order.
    #[must_use]
    pub fn cloned_urls(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(url, _)| url.clone()).collect()
    }
}

#[async_trait]
impl CloneCollaborator for MockCloner {
    async fn clone_repository(
        &self,
        url: &str,
        target: &Path,
        options: CloneOptions,
        cancel: &CancellationToken,
    ) -> CloneOutcome {
        self.calls.lock().push((url.to_string(), target.to_path_buf()));

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => return CloneOutcome::failed("clone interrupted"),
            }
        }

        let failure = self.failures.lock().get(url).cloned();
        if let Some(error) = failure {
            return CloneOutcome::failed(error);
        }
        if let Err(e) = std::fs::create_dir_all(target) {
            return CloneOutcome::failed(e.to_string());
        }
        if let Some(callback) = &options.on_progress {
            callback(100, "done");
        }
        CloneOutcome::ok()
    }
}

/// An image build collaborator that records requested images.
#[derive(Debug, Default)]
pub struct MockImageBuilder {
    failure: Mutex<Option<String>>,
    images: Mutex<Vec<String>>,
}

impl MockImageBuilder {
    /// Creates a builder that succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every build fail with `error`.
    pub fn fail_with(&self, error: impl Into<String>) {
        *self.failure.lock() = Some(error.into());
    }

    /// Returns the number of build calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.images.lock().len()
    }

    /// Returns the requested image names, in call order.
    #[must_use]
    pub fn images(&self) -> Vec<String> {
        self.images.lock().clone()
    }
}

#[async_trait]
impl ImageBuildCollaborator for MockImageBuilder {
    async fn build(
        &self,
        _context: &Path,
        image_name: &str,
        _options: ImageBuildOptions,
        _cancel: &CancellationToken,
    ) -> ImageBuildOutcome {
        self.images.lock().push(image_name.to_string());
        match self.failure.lock().clone() {
            Some(error) => ImageBuildOutcome::failed(error),
            None => ImageBuildOutcome::ok(image_name),
        }
    }
}

//! Retry policy per step kind.

use crate::core::StepKind;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};

/// Retry policies keyed by [`StepKind`].
///
/// By default custom scripts run exactly once: they are assumed to be
/// non-idempotent. Every other kind gets [`RetryPolicy::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KindRetryPolicies {
    /// Policy for dependency installation.
    pub dependency_install: RetryPolicy,
    /// Policy for build scripts.
    pub build_script: RetryPolicy,
    /// Policy for image builds.
    pub image_build: RetryPolicy,
    /// Policy for custom scripts.
    pub custom_script: RetryPolicy,
}

impl Default for KindRetryPolicies {
    fn default() -> Self {
        Self {
            dependency_install: RetryPolicy::default(),
            build_script: RetryPolicy::default(),
            image_build: RetryPolicy::default(),
            custom_script: RetryPolicy::no_retry(),
        }
    }
}

impl KindRetryPolicies {
    /// Uses the same policy for every kind.
    #[must_use]
    pub fn uniform(policy: RetryPolicy) -> Self {
        Self {
            dependency_install: policy.clone(),
            build_script: policy.clone(),
            image_build: policy.clone(),
            custom_script: policy,
        }
    }

    /// Replaces the policy of one kind.
    #[must_use]
    pub fn with_policy(mut self, kind: StepKind, policy: RetryPolicy) -> Self {
        *self.for_kind_mut(kind) = policy;
        self
    }

    /// Returns the policy of a kind.
    #[must_use]
    pub fn for_kind(&self, kind: StepKind) -> &RetryPolicy {
        match kind {
            StepKind::DependencyInstall => &self.dependency_install,
            StepKind::BuildScript => &self.build_script,
            StepKind::ImageBuild => &self.image_build,
            StepKind::CustomScript => &self.custom_script,
        }
    }

    fn for_kind_mut(&mut self, kind: StepKind) -> &mut RetryPolicy {
        match kind {
            StepKind::DependencyInstall => &mut self.dependency_install,
            StepKind::BuildScript => &mut self.build_script,
            StepKind::ImageBuild => &mut self.image_build,
            StepKind::CustomScript => &mut self.custom_script,
        }
    }
}

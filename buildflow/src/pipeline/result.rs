//! The record of one pipeline run.

use crate::chain::StepResult;
use crate::core::PipelinePhase;
use crate::errors::{ErrorKind, PipelineError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of a pipeline run.
///
/// Always produced, whatever the outcome; serializes to the JSON run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineResult {
    /// Unique id of the run.
    pub run_id: Uuid,
    /// True when the run completed without a failure from a required item.
    pub success: bool,
    /// Terminal phase.
    pub phase: PipelinePhase,
    /// Resolved repository build order.
    pub build_order: Vec<String>,
    /// Repositories present after the cloning phase.
    pub cloned_repositories: Vec<String>,
    /// Optional repositories left out of later phases because their clone
    /// failed.
    #[serde(default)]
    pub skipped_repositories: Vec<String>,
    /// Repositories whose build steps all succeeded.
    pub built_repositories: Vec<String>,
    /// Repositories whose image was built.
    pub image_built_repositories: Vec<String>,
    /// Repositories with at least one expected artifact.
    pub verified_repositories: Vec<String>,
    /// Every recorded failure, fatal or not.
    pub errors: Vec<PipelineError>,
    /// Results of the build steps that were submitted.
    #[serde(default)]
    pub steps: Vec<StepResult>,
    /// When the run started.
    pub start_time: DateTime<Utc>,
    /// When the run ended.
    pub end_time: DateTime<Utc>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl PipelineResult {
    pub(crate) fn started() -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            success: false,
            phase: PipelinePhase::Initializing,
            build_order: Vec::new(),
            cloned_repositories: Vec::new(),
            skipped_repositories: Vec::new(),
            built_repositories: Vec::new(),
            image_built_repositories: Vec::new(),
            verified_repositories: Vec::new(),
            errors: Vec::new(),
            steps: Vec::new(),
            start_time: now,
            end_time: now,
            duration_ms: 0,
        }
    }

    pub(crate) fn finish(mut self, phase: PipelinePhase) -> Self {
        self.phase = phase;
        self.end_time = Utc::now();
        self.duration_ms =
            u64::try_from((self.end_time - self.start_time).num_milliseconds()).unwrap_or(0);
        self.success = phase == PipelinePhase::Complete && !self.errors.iter().any(PipelineError::is_fatal);
        self
    }

    /// Build order without the skipped repositories.
    pub(crate) fn active_order(&self) -> Vec<String> {
        self.build_order
            .iter()
            .filter(|id| !self.skipped_repositories.contains(id))
            .cloned()
            .collect()
    }

    /// Errors that decided the outcome.
    pub fn fatal_errors(&self) -> impl Iterator<Item = &PipelineError> {
        self.errors.iter().filter(|e| e.is_fatal())
    }

    /// True when the run failed because the configuration was invalid.
    #[must_use]
    pub fn is_invalid_configuration(&self) -> bool {
        self.phase == PipelinePhase::Failed
            && self.errors.iter().any(|e| e.kind == ErrorKind::Validation)
    }

    /// Human-readable one-line outcome.
    #[must_use]
    pub fn summary(&self) -> String {
        match self.phase {
            PipelinePhase::Complete if self.errors.is_empty() => {
                "Pipeline completed successfully".to_string()
            }
            PipelinePhase::Complete => {
                format!("Pipeline completed with {} failures", self.errors.len())
            }
            PipelinePhase::Cancelled => "Pipeline cancelled".to_string(),
            _ => match self.fatal_errors().next() {
                Some(error) => format!("Pipeline failed: {error}"),
                None => "Pipeline failed".to_string(),
            },
        }
    }

    /// Serializes the result as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns the serializer error, which cannot happen for well-formed
    /// results.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_completion() {
        let result = PipelineResult::started().finish(PipelinePhase::Complete);
        assert!(result.success);
        assert_eq!(result.summary(), "Pipeline completed successfully");
    }

    #[test]
    fn test_non_fatal_errors_keep_success() {
        let mut result = PipelineResult::started();
        result.errors.push(PipelineError::non_fatal(PipelinePhase::Verifying, "api", "no artifacts"));
        let result = result.finish(PipelinePhase::Complete);

        assert!(result.success);
        assert_eq!(result.summary(), "Pipeline completed with 1 failures");
    }

    #[test]
    fn test_failed_summary_names_first_fatal_error() {
        let mut result = PipelineResult::started();
        result.errors.push(PipelineError::new(
            PipelinePhase::Cloning,
            "api",
            "clone failed",
            ErrorKind::Transient,
        ));
        let result = result.finish(PipelinePhase::Failed);

        assert!(!result.success);
        assert_eq!(result.summary(), "Pipeline failed: [cloning] api: clone failed");
    }

    #[test]
    fn test_invalid_configuration_is_distinguished() {
        let mut invalid = PipelineResult::started();
        invalid.errors.push(PipelineError::validation("configuration", "cycle"));
        let invalid = invalid.finish(PipelinePhase::Failed);

        let mut broken = PipelineResult::started();
        broken.errors.push(PipelineError::new(
            PipelinePhase::Building,
            "api",
            "exit 1",
            ErrorKind::Transient,
        ));
        let broken = broken.finish(PipelinePhase::Failed);

        assert!(invalid.is_invalid_configuration());
        assert!(!broken.is_invalid_configuration());
        assert!(!PipelineResult::started()
            .finish(PipelinePhase::Complete)
            .is_invalid_configuration());
    }

    #[test]
    fn test_cancelled() {
        let result = PipelineResult::started().finish(PipelinePhase::Cancelled);
        assert!(!result.success);
        assert_eq!(result.summary(), "Pipeline cancelled");
    }

    #[test]
    fn test_json_report_round_trips() {
        let result = PipelineResult::started().finish(PipelinePhase::Complete);
        let json = result.to_json().unwrap();
        assert!(json.contains("\"phase\": \"complete\""));
        let back: PipelineResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.run_id, result.run_id);
    }
}

//! Assertions for pipeline and chain results.

use crate::chain::ChainResult;
use crate::core::{PipelinePhase, StepStatus};
use crate::pipeline::PipelineResult;

/// Asserts that the run succeeded.
pub fn assert_pipeline_succeeded(result: &PipelineResult) {
    assert!(
        result.success,
        "Expected success, got {:?}: {}",
        result.phase,
        result.summary()
    );
}

/// Asserts the terminal phase of a run.
pub fn assert_pipeline_phase(result: &PipelineResult, expected: PipelinePhase) {
    assert_eq!(
        result.phase, expected,
        "Expected phase {:?}, got {:?}: {}",
        expected,
        result.phase,
        result.summary()
    );
}

/// Asserts that a step ended with the expected status.
pub fn assert_step_status(result: &ChainResult, step_id: &str, expected: StepStatus) {
    let step = result
        .step(step_id)
        .unwrap_or_else(|| panic!("No step '{step_id}' in chain result"));
    assert_eq!(
        step.step.status, expected,
        "Expected step '{}' to be {:?}, got {:?} ({})",
        step_id, expected, step.step.status, step.message
    );
}

/// Asserts that the chain counts add up to the number of steps.
pub fn assert_counts_consistent(result: &ChainResult) {
    assert_eq!(
        result.success_count + result.failure_count + result.skipped_count,
        result.step_results.len(),
        "Step counts do not add up"
    );
}

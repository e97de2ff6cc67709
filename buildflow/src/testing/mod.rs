//! Testing utilities for buildflow pipelines.
//!
//! This module provides:
//! - Scripted clone and image build collaborators
//! - Configuration fixtures
//! - Assertions for pipeline and chain results

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_counts_consistent, assert_pipeline_phase, assert_pipeline_succeeded,
    assert_step_status,
};
pub use fixtures::{two_repository_config, write_file};
pub use mocks::{MockCloner, MockImageBuilder};

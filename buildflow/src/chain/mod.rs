//! Build chains: ordered steps with dependencies, run one at a time.
//!
//! A chain is validated as a whole before anything runs. Each step is then
//! dispatched by kind to a retry-wrapped process run; failures either abort
//! the rest of the chain or are recorded and skipped past.

mod executor;
mod handlers;
mod policy;
mod step;

pub use executor::{BuildChainExecutor, ChainConfig, ChainResult};
pub use policy::KindRetryPolicies;
pub use step::{
    ImageSpec, Step, StepConfig, StepResult, SKIPPED_CANCELLED, SKIPPED_PREVIOUS_FAILURE,
};

pub(crate) use handlers::shell_quote;

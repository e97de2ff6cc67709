//! Dependency graph resolution.
//!
//! Used both for build steps inside a chain and for cross-repository build
//! ordering. The resolver is pure: every call works on the graph it is given
//! and keeps no run state.

mod resolver;

pub use resolver::{order, validate, DependencyGraph};

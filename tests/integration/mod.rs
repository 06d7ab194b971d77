//! Integration testing framework for depharness
//!
//! Scenarios drive the library harness and the `depharness` binary against
//! real child processes and in-process HTTP readiness stubs.

pub mod infrastructure;
pub mod scenarios;

pub use infrastructure::{CliTestHarness, HealthStub};

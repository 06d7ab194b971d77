//! Dependent process harness.
//!
//! Launches auxiliary service processes, blocks until each answers its HTTP
//! readiness probe, and guarantees they are terminated afterwards, whether
//! startup succeeded, failed partway, or was cancelled.
//!
//! ```no_run
//! use depharness::{DependentProcessHarness, HarnessConfig, ProcessSpec};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> depharness::Result<()> {
//! let config = HarnessConfig::new(vec![
//!     ProcessSpec::new("fraud", "java")
//!         .with_args(["-Dquarkus.http.port={port}", "-jar", "fraud-runner.jar"])
//!         .with_port(8082),
//! ]);
//!
//! let mut harness = DependentProcessHarness::new(config)?;
//! let result = harness.start(&CancellationToken::new()).await;
//! // ... run the tests ...
//! harness.stop().await;
//! result.map(|_| ())
//! # }
//! ```

pub mod config;
pub mod environment;
pub mod error;
pub mod harness;
pub mod ports;
pub mod process_manager;
pub mod readiness;
pub mod signals;

pub use config::{HarnessConfig, LaunchOrder, LaunchPlan, ProcessSpec, ReadinessSettings, ShutdownSettings};
pub use environment::Environment;
pub use error::HarnessError;
pub use harness::{with_dependencies, DependentProcessHarness, HarnessState};
pub use process_manager::{pid_alive, ManagedProcess, ProcessState};
pub use readiness::{ProbeOutcome, ReadinessProbe};

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;

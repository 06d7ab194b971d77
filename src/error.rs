use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

use crate::harness::HarnessState;

/// Errors surfaced by the harness
///
/// Transient probe failures never show up here; they are retried inside the
/// readiness loop until its budget runs out.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("process '{name}' did not become ready at {url} within {waited:?}")]
    StartupTimeout {
        name: String,
        url: String,
        waited: Duration,
    },

    #[error("failed to launch process '{name}' ({program})")]
    LaunchFailure {
        name: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process '{name}' exited before becoming ready: {status}")]
    ExitedBeforeReady { name: String, status: ExitStatus },

    #[error("port {port} for process '{name}' is not available")]
    PortUnavailable {
        name: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("startup cancelled while waiting for process '{name}'")]
    Cancelled { name: String },

    #[error("invalid harness configuration: {0}")]
    Config(String),

    #[error("failed to read configuration file {path}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration")]
    ConfigParse(#[from] toml::de::Error),

    #[error("readiness probe client error")]
    Probe(#[from] reqwest::Error),

    #[error("operation not allowed in harness state {0:?}")]
    InvalidState(HarnessState),
}

impl HarnessError {
    /// Name of the process the error refers to, if any
    pub fn process_name(&self) -> Option<&str> {
        match self {
            HarnessError::StartupTimeout { name, .. }
            | HarnessError::LaunchFailure { name, .. }
            | HarnessError::ExitedBeforeReady { name, .. }
            | HarnessError::PortUnavailable { name, .. }
            | HarnessError::Cancelled { name } => Some(name),
            _ => None,
        }
    }
}

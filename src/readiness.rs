use reqwest::{Client, StatusCode, Url};
use std::process::ExitStatus;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::config::ReadinessSettings;
use crate::error::HarnessError;
use crate::Result;

/// Result of a single probe attempt
#[derive(Debug)]
pub enum ProbeOutcome {
    /// Endpoint answered with a 2xx status
    Ready(StatusCode),
    /// Endpoint answered, but not with 2xx
    NotReady(StatusCode),
    /// Connection refused, reset, timed out, or similar
    Unreachable(reqwest::Error),
}

impl ProbeOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, ProbeOutcome::Ready(_))
    }
}

/// HTTP readiness checker with bounded polling.
///
/// Every attempt has its own short connect/read timeout so a single hung
/// request cannot eat the whole readiness budget.
#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    client: Client,
    settings: ReadinessSettings,
}

impl ReadinessProbe {
    pub fn new(settings: ReadinessSettings) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(settings.probe_timeout)
            .timeout(settings.probe_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;
        Ok(Self { client, settings })
    }

    pub fn settings(&self) -> &ReadinessSettings {
        &self.settings
    }

    /// Performs one GET against `url` and classifies the answer.
    ///
    /// The body is never read.
    pub async fn probe(&self, url: &Url) -> ProbeOutcome {
        match self.client.get(url.clone()).send().await {
            Ok(response) if response.status().is_success() => {
                ProbeOutcome::Ready(response.status())
            }
            Ok(response) => ProbeOutcome::NotReady(response.status()),
            Err(e) => ProbeOutcome::Unreachable(e),
        }
    }

    /// Polls `url` until it answers 2xx, the budget runs out, `cancel`
    /// fires, or `exited` reports that the process behind it has died.
    ///
    /// Returns how long it took to become ready.
    pub async fn wait_ready<F>(
        &self,
        name: &str,
        url: &Url,
        cancel: &CancellationToken,
        mut exited: F,
    ) -> Result<Duration>
    where
        F: FnMut() -> Option<ExitStatus>,
    {
        let started = Instant::now();
        let deadline = started + self.settings.timeout;
        let mut attempts: u32 = 0;

        debug!("Waiting for '{}' to become ready at {}", name, url);

        loop {
            attempts += 1;
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(HarnessError::Cancelled { name: name.to_string() });
                }
                outcome = self.probe(url) => outcome,
            };

            match outcome {
                ProbeOutcome::Ready(status) => {
                    let elapsed = started.elapsed();
                    info!(
                        "Process '{}' ready after {:?} ({} attempts, status {})",
                        name, elapsed, attempts, status
                    );
                    return Ok(elapsed);
                }
                ProbeOutcome::NotReady(status) => {
                    trace!("'{}' not ready yet: status {}", name, status);
                }
                ProbeOutcome::Unreachable(e) => {
                    trace!("'{}' not reachable yet: {}", name, e);
                }
            }

            if let Some(status) = exited() {
                return Err(HarnessError::ExitedBeforeReady {
                    name: name.to_string(),
                    status,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(HarnessError::StartupTimeout {
                    name: name.to_string(),
                    url: url.to_string(),
                    waited: now - started,
                });
            }

            let pause = self.settings.poll_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(HarnessError::Cancelled { name: name.to_string() });
                }
                _ = sleep(pause) => {}
            }
        }
    }
}

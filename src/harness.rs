use futures::future::{join_all, try_join_all};
use nix::unistd::Pid;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{HarnessConfig, LaunchOrder, LaunchPlan, ProcessSpec};
use crate::environment::{override_key, Environment};
use crate::error::HarnessError;
use crate::ports::PortAllocator;
use crate::process_manager::ManagedProcess;
use crate::readiness::ReadinessProbe;
use crate::Result;

/// Lifecycle of the harness as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarnessState {
    NotStarted,
    Starting,
    Ready,
    /// `start()` failed; whatever was launched is still held for `stop()`
    Failed,
    Stopped,
}

/// Brings a fixed set of auxiliary services up before a test run and
/// guarantees they are torn down afterwards.
///
/// Every process launched by [`start`](Self::start) is retained until
/// [`stop`](Self::stop), including when `start` fails partway through.
pub struct DependentProcessHarness {
    config: HarnessConfig,
    probe: ReadinessProbe,
    ports: PortAllocator,
    processes: Vec<ManagedProcess>,
    overrides: Environment,
    state: HarnessState,
}

impl DependentProcessHarness {
    pub fn new(config: HarnessConfig) -> Result<Self> {
        config.validate()?;
        let probe = ReadinessProbe::new(config.readiness)?;
        let ports = PortAllocator::new(config.bind_address);
        Ok(Self {
            config,
            probe,
            ports,
            processes: Vec::new(),
            overrides: Environment::new(),
            state: HarnessState::NotStarted,
        })
    }

    pub fn state(&self) -> HarnessState {
        self.state
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Processes currently held by the harness
    pub fn processes(&self) -> &[ManagedProcess] {
        &self.processes
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.processes.iter().map(ManagedProcess::pid).collect()
    }

    /// Overrides discovered by the last successful `start()`
    pub fn overrides(&self) -> &Environment {
        &self.overrides
    }

    /// Launches every configured process and waits until each is ready.
    ///
    /// Returns the entries the caller should merge into its own
    /// configuration: dynamically chosen ports and their readiness URLs (and
    /// fixed ones too when `export_fixed` is set).
    ///
    /// On error the harness moves to [`HarnessState::Failed`]; the caller is
    /// still expected to call [`stop`](Self::stop).
    ///
    /// # Arguments
    /// * `cancel` - Aborts the readiness wait with `HarnessError::Cancelled`
    ///
    /// # Returns
    /// * `Result<Environment>` - Override entries on success, otherwise the
    ///   first launch, port or readiness failure
    pub async fn start(&mut self, cancel: &CancellationToken) -> Result<Environment> {
        if self.state != HarnessState::NotStarted {
            return Err(HarnessError::InvalidState(self.state));
        }
        self.state = HarnessState::Starting;
        info!(
            "Starting {} dependent processes ({:?})",
            self.config.processes.len(),
            self.config.launch_order
        );

        let result = match self.config.launch_order {
            LaunchOrder::Sequential => self.start_sequential(cancel).await,
            LaunchOrder::Parallel => self.start_parallel(cancel).await,
        };

        match result {
            Ok(()) => {
                self.overrides = self.collect_overrides();
                self.state = HarnessState::Ready;
                info!("All dependent processes ready");
                Ok(self.overrides.clone())
            }
            Err(e) => {
                match e.process_name() {
                    Some(name) => error!("Harness startup failed at '{}': {}", name, e),
                    None => error!("Harness startup failed: {}", e),
                }
                self.state = HarnessState::Failed;
                Err(e)
            }
        }
    }

    async fn start_sequential(&mut self, cancel: &CancellationToken) -> Result<()> {
        let specs = self.config.processes.clone();
        for spec in &specs {
            if cancel.is_cancelled() {
                return Err(HarnessError::Cancelled {
                    name: spec.name.clone(),
                });
            }
            self.launch(spec)?;

            let probe = &self.probe;
            if let Some(process) = self.processes.last_mut() {
                let name = process.name().to_string();
                let url = process.plan().health_url.clone();
                probe
                    .wait_ready(&name, &url, cancel, || process.try_exit_status())
                    .await?;
            }
        }
        Ok(())
    }

    async fn start_parallel(&mut self, cancel: &CancellationToken) -> Result<()> {
        let specs = self.config.processes.clone();
        for spec in &specs {
            self.launch(spec)?;
        }

        let probe = &self.probe;
        let waits = self.processes.iter_mut().map(|process| async move {
            let name = process.name().to_string();
            let url = process.plan().health_url.clone();
            probe
                .wait_ready(&name, &url, cancel, || process.try_exit_status())
                .await
        });
        try_join_all(waits).await?;
        Ok(())
    }

    /// Resolves the port for `spec`, then spawns it and retains the handle.
    fn launch(&mut self, spec: &ProcessSpec) -> Result<()> {
        let port = match spec.port {
            None => None,
            Some(0) => Some(self.ports.allocate().map_err(|source| {
                HarnessError::PortUnavailable {
                    name: spec.name.clone(),
                    port: 0,
                    source,
                }
            })?),
            Some(port) => Some(self.ports.claim(port).map_err(|source| {
                HarnessError::PortUnavailable {
                    name: spec.name.clone(),
                    port,
                    source,
                }
            })?),
        };

        let plan = LaunchPlan::resolve(spec, port)?;
        let process = ManagedProcess::launch(plan)?;
        self.processes.push(process);
        Ok(())
    }

    fn collect_overrides(&self) -> Environment {
        let mut overrides = Environment::new();
        for (spec, process) in self.config.processes.iter().zip(&self.processes) {
            if !(spec.wants_dynamic_port() || self.config.export_fixed) {
                continue;
            }
            if let Some(port) = process.port() {
                overrides.set(override_key(&spec.name, "PORT"), port.to_string());
            }
            overrides.set(
                override_key(&spec.name, "URL"),
                process.plan().health_url.to_string(),
            );
        }
        overrides
    }

    /// Terminates every retained process: SIGTERM, grace period, SIGKILL.
    ///
    /// Processes are stopped concurrently, so the whole call takes about one
    /// grace period. Each process group is SIGKILLed at the end even when its
    /// leader exited earlier, which catches servers that outlive a launcher
    /// script.
    ///
    /// Idempotent, a no-op before `start()`, and never fails; teardown
    /// problems are logged.
    pub async fn stop(&mut self) {
        if self.processes.is_empty() {
            if matches!(self.state, HarnessState::Ready | HarnessState::Failed) {
                self.state = HarnessState::Stopped;
            }
            return;
        }

        info!("Stopping {} dependent processes", self.processes.len());
        let grace_period = self.config.shutdown.grace_period;
        let mut processes = std::mem::take(&mut self.processes);

        let results = join_all(
            processes
                .iter_mut()
                .map(|process| process.shutdown(grace_period)),
        )
        .await;

        for (process, status) in processes.iter().zip(results) {
            match status {
                Some(status) => info!("Process '{}' stopped ({})", process.name(), status),
                None => warn!(
                    "Process '{}' (PID {}) could not be confirmed stopped",
                    process.name(),
                    process.pid()
                ),
            }
        }

        self.state = HarnessState::Stopped;
    }
}

/// Starts the harness, runs `body` with the overrides, and always stops the
/// harness afterwards, whether startup failed or `body` finished.
pub async fn with_dependencies<F, Fut, T>(
    config: HarnessConfig,
    cancel: &CancellationToken,
    body: F,
) -> Result<T>
where
    F: FnOnce(Environment) -> Fut,
    Fut: Future<Output = T>,
{
    let mut harness = DependentProcessHarness::new(config)?;
    let overrides = match harness.start(cancel).await {
        Ok(overrides) => overrides,
        Err(e) => {
            harness.stop().await;
            return Err(e);
        }
    };
    let output = body(overrides).await;
    harness.stop().await;
    Ok(output)
}

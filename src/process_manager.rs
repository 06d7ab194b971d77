use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::LaunchPlan;
use crate::error::HarnessError;
use crate::Result;

/// How long to wait for the kernel to deliver SIGKILL before reaping
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Poll interval while waiting for the rest of a process group to exit
const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lifecycle of one managed process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Process has been spawned and has not been observed to exit
    Running,
    /// SIGTERM sent, waiting for exit
    Stopping,
    /// Process has exited and been reaped
    Exited,
}

/// An auxiliary service process owned by the harness.
///
/// The child runs in its own process group so termination reaches anything
/// it forks (JVM launchers, shell wrappers). The group outlives its leader:
/// a launcher may exit while the server it backgrounded keeps running, so
/// teardown always ends with a SIGKILL to the group, and dropping a
/// `ManagedProcess` whose group was never swept does the same.
#[derive(Debug)]
pub struct ManagedProcess {
    plan: LaunchPlan,
    pid: Pid,
    child: Option<Child>,
    state: ProcessState,
    exit_status: Option<ExitStatus>,
    started_at: Instant,
    /// Set once the group has been SIGKILLed after the leader exited
    group_swept: bool,
}

impl ManagedProcess {
    /// Spawns the process described by `plan`.
    ///
    /// The child becomes the leader of a new process group, inherits the
    /// harness's stdio when `plan.inherit_stdio` is set, and is killed if the
    /// handle is dropped. Must be called from within a tokio runtime.
    ///
    /// # Arguments
    /// * `plan` - Fully resolved command, arguments, working directory and env
    ///
    /// # Returns
    /// * `Result<Self>` - The running process, or `HarnessError::LaunchFailure`
    ///   when the OS refuses to spawn it
    pub fn launch(plan: LaunchPlan) -> Result<Self> {
        info!(
            "Launching process '{}': {} {:?}",
            plan.name,
            plan.program.display(),
            plan.args
        );

        let mut command = Command::new(&plan.program);
        command.args(&plan.args);
        command.envs(plan.env.iter());

        // Own process group, so a terminal Ctrl+C only reaches the harness
        // and teardown can signal the whole tree.
        command.process_group(0);
        command.kill_on_drop(true);
        if plan.inherit_stdio {
            command.stdin(Stdio::inherit());
            command.stdout(Stdio::inherit());
            command.stderr(Stdio::inherit());
        } else {
            command.stdin(Stdio::null());
            command.stdout(Stdio::null());
            command.stderr(Stdio::null());
        }

        if let Some(ref work_dir) = plan.working_dir {
            command.current_dir(work_dir);
        }

        let launch_error = |source: std::io::Error| HarnessError::LaunchFailure {
            name: plan.name.clone(),
            program: plan.program.display().to_string(),
            source,
        };

        let child = command.spawn().map_err(launch_error)?;
        let raw_pid = child
            .id()
            .ok_or_else(|| launch_error(std::io::Error::other("spawned process has no pid")))?;
        let pid = Pid::from_raw(raw_pid as i32);

        info!("Process '{}' spawned with PID: {}", plan.name, pid);

        Ok(Self {
            plan,
            pid,
            child: Some(child),
            state: ProcessState::Running,
            exit_status: None,
            started_at: Instant::now(),
            group_swept: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.plan.name
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn plan(&self) -> &LaunchPlan {
        &self.plan
    }

    pub fn port(&self) -> Option<u16> {
        self.plan.port
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Checks without blocking whether the process is still alive.
    ///
    /// Reaps the process if it has exited.
    pub fn is_running(&mut self) -> bool {
        self.try_exit_status().is_none() && self.child.is_some()
    }

    /// Returns the exit status if the process has exited, reaping it.
    pub fn try_exit_status(&mut self) -> Option<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Some(status);
        }
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                self.mark_exited(status);
                Some(status)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to poll process '{}': {}", self.plan.name, e);
                None
            }
        }
    }

    /// Asks the process group to terminate (SIGTERM).
    pub fn terminate(&mut self) -> nix::Result<()> {
        if self.state == ProcessState::Running {
            self.state = ProcessState::Stopping;
        }
        if self.group_swept {
            return Ok(());
        }
        signal_group(self.pid, Signal::SIGTERM)
    }

    /// Kills the process group (SIGKILL).
    pub fn force_kill(&self) -> nix::Result<()> {
        if self.group_swept {
            return Ok(());
        }
        signal_group(self.pid, Signal::SIGKILL)
    }

    /// Waits for the group leader to exit.
    ///
    /// Returns `None` if the handle was already released.
    pub async fn wait_for_exit(&mut self) -> std::io::Result<Option<ExitStatus>> {
        if let Some(status) = self.exit_status {
            return Ok(Some(status));
        }
        match self.child.as_mut() {
            Some(child) => {
                let status = child.wait().await?;
                self.mark_exited(status);
                Ok(Some(status))
            }
            None => Ok(None),
        }
    }

    /// Terminates the process and everything left in its process group.
    ///
    /// Sends SIGTERM to the group and waits up to `grace_period` for the
    /// leader and then the remaining members to exit. Whatever is still
    /// there afterwards is SIGKILLed. The group is killed even when the
    /// leader had already exited on its own, since a launcher script may
    /// leave its server running in the background.
    ///
    /// Never fails; problems are logged. Calling it again is a no-op.
    ///
    /// # Arguments
    /// * `grace_period` - Time the group gets to exit after SIGTERM
    ///
    /// # Returns
    /// * `Option<ExitStatus>` - Exit status of the group leader, or `None`
    ///   if it could not be reaped
    pub async fn shutdown(&mut self, grace_period: Duration) -> Option<ExitStatus> {
        if self.group_swept {
            return self.exit_status;
        }

        if let Some(status) = self.try_exit_status() {
            debug!(
                "Process '{}' already exited with {} after {:?}",
                self.plan.name,
                status,
                self.uptime()
            );
            self.child = None;
            self.stop_orphaned_group(grace_period).await;
            return Some(status);
        }
        if self.child.is_none() {
            self.stop_orphaned_group(grace_period).await;
            return None;
        }

        info!(
            "Stopping process '{}' (PID {}, up {:?}), grace period {:?}",
            self.plan.name,
            self.pid,
            self.uptime(),
            grace_period
        );

        let deadline = Instant::now() + grace_period;
        if let Err(e) = self.terminate() {
            warn!("Failed to send SIGTERM to '{}': {}", self.plan.name, e);
        }

        match timeout(grace_period, self.wait_for_exit()).await {
            Ok(Ok(status)) => {
                info!("Process '{}' exited gracefully", self.plan.name);
                self.child = None;
                self.await_group_exit(deadline).await;
                self.sweep_group();
                return status;
            }
            Ok(Err(e)) => {
                warn!("Error waiting for '{}' to exit: {}", self.plan.name, e);
            }
            Err(_) => {
                warn!(
                    "Process '{}' did not exit within {:?}, forcing kill",
                    self.plan.name, grace_period
                );
            }
        }

        if let Err(e) = self.force_kill() {
            warn!("Failed to send SIGKILL to '{}': {}", self.plan.name, e);
        }

        let status = match timeout(KILL_REAP_TIMEOUT, self.wait_for_exit()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                warn!("Error reaping '{}': {}", self.plan.name, e);
                None
            }
            Err(_) => {
                warn!(
                    "Process '{}' still not reaped {:?} after SIGKILL",
                    self.plan.name, KILL_REAP_TIMEOUT
                );
                None
            }
        };

        // Releasing the handle also triggers kill_on_drop if reaping failed.
        self.child = None;
        self.sweep_group();
        if status.is_some() {
            info!("Process '{}' killed", self.plan.name);
        }
        status
    }

    /// Terminates whatever the leader left behind in its group: SIGTERM,
    /// up to `grace_period` to exit, then SIGKILL.
    async fn stop_orphaned_group(&mut self, grace_period: Duration) {
        if group_exists(self.pid) {
            info!(
                "Process '{}' exited but its process group is still alive, stopping it",
                self.plan.name
            );
            let deadline = Instant::now() + grace_period;
            if let Err(e) = signal_group(self.pid, Signal::SIGTERM) {
                warn!("Failed to send SIGTERM to group of '{}': {}", self.plan.name, e);
            }
            self.await_group_exit(deadline).await;
        }
        self.sweep_group();
    }

    /// Lets the remaining group members finish their SIGTERM handling until
    /// `deadline`.
    async fn await_group_exit(&self, deadline: Instant) {
        while group_exists(self.pid) {
            if Instant::now() >= deadline {
                warn!(
                    "Process group of '{}' still has members after the grace period",
                    self.plan.name
                );
                return;
            }
            sleep(GROUP_POLL_INTERVAL).await;
        }
    }

    /// SIGKILLs whatever is left in the process group. Only valid once the
    /// leader is gone; runs at most once.
    fn sweep_group(&mut self) {
        if self.group_swept {
            return;
        }
        self.group_swept = true;
        if let Err(e) = signal_group(self.pid, Signal::SIGKILL) {
            warn!(
                "Failed to kill process group {} of '{}': {}",
                self.pid, self.plan.name, e
            );
        }
    }

    fn mark_exited(&mut self, status: ExitStatus) {
        self.exit_status = Some(status);
        self.state = ProcessState::Exited;
        debug!("Process '{}' exited with status: {}", self.plan.name, status);
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if self.group_swept {
            return;
        }
        if self.state != ProcessState::Exited {
            eprintln!(
                "ManagedProcess '{}' dropped while running (PID: {}), killing process group",
                self.plan.name, self.pid
            );
        }
        // Also covers a leader that exited on its own and left members behind
        if let Err(e) = signal_group(self.pid, Signal::SIGKILL) {
            eprintln!(
                "Failed to kill process group {} during emergency cleanup: {}",
                self.pid, e
            );
        }
    }
}

/// Sends `signal` to the process group led by `pgid`. A group that is
/// already gone counts as success.
fn signal_group(pgid: Pid, signal: Signal) -> nix::Result<()> {
    debug!("Sending {:?} to process group {}", signal, pgid);
    match kill(Pid::from_raw(-pgid.as_raw()), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Whether any process is left in the group led by `pgid`.
fn group_exists(pgid: Pid) -> bool {
    !matches!(kill(Pid::from_raw(-pgid.as_raw()), None), Err(Errno::ESRCH))
}

/// Checks at OS level whether `pid` still exists and has not exited.
pub fn pid_alive(pid: Pid) -> bool {
    if matches!(kill(pid, None), Err(Errno::ESRCH)) {
        return false;
    }
    // A zombie has exited but not been reaped yet
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => {
            let state = stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.trim_start().chars().next());
            state != Some('Z')
        }
        Err(_) => !matches!(kill(pid, None), Err(Errno::ESRCH)),
    }
}

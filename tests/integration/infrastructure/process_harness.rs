use anyhow::{Context, Result};
use depharness::pid_alive;
use nix::{sys::signal::Signal, unistd::Pid};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::process::Command;
use tokio::time::{sleep, timeout};

/// Runs the `depharness` binary against configs written to a scratch dir
pub struct CliTestHarness {
    binary: PathBuf,
    temp_dir: TempDir,
    cleanup_pids: Vec<Pid>,
}

impl CliTestHarness {
    pub fn new() -> Result<Self> {
        let temp_dir = TempDir::new().context("Failed to create temporary directory")?;
        Ok(Self {
            binary: PathBuf::from(env!("CARGO_BIN_EXE_depharness")),
            temp_dir,
            cleanup_pids: Vec::new(),
        })
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes `contents` as the harness config and returns its path
    pub fn write_config(&self, contents: &str) -> Result<PathBuf> {
        let path = self.temp_dir.path().join("harness.toml");
        std::fs::write(&path, contents).context("Failed to write harness config")?;
        Ok(path)
    }

    /// A shell command line for a managed service that records its PID in
    /// `pid_file` and then sleeps
    pub fn pid_recording_sleeper(&self, pid_file: &Path) -> String {
        format!("echo $$ > {}; exec sleep 30", pid_file.display())
    }

    pub async fn spawn(&mut self, args: &[&str]) -> Result<TestProcess> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        cmd.kill_on_drop(true);

        let child = cmd.spawn().context("Failed to spawn depharness")?;
        let pid = Pid::from_raw(
            child
                .id()
                .ok_or_else(|| anyhow::anyhow!("Failed to get child PID"))? as i32,
        );
        self.cleanup_pids.push(pid);

        Ok(TestProcess {
            pid,
            start_time: Instant::now(),
            child,
        })
    }
}

impl Drop for CliTestHarness {
    fn drop(&mut self) {
        for pid in &self.cleanup_pids {
            let _ = nix::sys::signal::kill(*pid, Signal::SIGKILL);
        }
    }
}

pub struct TestProcess {
    pub pid: Pid,
    pub start_time: Instant,
    child: tokio::process::Child,
}

impl TestProcess {
    /// Wait for process exit with a timeout; `None` means it timed out
    pub async fn wait_for_exit_timeout(&mut self, duration: Duration) -> Result<Option<ExitStatus>> {
        match timeout(duration, self.child.wait()).await {
            Ok(result) => Ok(Some(result.context("Process wait failed")?)),
            Err(_) => Ok(None),
        }
    }

    pub fn runtime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn is_running(&mut self) -> bool {
        self.child.try_wait().unwrap_or(None).is_none()
    }
}

/// Waits for a service to write its PID file and parses it
pub async fn read_pid(path: &Path, within: Duration) -> Result<Pid> {
    let deadline = Instant::now() + within;
    loop {
        if let Ok(contents) = std::fs::read_to_string(path) {
            if let Ok(raw) = contents.trim().parse::<i32>() {
                return Ok(Pid::from_raw(raw));
            }
        }
        if Instant::now() >= deadline {
            anyhow::bail!("PID file {} not written within {:?}", path.display(), within);
        }
        sleep(Duration::from_millis(20)).await;
    }
}

/// Polls until `pid` is gone; returns whether it died within `within`
pub async fn wait_until_dead(pid: Pid, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    while pid_alive(pid) {
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(20)).await;
    }
    true
}

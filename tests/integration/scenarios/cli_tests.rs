use crate::infrastructure::{read_pid, wait_until_dead, CliTestHarness, HealthStub};
use anyhow::Result;
use nix::sys::signal::{kill, Signal};
use std::time::Duration;

fn service_config(harness: &CliTestHarness, stub: &HealthStub, pid_file: &str, port: Option<u16>) -> String {
    let script = harness.pid_recording_sleeper(&harness.temp_path().join(pid_file));
    let port_line = port.map(|p| format!("port = {p}")).unwrap_or_default();
    format!(
        r#"
[readiness]
poll_interval_ms = 100

[shutdown]
grace_period_ms = 2000

[[process]]
name = "fraud"
program = "sh"
args = ["-c", "{script}"]
health_url = "{url}"
inherit_stdio = false
{port_line}
"#,
        url = stub.url(),
    )
}

/// The command runs once dependencies are ready and its exit code is
/// passed through; dependencies are torn down afterwards
#[tokio::test]
async fn test_command_exit_code_propagates() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let stub = HealthStub::start(true).await?;
    let mut harness = CliTestHarness::new()?;
    let config = harness.write_config(&service_config(&harness, &stub, "fraud.pid", None))?;

    let mut process = harness
        .spawn(&["--config", config.to_str().unwrap(), "--", "sh", "-c", "exit 3"])
        .await?;

    let status = process
        .wait_for_exit_timeout(Duration::from_secs(15))
        .await?
        .expect("depharness should exit after the command");
    assert_eq!(status.code(), Some(3));
    assert!(stub.hits() >= 1);

    let service_pid = read_pid(&harness.temp_path().join("fraud.pid"), Duration::from_secs(1)).await?;
    assert!(wait_until_dead(service_pid, Duration::from_secs(2)).await);
    Ok(())
}

/// Overrides reach the command's environment
#[tokio::test]
async fn test_command_sees_dynamic_port() -> Result<()> {
    let stub = HealthStub::start(true).await?;
    let mut harness = CliTestHarness::new()?;
    let config = harness.write_config(&service_config(&harness, &stub, "fraud.pid", Some(0)))?;

    let mut process = harness
        .spawn(&[
            "--config",
            config.to_str().unwrap(),
            "--",
            "sh",
            "-c",
            "test -n \"$FRAUD_PORT\" && test -n \"$FRAUD_URL\"",
        ])
        .await?;

    let status = process
        .wait_for_exit_timeout(Duration::from_secs(15))
        .await?
        .expect("depharness should exit after the command");
    assert!(status.success());
    Ok(())
}

/// Startup failure exits non-zero and leaves no dependency behind
#[tokio::test]
async fn test_startup_failure_exits_nonzero() -> Result<()> {
    let stub = HealthStub::start(false).await?;
    let mut harness = CliTestHarness::new()?;
    let config = harness.write_config(&service_config(&harness, &stub, "fraud.pid", None))?;

    let mut process = harness
        .spawn(&[
            "--config",
            config.to_str().unwrap(),
            "--ready-timeout-secs",
            "1",
            "--",
            "sh",
            "-c",
            "exit 0",
        ])
        .await?;

    let status = process
        .wait_for_exit_timeout(Duration::from_secs(15))
        .await?
        .expect("depharness should give up after the readiness budget");
    assert!(!status.success());
    assert!(process.runtime() >= Duration::from_secs(1));

    let service_pid = read_pid(&harness.temp_path().join("fraud.pid"), Duration::from_secs(1)).await?;
    assert!(wait_until_dead(service_pid, Duration::from_secs(2)).await);
    Ok(())
}

/// Without a command the dependencies stay up until SIGTERM
#[tokio::test]
async fn test_sigterm_stops_dependencies() -> Result<()> {
    let stub = HealthStub::start(true).await?;
    let mut harness = CliTestHarness::new()?;
    let config = harness.write_config(&service_config(&harness, &stub, "fraud.pid", None))?;

    let mut process = harness.spawn(&["--config", config.to_str().unwrap()]).await?;

    let service_pid = read_pid(&harness.temp_path().join("fraud.pid"), Duration::from_secs(5)).await?;
    // Give the readiness probe time to succeed
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(process.is_running(), "depharness should keep running");

    kill(process.pid, Signal::SIGTERM)?;
    let status = process
        .wait_for_exit_timeout(Duration::from_secs(10))
        .await?
        .expect("depharness should exit after SIGTERM");
    assert!(status.success());
    assert!(wait_until_dead(service_pid, Duration::from_secs(2)).await);
    Ok(())
}

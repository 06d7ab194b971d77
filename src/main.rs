type Result<T> = color_eyre::eyre::Result<T>;

mod cli;

use clap::Parser;
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Config};
use depharness::signals::Signals;
use depharness::{DependentProcessHarness, Environment};

/// Exit code used when startup fails or no command ran
const FAILURE_EXIT_CODE: i32 = 1;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_cli(cli)?;

    let cancel = CancellationToken::new();
    Signals::new()?.cancel_on_signal(cancel.clone());

    let mut harness = DependentProcessHarness::new(config.harness.clone())?;

    let overrides = match harness.start(&cancel).await {
        Ok(overrides) => overrides,
        Err(e) => {
            harness.stop().await;
            return Err(e.into());
        }
    };

    for (key, value) in &overrides {
        info!("override {}={}", key, value);
    }

    let exit_code = match config.command {
        Some((program, args)) => run_command(&program, &args, &overrides, &cancel).await,
        None => {
            info!("Dependencies ready; waiting for SIGINT/SIGTERM");
            cancel.cancelled().await;
            0
        }
    };

    harness.stop().await;
    info!("depharness exiting with code {}", exit_code);
    std::process::exit(exit_code);
}

/// Runs the foreground command with the overrides merged into its
/// environment and maps its outcome to an exit code.
async fn run_command(
    program: &str,
    args: &[String],
    overrides: &Environment,
    cancel: &CancellationToken,
) -> i32 {
    info!("Running {} {:?}", program, args);

    let mut command = Command::new(program);
    command
        .args(args)
        .envs(overrides.iter())
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            error!("failed to run {}: {}", program, e);
            return FAILURE_EXIT_CODE;
        }
    };

    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => exit_code(status),
            Err(e) => {
                error!("error waiting for {}: {}", program, e);
                FAILURE_EXIT_CODE
            }
        },
        _ = cancel.cancelled() => {
            warn!("Interrupted, stopping {}", program);
            if let Err(e) = child.kill().await {
                warn!("failed to kill {}: {}", program, e);
            }
            130
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => FAILURE_EXIT_CODE,
    }
}

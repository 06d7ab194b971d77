use clap::Parser;
use eyre::{eyre, WrapErr};
use std::path::PathBuf;
use std::time::Duration;

use depharness::{HarnessConfig, LaunchOrder};

type Result<T> = color_eyre::eyre::Result<T>;

/// Start dependent services, wait until they are ready, run a command, and
/// tear everything down again
#[derive(Parser, Debug)]
#[command(name = "depharness")]
#[command(version)]
pub struct Cli {
    /// Harness configuration file (TOML)
    #[arg(long, short)]
    pub config: PathBuf,

    /// Interval between readiness probes (ms)
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// Readiness budget per process (seconds)
    #[arg(long)]
    pub ready_timeout_secs: Option<u64>,

    /// Timeout of a single readiness probe (ms)
    #[arg(long)]
    pub probe_timeout_ms: Option<u64>,

    /// Time a process gets to exit after SIGTERM before it is killed (ms)
    #[arg(long)]
    pub grace_period_ms: Option<u64>,

    /// Launch all processes first and wait for them concurrently
    #[arg(long)]
    pub parallel: bool,

    /// Command to run once every dependency is ready
    #[arg(last = true)]
    pub command: Vec<String>,
}

/// Resolved runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub harness: HarnessConfig,
    /// Program and arguments to run while the dependencies are up
    pub command: Option<(String, Vec<String>)>,
}

impl Config {
    /// Loads the config file and applies command line overrides
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let mut harness = HarnessConfig::from_file(&cli.config)
            .wrap_err_with(|| format!("loading {}", cli.config.display()))?;

        if let Some(ms) = cli.poll_interval_ms {
            harness.readiness.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = cli.ready_timeout_secs {
            harness.readiness.timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = cli.probe_timeout_ms {
            harness.readiness.probe_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = cli.grace_period_ms {
            harness.shutdown.grace_period = Duration::from_millis(ms);
        }
        if cli.parallel {
            harness.launch_order = LaunchOrder::Parallel;
        }
        harness
            .validate()
            .map_err(|e| eyre!("invalid configuration after overrides: {}", e))?;

        let mut command = cli.command.into_iter();
        let command = command.next().map(|program| (program, command.collect()));

        Ok(Config { harness, command })
    }
}

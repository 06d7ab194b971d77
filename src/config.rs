use reqwest::Url;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::environment::Environment;
use crate::error::HarnessError;
use crate::Result;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(1500);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Readiness URL used when a process only declares a port
pub const DEFAULT_HEALTH_URL: &str = "http://127.0.0.1:{port}/q/health/ready";

/// How processes are brought up during `start()`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchOrder {
    /// Launch one process, wait for it to be ready, then move to the next
    #[default]
    Sequential,
    /// Launch every process first, then wait for all of them concurrently
    Parallel,
}

/// Timing of the readiness polling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReadinessSettings {
    /// Pause between two probe attempts
    #[serde(rename = "poll_interval_ms", with = "millis")]
    pub poll_interval: Duration,
    /// Total budget for a single process to become ready
    #[serde(rename = "timeout_secs", with = "secs")]
    pub timeout: Duration,
    /// Connect and read timeout of one probe attempt
    #[serde(rename = "probe_timeout_ms", with = "millis")]
    pub probe_timeout: Duration,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_READY_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

/// Teardown behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShutdownSettings {
    /// How long a process gets to exit after SIGTERM before it is killed
    #[serde(rename = "grace_period_ms", with = "millis")]
    pub grace_period: Duration,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

/// One auxiliary service to launch.
///
/// `program`, `args`, `health_url` and env values may contain `{port}`,
/// `{name}` and `${VAR}` placeholders; they are expanded when the process is
/// about to be launched.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessSpec {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Fixed port, or `0` for a dynamically chosen one
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub health_url: Option<String>,
    #[serde(default)]
    pub env: Environment,
    #[serde(default = "default_inherit_stdio")]
    pub inherit_stdio: bool,
}

fn default_inherit_stdio() -> bool {
    true
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            port: None,
            health_url: None,
            env: Environment::new(),
            inherit_stdio: true,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_health_url(mut self, url: impl Into<String>) -> Self {
        self.health_url = Some(url.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.set(key, value);
        self
    }

    pub fn with_inherit_stdio(mut self, inherit: bool) -> Self {
        self.inherit_stdio = inherit;
        self
    }

    /// Whether the port has to be picked at launch time
    pub fn wants_dynamic_port(&self) -> bool {
        self.port == Some(0)
    }
}

/// Complete, immutable description of the services a harness manages
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    #[serde(default)]
    pub launch_order: LaunchOrder,
    #[serde(default)]
    pub readiness: ReadinessSettings,
    #[serde(default)]
    pub shutdown: ShutdownSettings,
    /// Report fixed ports and URLs in the overrides too, not only dynamic ones
    #[serde(default)]
    pub export_fixed: bool,
    /// Address used when checking and allocating ports
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    #[serde(rename = "process", default)]
    pub processes: Vec<ProcessSpec>,
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            launch_order: LaunchOrder::default(),
            readiness: ReadinessSettings::default(),
            shutdown: ShutdownSettings::default(),
            export_fixed: false,
            bind_address: default_bind_address(),
            processes: Vec::new(),
        }
    }
}

impl HarnessConfig {
    pub fn new(processes: Vec<ProcessSpec>) -> Self {
        Self {
            processes,
            ..Default::default()
        }
    }

    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: HarnessConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| HarnessError::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    pub fn with_readiness(mut self, readiness: ReadinessSettings) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.shutdown.grace_period = grace_period;
        self
    }

    pub fn with_launch_order(mut self, order: LaunchOrder) -> Self {
        self.launch_order = order;
        self
    }

    pub fn with_export_fixed(mut self, export_fixed: bool) -> Self {
        self.export_fixed = export_fixed;
        self
    }

    /// Checks the invariants `start()` relies on.
    pub fn validate(&self) -> Result<()> {
        if self.processes.is_empty() {
            return Err(HarnessError::Config("no processes configured".to_string()));
        }
        if self.readiness.poll_interval.is_zero() {
            return Err(HarnessError::Config("poll interval must be non-zero".to_string()));
        }
        if self.readiness.timeout.is_zero() {
            return Err(HarnessError::Config("readiness timeout must be non-zero".to_string()));
        }
        if self.readiness.probe_timeout.is_zero() {
            return Err(HarnessError::Config("probe timeout must be non-zero".to_string()));
        }

        let mut names = HashSet::new();
        let mut ports = HashSet::new();
        for spec in &self.processes {
            if spec.name.trim().is_empty() {
                return Err(HarnessError::Config("process name must not be empty".to_string()));
            }
            if !names.insert(spec.name.as_str()) {
                return Err(HarnessError::Config(format!(
                    "duplicate process name '{}'",
                    spec.name
                )));
            }
            if spec.program.trim().is_empty() {
                return Err(HarnessError::Config(format!(
                    "process '{}' has no program",
                    spec.name
                )));
            }
            match spec.port {
                Some(0) | None => {}
                Some(port) => {
                    if !ports.insert(port) {
                        return Err(HarnessError::Config(format!(
                            "port {} is assigned to more than one process",
                            port
                        )));
                    }
                }
            }
            if spec.health_url.is_none() && spec.port.is_none() {
                return Err(HarnessError::Config(format!(
                    "process '{}' needs a health_url or a port",
                    spec.name
                )));
            }
        }
        Ok(())
    }
}

/// A process spec with every placeholder resolved, ready to hand to the OS
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub port: Option<u16>,
    pub health_url: Url,
    pub env: Environment,
    pub inherit_stdio: bool,
}

impl LaunchPlan {
    /// Resolves `spec` against the concrete `port` it was assigned.
    pub fn resolve(spec: &ProcessSpec, port: Option<u16>) -> Result<Self> {
        let name = spec.name.as_str();

        let working_dir = match &spec.working_dir {
            Some(dir) if dir.is_relative() => {
                let cwd = std::env::current_dir().map_err(|e| {
                    HarnessError::Config(format!("cannot resolve working directory: {e}"))
                })?;
                Some(cwd.join(dir))
            }
            other => other.clone(),
        };

        let program = PathBuf::from(expand(&spec.program, name, port)?);
        let program = match &working_dir {
            Some(dir) if program.is_relative() && program.components().count() > 1 => {
                dir.join(program)
            }
            _ => program,
        };

        let args = spec
            .args
            .iter()
            .map(|arg| expand(arg, name, port))
            .collect::<Result<Vec<_>>>()?;

        let mut env = Environment::new();
        for (key, value) in &spec.env {
            env.set(key.clone(), expand(value, name, port)?);
        }

        let raw_url = spec.health_url.as_deref().unwrap_or(DEFAULT_HEALTH_URL);
        let expanded_url = expand(raw_url, name, port)?;
        let health_url = Url::parse(&expanded_url).map_err(|e| {
            HarnessError::Config(format!(
                "invalid health url '{}' for process '{}': {}",
                expanded_url, name, e
            ))
        })?;

        Ok(Self {
            name: spec.name.clone(),
            program,
            args,
            working_dir,
            port,
            health_url,
            env,
            inherit_stdio: spec.inherit_stdio,
        })
    }
}

/// Expands `{port}`, `{name}` and `${VAR}` in `template`.
///
/// Any other brace is kept literally so JSON-ish arguments pass through.
fn expand(template: &str, name: &str, port: Option<u16>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(idx) = rest.find(|c: char| c == '$' || c == '{') {
        out.push_str(&rest[..idx]);
        let tail = &rest[idx..];

        if let Some(var_tail) = tail.strip_prefix("${") {
            let end = var_tail.find('}').ok_or_else(|| {
                HarnessError::Config(format!("unterminated '${{' in '{}'", template))
            })?;
            let var = &var_tail[..end];
            let value = std::env::var(var).map_err(|_| {
                HarnessError::Config(format!(
                    "environment variable {} referenced by process '{}' is not set",
                    var, name
                ))
            })?;
            out.push_str(&value);
            rest = &var_tail[end + 1..];
        } else if let Some(after) = tail.strip_prefix("{port}") {
            let port = port.ok_or_else(|| {
                HarnessError::Config(format!(
                    "process '{}' uses {{port}} but has no port",
                    name
                ))
            })?;
            out.push_str(&port.to_string());
            rest = after;
        } else if let Some(after) = tail.strip_prefix("{name}") {
            out.push_str(name);
            rest = after;
        } else {
            out.push_str(&tail[..1]);
            rest = &tail[1..];
        }
    }

    out.push_str(rest);
    Ok(out)
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

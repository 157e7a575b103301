//! Engine configuration
//!
//! Every section has defaults, so an empty TOML file (or no file at all) is a
//! valid configuration. Durations use humantime syntax (`"5s"`, `"30m"`).

use crate::execution::IsolationKind;
use crate::limits::ResourceLimits;
use crate::policy::PolicyConfig;
use crate::Result;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding one workspace per sandbox
    pub workspace_root: PathBuf,
    /// Isolation strategy for every sandbox of this engine
    pub isolation: IsolationKind,
    pub ports: PortRange,
    pub limits: LimitsConfig,
    pub validator: PolicyConfig,
    pub readiness: ReadinessConfig,
    pub logs: LogConfig,
    pub commands: CommandConfig,
    pub process: ProcessConfig,
    pub container: ContainerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace_root: Self::default_workspace_root(),
            isolation: IsolationKind::default(),
            ports: PortRange::default(),
            limits: LimitsConfig::default(),
            validator: PolicyConfig::default(),
            readiness: ReadinessConfig::default(),
            logs: LogConfig::default(),
            commands: CommandConfig::default(),
            process: ProcessConfig::default(),
            container: ContainerConfig::default(),
        }
    }
}

/// Ports handed to sandboxes, inclusive on both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 4100,
            end: 4999,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Applied when a request carries no overrides
    pub default: ResourceLimits,
    /// Upper bound for any override
    pub ceiling: ResourceLimits,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default: ResourceLimits::default(),
            ceiling: ResourceLimits::permissive(),
        }
    }
}

/// How a starting sandbox is judged ready
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    /// Output substrings (case-insensitive) that mark the app as ready
    pub markers: Vec<String>,
    /// Fallback: ready once the app has stayed alive this long
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
    /// Liveness probe interval for containers
    #[serde(with = "humantime_serde")]
    pub probe_interval: Duration,
    /// Path requested by the HTTP liveness probe
    pub health_path: String,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            markers: ["ready", "listening", "server started", "compiled successfully"]
                .into_iter()
                .map(String::from)
                .collect(),
            grace_period: Duration::from_secs(5),
            probe_interval: Duration::from_millis(500),
            health_path: "/".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Ring buffer size per sandbox
    pub buffer_lines: usize,
    /// Largest tail a caller may request
    pub max_tail: usize,
    /// Tail used when the caller does not ask for one
    pub default_tail: usize,
    /// Resource sampling interval
    #[serde(with = "humantime_serde")]
    pub stats_interval: Duration,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            buffer_lines: 1000,
            max_tail: 1000,
            default_tail: 100,
            stats_interval: Duration::from_secs(5),
        }
    }
}

/// Install and run commands.
///
/// Arguments may contain `{entry}` and `{port}` placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub install: Vec<String>,
    pub run: Vec<String>,
    /// Host environment variables passed through to the process strategy
    pub env_passthrough: Vec<String>,
}

impl Default for CommandConfig {
    fn default() -> Self {
        let argv = |args: &[&str]| args.iter().map(|arg| arg.to_string()).collect();
        Self {
            install: argv(&[
                "npm",
                "install",
                "--omit=dev",
                "--ignore-scripts",
                "--no-audit",
                "--no-fund",
            ]),
            run: argv(&["npm", "start", "--ignore-scripts"]),
            env_passthrough: vec!["PATH".into()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Time between SIGTERM and SIGKILL on stop
    #[serde(with = "humantime_serde")]
    pub kill_grace: Duration,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            kill_grace: Duration::from_secs(3),
        }
    }
}

/// Container network mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    #[default]
    None,
    Bridge,
}

impl NetworkMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bridge => "bridge",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// docker-compatible CLI
    pub binary: String,
    pub base_image: String,
    pub network: NetworkMode,
    /// Non-root `uid:gid` the app runs as
    pub user: String,
    pub tmpfs_size: String,
    pub cap_add: Vec<String>,
    /// Port the app listens on inside the container
    pub container_port: u16,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".into(),
            base_image: "node:20-alpine".into(),
            network: NetworkMode::None,
            user: "1000:1000".into(),
            tmpfs_size: "64m".into(),
            cap_add: Vec::new(),
            container_port: 3000,
        }
    }
}

impl EngineConfig {
    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: EngineConfig = toml::from_str(content)?;
        if config.workspace_root.as_os_str().is_empty() {
            config.workspace_root = Self::default_workspace_root();
        }
        config.validate()?;
        Ok(config)
    }

    /// Serialize back to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.ports.start == 0 || self.ports.start > self.ports.end {
            bail!(
                "invalid port range {}..={}",
                self.ports.start,
                self.ports.end
            );
        }
        if self.commands.install.is_empty() || self.commands.run.is_empty() {
            bail!("install and run commands must not be empty");
        }
        if self.logs.buffer_lines == 0 || self.logs.max_tail == 0 {
            bail!("log buffer and max tail must be positive");
        }
        if self.limits.default.memory_bytes == 0 || self.limits.ceiling.memory_bytes == 0 {
            bail!("memory limits must be positive");
        }
        if self.logs.stats_interval.is_zero() || self.readiness.probe_interval.is_zero() {
            bail!("sampling and probe intervals must be positive");
        }
        if self.validator.manifest_file.is_empty() {
            bail!("validator.manifest_file must not be empty");
        }
        Ok(())
    }

    /// `$TMPDIR/forge-sandboxes`
    pub fn default_workspace_root() -> PathBuf {
        std::env::temp_dir().join("forge-sandboxes")
    }
}

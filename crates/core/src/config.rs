//! Manager configuration.
//!
//! Loaded from `config/sandbox.{toml,yaml,json}` (optional) overlaid with
//! `MCP_SANDBOX__SECTION__KEY` environment variables. Every field has a
//! default so an empty environment yields a usable configuration.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::types::NetworkMode;
use crate::{Error, Result};

/// Network mode template that accepts any valid container name.
pub const CONTAINER_MODE_TEMPLATE: &str = "container:<name>";

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ManagerConfig {
    pub runtime: RuntimeConfig,
    /// Accepted `networkMode` values, in the order reported to callers.
    pub network_modes: Vec<String>,
    /// Profile used when a request names no purpose.
    pub default_profile: String,
    pub profiles: HashMap<String, ImageProfile>,
    pub ports: PortConfig,
    pub staging: StagingConfig,
    pub lifecycle: LifecycleConfig,
    pub limits: LimitsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Unix socket of the Docker daemon; local defaults when unset.
    pub docker_socket: Option<String>,
}

/// Base image and entrypoint for one sandbox purpose.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ImageProfile {
    pub image: String,
    /// Port the tool server listens on inside the container.
    #[serde(default)]
    pub container_port: Option<u16>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_user")]
    pub user: String,
    /// Where staged files are mounted.
    #[serde(default = "default_workdir")]
    pub workdir: String,
}

fn default_user() -> String {
    "nobody".into()
}

fn default_workdir() -> String {
    "/workspace".into()
}

impl ImageProfile {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            container_port: None,
            cmd: Vec::new(),
            env: BTreeMap::new(),
            user: default_user(),
            workdir: default_workdir(),
        }
    }

    pub fn with_container_port(mut self, port: u16) -> Self {
        self.container_port = Some(port);
        self
    }

    pub fn with_cmd<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cmd = cmd.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PortConfig {
    /// First candidate of the upward scan.
    pub range_start: u16,
    /// Candidates probed before giving up.
    pub max_attempts: u16,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            range_start: 50000,
            max_attempts: 200,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StagingConfig {
    /// Parent directory of the per-sandbox scratch directories.
    pub root: PathBuf,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("mcp-sandbox"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LifecycleConfig {
    pub ready_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// How long an accepted probe connection must stay open to count as live.
    pub probe_read_window_ms: u64,
    pub stop_grace_secs: u64,
    /// Extra wait on top of the grace period before a forced kill.
    pub stop_slack_ms: u64,
    pub destroy_timeout_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            ready_timeout_ms: 30_000,
            poll_interval_ms: 250,
            probe_timeout_ms: 1_000,
            probe_read_window_ms: 200,
            stop_grace_secs: 5,
            stop_slack_ms: 2_000,
            destroy_timeout_ms: 15_000,
        }
    }
}

impl LifecycleConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn probe_read_window(&self) -> Duration {
        Duration::from_millis(self.probe_read_window_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn stop_slack(&self) -> Duration {
        Duration::from_millis(self.stop_slack_ms)
    }

    pub fn destroy_timeout(&self) -> Duration {
        Duration::from_millis(self.destroy_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_sandboxes: usize,
    pub memory_bytes: i64,
    /// CPU quota per 100ms period (100_000 = one core).
    pub cpu_quota: i64,
    pub pids_limit: i64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_sandboxes: 10,
            memory_bytes: 512 * 1024 * 1024, // 512MB
            cpu_quota: 100_000,              // 1 CPU core
            pids_limit: 100,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub json: bool,
}

impl ManagerConfig {
    pub fn load() -> Result<Self> {
        let s = Config::builder()
            .add_source(File::with_name("config/sandbox").required(false))
            // Map MCP_SANDBOX__PORTS__RANGE_START=51000 to ports.range_start
            .add_source(
                Environment::with_prefix("MCP_SANDBOX")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("network_modes")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = s.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Startup checks. Anything rejected here would otherwise surface as a
    /// confusing per-request failure.
    pub fn validate(&self) -> Result<()> {
        if self.network_modes.is_empty() {
            return Err(Error::config("network_modes must not be empty"));
        }
        for mode in &self.network_modes {
            let known = mode == CONTAINER_MODE_TEMPLATE
                || matches!(
                    NetworkMode::parse(mode),
                    Some(NetworkMode::Bridge | NetworkMode::None | NetworkMode::Host)
                );
            if !known {
                return Err(Error::config(format!(
                    "unknown network mode '{}' (supported: bridge, none, host, {})",
                    mode, CONTAINER_MODE_TEMPLATE
                )));
            }
        }

        if !self.profiles.contains_key(&self.default_profile) {
            return Err(Error::config(format!(
                "default_profile '{}' has no entry in profiles",
                self.default_profile
            )));
        }
        for (name, profile) in &self.profiles {
            if profile.image.trim().is_empty() {
                return Err(Error::config(format!("profile '{}' has an empty image", name)));
            }
            if profile.container_port == Some(0) {
                return Err(Error::config(format!("profile '{}' has container_port 0", name)));
            }
            if !profile.workdir.starts_with('/') {
                return Err(Error::config(format!(
                    "profile '{}' workdir must be absolute, got '{}'",
                    name, profile.workdir
                )));
            }
        }

        if self.ports.range_start < 1024 {
            return Err(Error::config("ports.range_start must be >= 1024"));
        }
        if self.ports.max_attempts == 0 {
            return Err(Error::config("ports.max_attempts must be > 0"));
        }
        if self.limits.max_sandboxes == 0 {
            return Err(Error::config("limits.max_sandboxes must be > 0"));
        }
        if self.lifecycle.poll_interval_ms == 0 {
            return Err(Error::config("lifecycle.poll_interval_ms must be > 0"));
        }
        Ok(())
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let profiles = HashMap::from([
            (
                "default".to_string(),
                ImageProfile::new("mcp-sandbox/tool-server:latest").with_container_port(3000),
            ),
            (
                "shell".to_string(),
                ImageProfile::new("alpine:3.20").with_cmd(["tail", "-f", "/dev/null"]),
            ),
        ]);

        Self {
            runtime: RuntimeConfig::default(),
            network_modes: vec![
                "bridge".into(),
                "none".into(),
                "host".into(),
                CONTAINER_MODE_TEMPLATE.into(),
            ],
            default_profile: "default".into(),
            profiles,
            ports: PortConfig::default(),
            staging: StagingConfig::default(),
            lifecycle: LifecycleConfig::default(),
            limits: LimitsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

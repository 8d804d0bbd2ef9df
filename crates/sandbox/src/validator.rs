//! Request validation.
//!
//! Everything here is pure: no I/O and no resource acquisition, so a bad
//! request is rejected before the manager touches the filesystem, the port
//! table, or the container runtime.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use mcp_sandbox_core::config::CONTAINER_MODE_TEMPLATE;
use mcp_sandbox_core::fs_policy::validate_relative_path;
use mcp_sandbox_core::{Error, ImageProfile, ManagerConfig, NetworkMode, Result, SandboxConfig};

/// A file entry whose path has passed the path policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedFile {
    path: PathBuf,
    content: Vec<u8>,
}

impl ValidatedFile {
    /// Normalized path relative to the sandbox root.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }
}

/// How a sandbox occupies a port on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPortClaim {
    /// Bridge networking: `container_port` is published on a leased host
    /// port, `preferred` exactly or else the first free one of the scan.
    Published {
        container_port: u16,
        preferred: Option<u16>,
    },
    /// Host networking: the server binds `port` on the host itself.
    Direct { port: u16 },
}

impl HostPortClaim {
    /// The exact host port to lease, if the claim fixes one.
    pub fn requested_port(&self) -> Option<u16> {
        match *self {
            Self::Published { preferred, .. } => preferred,
            Self::Direct { port } => Some(port),
        }
    }
}

/// A request that passed validation. Only [`ConfigValidator`] builds these.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    files: Vec<ValidatedFile>,
    network_mode: NetworkMode,
    purpose: String,
    profile: ImageProfile,
    preferred_port: Option<u16>,
    writable: bool,
    env: BTreeMap<String, String>,
}

impl ValidatedConfig {
    pub fn files(&self) -> &[ValidatedFile] {
        &self.files
    }

    pub fn network_mode(&self) -> &NetworkMode {
        &self.network_mode
    }

    /// Name of the image profile this sandbox runs.
    pub fn purpose(&self) -> &str {
        &self.purpose
    }

    pub fn profile(&self) -> &ImageProfile {
        &self.profile
    }

    pub fn preferred_port(&self) -> Option<u16> {
        self.preferred_port
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Profile environment overlaid with the request's environment.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Container port to publish, if the profile exposes one and the network
    /// mode can publish it.
    pub fn published_container_port(&self) -> Option<u16> {
        self.profile
            .container_port
            .filter(|_| self.network_mode.supports_port_publishing())
    }

    /// Host port this sandbox needs leased, if any.
    pub fn host_port_claim(&self) -> Option<HostPortClaim> {
        let container_port = self.profile.container_port?;
        match self.network_mode {
            NetworkMode::Bridge => Some(HostPortClaim::Published {
                container_port,
                preferred: self.preferred_port,
            }),
            NetworkMode::Host => Some(HostPortClaim::Direct {
                port: container_port,
            }),
            NetworkMode::None | NetworkMode::Container(_) => None,
        }
    }
}

/// Validates sandbox requests against the configured network modes and
/// image profiles.
#[derive(Debug, Clone)]
pub struct ConfigValidator {
    accepted_modes: Vec<String>,
    profiles: HashMap<String, ImageProfile>,
    default_profile: String,
}

impl ConfigValidator {
    pub fn new(config: &ManagerConfig) -> Self {
        Self {
            accepted_modes: config.network_modes.clone(),
            profiles: config.profiles.clone(),
            default_profile: config.default_profile.clone(),
        }
    }

    /// The accepted `networkMode` values, as reported in errors.
    pub fn accepted_network_modes(&self) -> &[String] {
        &self.accepted_modes
    }

    pub fn validate(&self, config: &SandboxConfig) -> Result<ValidatedConfig> {
        let network_mode = self.validate_network_mode(&config.network_mode)?;
        let files = validate_files(config)?;

        let purpose = config
            .purpose
            .clone()
            .unwrap_or_else(|| self.default_profile.clone());
        let profile = self.profiles.get(&purpose).cloned().ok_or_else(|| {
            let mut known: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
            known.sort_unstable();
            Error::validation(format!(
                "purpose '{}' has no image profile. Expecting one of: {}",
                purpose,
                known.join(", ")
            ))
        })?;

        if let Some(port) = config.preferred_port {
            if port < 1024 {
                return Err(Error::validation(format!(
                    "preferredPort must be between 1024 and 65535, got {}",
                    port
                )));
            }
        }

        if let (NetworkMode::Host, Some(bound), Some(preferred)) =
            (&network_mode, profile.container_port, config.preferred_port)
        {
            if preferred != bound {
                return Err(Error::validation(format!(
                    "preferredPort {} conflicts with port {} bound directly in host network mode",
                    preferred, bound
                )));
            }
        }

        for key in config.env.keys() {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(Error::validation(format!(
                    "invalid environment variable name: {:?}",
                    key
                )));
            }
        }
        let mut env = profile.env.clone();
        env.extend(config.env.clone());

        Ok(ValidatedConfig {
            files,
            network_mode,
            purpose,
            profile,
            preferred_port: config.preferred_port,
            writable: config.writable,
            env,
        })
    }

    fn validate_network_mode(&self, raw: &str) -> Result<NetworkMode> {
        let enabled = NetworkMode::parse(raw).filter(|mode| {
            let key = match mode {
                NetworkMode::Container(_) => CONTAINER_MODE_TEMPLATE.to_string(),
                other => other.to_string(),
            };
            self.accepted_modes.contains(&key)
        });

        enabled.ok_or_else(|| {
            Error::validation(format!(
                "networkMode is of invalid type. Expecting one of: {} (got {:?})",
                self.accepted_modes.join(", "),
                raw
            ))
        })
    }
}

fn validate_files(config: &SandboxConfig) -> Result<Vec<ValidatedFile>> {
    let mut seen = HashSet::with_capacity(config.files.len());
    let mut files = Vec::with_capacity(config.files.len());

    for entry in &config.files {
        let path = validate_relative_path(&entry.path)?;
        if !seen.insert(path.clone()) {
            return Err(Error::validation(format!(
                "duplicate file path: {}",
                path.display()
            )));
        }
        files.push(ValidatedFile {
            path,
            content: entry.content.clone(),
        });
    }

    Ok(files)
}

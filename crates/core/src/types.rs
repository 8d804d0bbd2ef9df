//! Sandbox request, handle, and state types.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Identifiers
// =============================================================================

/// Unique identifier for a sandbox instance.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SandboxId(pub String);

impl SandboxId {
    /// Generate a fresh identifier.
    pub fn generate() -> Self {
        Self(format!("sandbox-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Caller-chosen ids become a directory name and part of the container
    /// name, so they must match the container-name grammar.
    pub fn validate(&self) -> crate::Result<()> {
        if is_container_name(&self.0) {
            Ok(())
        } else {
            Err(crate::Error::validation(format!(
                "invalid sandbox id '{}': expected [a-zA-Z0-9][a-zA-Z0-9_.-]*",
                self.0
            )))
        }
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SandboxId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// =============================================================================
// Network Mode
// =============================================================================

/// Network namespace a sandbox container is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkMode {
    /// Standard Docker bridge networking.
    Bridge,
    /// No network at all.
    None,
    /// The host's network namespace (dangerous).
    Host,
    /// Share the namespace of another running container.
    Container(String),
}

impl NetworkMode {
    /// Parse the wire form (`bridge`, `none`, `host`, `container:<name>`).
    ///
    /// Only the shape is checked here; whether a mode is enabled is decided
    /// by the validator against the configured set.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "bridge" => Some(Self::Bridge),
            "none" => Some(Self::None),
            "host" => Some(Self::Host),
            _ => {
                let name = raw.strip_prefix("container:")?;
                is_container_name(name).then(|| Self::Container(name.to_string()))
            }
        }
    }

    /// Whether the runtime can publish ports for this mode.
    pub fn supports_port_publishing(&self) -> bool {
        matches!(self, Self::Bridge)
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bridge => write!(f, "bridge"),
            Self::None => write!(f, "none"),
            Self::Host => write!(f, "host"),
            Self::Container(name) => write!(f, "container:{}", name),
        }
    }
}

/// Docker container names: `[a-zA-Z0-9][a-zA-Z0-9_.-]*`.
fn is_container_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

// =============================================================================
// Sandbox Request
// =============================================================================

/// A file to materialize inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the sandbox root.
    pub path: String,
    /// Raw file contents (base64 on the wire).
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
}

impl FileEntry {
    pub fn new(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Caller-supplied sandbox request. Validated once, never mutated after.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    /// Input files, in order.
    #[serde(default)]
    pub files: Vec<FileEntry>,
    /// One of `bridge`, `none`, `host`, `container:<name>`.
    pub network_mode: String,
    /// Image profile to launch; the configured default when absent.
    #[serde(default)]
    pub purpose: Option<String>,
    /// Host port the caller wants the tool server published on.
    #[serde(default)]
    pub preferred_port: Option<u16>,
    /// Mount staged files read-write instead of read-only.
    #[serde(default)]
    pub writable: bool,
    /// Extra environment for the container process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl SandboxConfig {
    pub fn new(network_mode: impl Into<String>) -> Self {
        Self {
            network_mode: network_mode.into(),
            ..Default::default()
        }
    }

    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.files.push(FileEntry::new(path, content));
        self
    }

    pub fn with_purpose(mut self, purpose: impl Into<String>) -> Self {
        self.purpose = Some(purpose.into());
        self
    }

    pub fn with_preferred_port(mut self, port: u16) -> Self {
        self.preferred_port = Some(port);
        self
    }
}

// =============================================================================
// Sandbox State
// =============================================================================

/// Lifecycle state of a sandbox container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Created,
    Starting,
    Running,
    HealthCheckFailed,
    Stopping,
    Removed,
    Failed,
}

impl SandboxState {
    /// `Removed` and `Failed` have no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Removed | Self::Failed)
    }

    /// Whether the state machine permits `self -> next`.
    pub fn can_transition_to(self, next: SandboxState) -> bool {
        use SandboxState::*;
        if self.is_terminal() {
            return false;
        }
        if next == Failed {
            return true;
        }
        matches!(
            (self, next),
            (Created, Starting)
                | (Starting, Running)
                | (Running, HealthCheckFailed)
                | (Running, Stopping)
                | (HealthCheckFailed, Removed)
                | (Stopping, Removed)
        )
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::HealthCheckFailed => "health_check_failed",
            Self::Stopping => "stopping",
            Self::Removed => "removed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Sandbox Handle
// =============================================================================

/// Read-only snapshot of a registered sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxHandle {
    pub id: SandboxId,
    /// Runtime-assigned container id.
    pub container_id: String,
    /// Leased host port, if the sandbox publishes one.
    pub host_port: Option<u16>,
    pub state: SandboxState,
    /// Host directory holding the staged input files.
    pub staging_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

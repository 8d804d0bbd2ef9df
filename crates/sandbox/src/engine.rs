//! Container runtime backends.
//!
//! This module provides the `ContainerRuntime` trait and a Docker-based
//! implementation using the `bollard` crate. Each call maps to one runtime
//! API request; no transactional behavior across calls is assumed, so the
//! lifecycle controller compensates manually on partial failure.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use mcp_sandbox_core::config::RuntimeConfig;
use mcp_sandbox_core::{Error, NetworkMode, Result, SandboxId};

/// Label applied to every container the manager creates.
pub const MANAGED_BY_LABEL: &str = "managed-by";
pub const MANAGED_BY_VALUE: &str = "mcp-sandbox";
/// Label carrying the owning sandbox id.
pub const SANDBOX_ID_LABEL: &str = "mcp-sandbox.id";

// =============================================================================
// Container Types
// =============================================================================

/// Bind mount of the staging directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

/// Host port published for the tool server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
}

/// Everything the runtime needs to materialize one sandbox container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub sandbox_id: SandboxId,
    /// Container name (unique per sandbox).
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub user: String,
    pub workdir: String,
    pub network_mode: NetworkMode,
    pub mount: Option<MountSpec>,
    pub port: Option<PortMapping>,
    pub memory_bytes: i64,
    pub cpu_quota: i64,
    pub pids_limit: i64,
}

/// Runtime view of a container's process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    /// Process exited (with its exit code when known).
    Exited(Option<i64>),
    /// Created, paused, restarting, ...
    Other(String),
    NotFound,
}

// =============================================================================
// Container Runtime Trait
// =============================================================================

/// Trait for container runtime backends.
///
/// Removal-style calls (`stop`, `kill`, `remove`) treat a missing container
/// as success so teardown paths can call them unconditionally.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (but do not start) a container. Returns the runtime id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    /// Start the container's entry process.
    async fn start(&self, container_id: &str) -> Result<()>;

    /// Graceful stop; the runtime kills the process after `grace`.
    async fn stop(&self, container_id: &str, grace: Duration) -> Result<()>;

    /// Immediate SIGKILL.
    async fn kill(&self, container_id: &str) -> Result<()>;

    /// Force-remove the container resource.
    async fn remove(&self, container_id: &str) -> Result<()>;

    async fn status(&self, container_id: &str) -> Result<ContainerStatus>;

    /// Last `tail` lines of stdout/stderr.
    async fn logs(&self, container_id: &str, tail: usize) -> Result<String>;

    /// Check that the runtime endpoint is reachable.
    async fn ping(&self) -> Result<()>;
}

// =============================================================================
// Docker Runtime Implementation
// =============================================================================

/// Docker-based runtime using the `bollard` crate.
///
/// Containers are created with:
/// - The requested network mode and a single published TCP port
/// - The staging directory bind-mounted at the profile's workdir
/// - Memory, CPU and pid limits
/// - All capabilities dropped, no privilege escalation, non-root user
pub struct DockerRuntime {
    docker: bollard::Docker,
}

impl DockerRuntime {
    /// Connect to the Docker daemon (local defaults, or the configured socket).
    ///
    /// This only builds the client; use [`ContainerRuntime::ping`] to confirm
    /// the daemon actually answers.
    pub fn connect(config: &RuntimeConfig) -> Result<Self> {
        let docker = match &config.docker_socket {
            Some(socket) => {
                bollard::Docker::connect_with_socket(socket, 120, bollard::API_DEFAULT_VERSION)
            }
            None => bollard::Docker::connect_with_local_defaults(),
        }
        .map_err(|e| {
            Error::RuntimeUnavailable(format!(
                "Failed to connect to Docker daemon: {}. Is Docker running?",
                e
            ))
        })?;
        Ok(Self { docker })
    }

    /// Create from an existing bollard Docker client.
    pub fn from_client(docker: bollard::Docker) -> Self {
        Self { docker }
    }
}

/// HTTP status of a Docker API error, if it carries one.
fn status_code(err: &bollard::errors::Error) -> Option<u16> {
    match err {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        use bollard::container::{Config, CreateContainerOptions};
        use bollard::models::{HostConfig, Mount, MountTypeEnum, PortBinding};

        let port_key = spec
            .port
            .map(|p| format!("{}/tcp", p.container_port));

        let host_config = HostConfig {
            memory: Some(spec.memory_bytes),
            cpu_quota: Some(spec.cpu_quota),
            cpu_period: Some(100_000), // standard 100ms period
            network_mode: Some(spec.network_mode.to_string()),
            mounts: spec.mount.as_ref().map(|m| {
                vec![Mount {
                    target: Some(m.target.clone()),
                    source: Some(m.source.to_string_lossy().into_owned()),
                    typ: Some(MountTypeEnum::BIND),
                    read_only: Some(m.read_only),
                    ..Default::default()
                }]
            }),
            // Publish on every interface; the allocator probed 0.0.0.0
            port_bindings: spec.port.zip(port_key.clone()).map(|(p, key)| {
                HashMap::from([(
                    key,
                    Some(vec![PortBinding {
                        host_ip: Some("0.0.0.0".to_string()),
                        host_port: Some(p.host_port.to_string()),
                    }]),
                )])
            }),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            pids_limit: Some(spec.pids_limit),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            working_dir: Some(spec.workdir.clone()),
            user: Some(spec.user.clone()),
            cmd: (!spec.cmd.is_empty()).then(|| spec.cmd.clone()),
            env: Some(spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()),
            exposed_ports: port_key.map(|key| HashMap::from([(key, HashMap::new())])),
            host_config: Some(host_config),
            labels: Some(HashMap::from([
                (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
                (SANDBOX_ID_LABEL.to_string(), spec.sandbox_id.to_string()),
            ])),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let created = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| match status_code(&e) {
                Some(404) => Error::container_creation(format!(
                    "image '{}' not found: {}",
                    spec.image, e
                )),
                _ => Error::container_creation(format!(
                    "Failed to create sandbox container: {}",
                    e
                )),
            })?;

        for warning in &created.warnings {
            tracing::warn!(sandbox_id = %spec.sandbox_id, warning = %warning, "Docker create warning");
        }

        Ok(created.id)
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        self.docker
            .start_container::<String>(container_id, None)
            .await
            .map_err(|e| {
                Error::container_creation(format!("Failed to start sandbox container: {}", e))
            })
    }

    async fn stop(&self, container_id: &str, grace: Duration) -> Result<()> {
        use bollard::container::StopContainerOptions;

        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.docker.stop_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped, 404: already gone
            Err(e) if matches!(status_code(&e), Some(304 | 404)) => Ok(()),
            Err(e) => Err(Error::runtime(format!("Failed to stop container: {}", e))),
        }
    }

    async fn kill(&self, container_id: &str) -> Result<()> {
        use bollard::container::KillContainerOptions;

        let options = KillContainerOptions { signal: "SIGKILL" };
        match self.docker.kill_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            // 409: not running
            Err(e) if matches!(status_code(&e), Some(404 | 409)) => Ok(()),
            Err(e) => Err(Error::runtime(format!("Failed to kill container: {}", e))),
        }
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        use bollard::container::RemoveContainerOptions;

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            // 409: removal already in progress
            Err(e) if matches!(status_code(&e), Some(404 | 409)) => Ok(()),
            Err(e) => Err(Error::runtime(format!(
                "Failed to remove sandbox container: {}",
                e
            ))),
        }
    }

    async fn status(&self, container_id: &str) -> Result<ContainerStatus> {
        let inspect = match self.docker.inspect_container(container_id, None).await {
            Ok(inspect) => inspect,
            Err(e) if status_code(&e) == Some(404) => return Ok(ContainerStatus::NotFound),
            Err(e) => return Err(Error::runtime(format!("Failed to inspect container: {}", e))),
        };

        let state = inspect.state.unwrap_or_default();
        if state.running == Some(true) {
            return Ok(ContainerStatus::Running);
        }
        match state.status {
            Some(bollard::models::ContainerStateStatusEnum::EXITED)
            | Some(bollard::models::ContainerStateStatusEnum::DEAD) => {
                Ok(ContainerStatus::Exited(state.exit_code))
            }
            Some(other) => Ok(ContainerStatus::Other(other.to_string())),
            None => Ok(ContainerStatus::Other("unknown".to_string())),
        }
    }

    async fn logs(&self, container_id: &str, tail: usize) -> Result<String> {
        use bollard::container::{LogOutput, LogsOptions};
        use futures::StreamExt;

        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.logs(container_id, Some(options));
        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::Console { message }) => {
                    output.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {} // ignore stdin echoes
                Err(e) => {
                    return Err(Error::runtime(format!("Failed to read container logs: {}", e)));
                }
            }
        }
        Ok(output)
    }

    async fn ping(&self) -> Result<()> {
        self.docker.ping().await.map(|_| ()).map_err(|e| {
            Error::RuntimeUnavailable(format!("Docker daemon did not answer ping: {}", e))
        })
    }
}

// =============================================================================
// Mock Runtime (for testing without Docker)
// =============================================================================

/// What a started mock container does on its published host port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum MockServing {
    /// Accept connections and keep them open until the peer closes.
    #[default]
    Hold,
    /// Accept connections and close them at once, like a port proxy with
    /// nothing behind it.
    Close,
    /// Nothing listens.
    Off,
}

/// Knobs for [`MockRuntime`] failure injection.
#[derive(Debug, Clone, Default)]
struct MockBehavior {
    fail_create: bool,
    fail_start: bool,
    serving: MockServing,
    exit_on_start: bool,
    hang_stop: bool,
    hang_kill: bool,
    unavailable: bool,
    create_delay: Duration,
}

struct MockContainer {
    spec: ContainerSpec,
    status: ContainerStatus,
    server: Option<tokio::task::JoinHandle<()>>,
}

impl MockContainer {
    fn halt(&mut self, exit_code: i64) {
        if let Some(server) = self.server.take() {
            server.abort();
        }
        self.status = ContainerStatus::Exited(Some(exit_code));
    }
}

/// In-memory runtime for tests. When started, a container with a published
/// port binds a real listener on that host port, so readiness probes go
/// through the network stack like they would against Docker.
#[derive(Default, Clone)]
pub struct MockRuntime {
    behavior: MockBehavior,
    containers: Arc<tokio::sync::Mutex<HashMap<String, MockContainer>>>,
    operations: Arc<tokio::sync::Mutex<Vec<String>>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// `create` fails as if the image were missing.
    pub fn failing_create(mut self) -> Self {
        self.behavior.fail_create = true;
        self
    }

    pub fn failing_start(mut self) -> Self {
        self.behavior.fail_start = true;
        self
    }

    /// Containers run but never accept connections.
    pub fn never_ready(mut self) -> Self {
        self.behavior.serving = MockServing::Off;
        self
    }

    /// Containers accept connections on their port and drop them right away.
    pub fn closing_connections(mut self) -> Self {
        self.behavior.serving = MockServing::Close;
        self
    }

    /// Containers exit immediately after start.
    pub fn exiting_on_start(mut self) -> Self {
        self.behavior.exit_on_start = true;
        self
    }

    /// `stop` never returns.
    pub fn hanging_stop(mut self) -> Self {
        self.behavior.hang_stop = true;
        self
    }

    /// `kill` never returns.
    pub fn hanging_kill(mut self) -> Self {
        self.behavior.hang_kill = true;
        self
    }

    /// `ping` fails.
    pub fn unavailable(mut self) -> Self {
        self.behavior.unavailable = true;
        self
    }

    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.behavior.create_delay = delay;
        self
    }

    /// Containers that exist in the runtime (not yet removed).
    pub async fn container_count(&self) -> usize {
        self.containers.lock().await.len()
    }

    /// Spec a container was created with.
    pub async fn spec(&self, container_id: &str) -> Option<ContainerSpec> {
        self.containers
            .lock()
            .await
            .get(container_id)
            .map(|c| c.spec.clone())
    }

    /// Runtime calls so far, as `"<op> <container>"`.
    pub async fn operations(&self) -> Vec<String> {
        self.operations.lock().await.clone()
    }

    /// Make a running container exit, as if its process crashed.
    pub async fn crash(&self, container_id: &str) {
        if let Some(container) = self.containers.lock().await.get_mut(container_id) {
            container.halt(137);
        }
    }

    async fn record(&self, op: &str, container_id: &str) {
        self.operations
            .lock()
            .await
            .push(format!("{} {}", op, container_id));
    }
}

async fn serve(listener: tokio::net::TcpListener, serving: MockServing) {
    use tokio::io::AsyncReadExt;

    while let Ok((mut socket, _)) = listener.accept().await {
        if serving == MockServing::Close {
            drop(socket);
            continue;
        }
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            while matches!(socket.read(&mut buf).await, Ok(n) if n > 0) {}
        });
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        if !self.behavior.create_delay.is_zero() {
            tokio::time::sleep(self.behavior.create_delay).await;
        }
        if self.behavior.fail_create {
            return Err(Error::container_creation(format!(
                "image '{}' not found",
                spec.image
            )));
        }

        let id = format!("mock-{}", spec.name);
        self.record("create", &id).await;
        self.containers.lock().await.insert(
            id.clone(),
            MockContainer {
                spec: spec.clone(),
                status: ContainerStatus::Other("created".to_string()),
                server: None,
            },
        );
        Ok(id)
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        self.record("start", container_id).await;
        if self.behavior.fail_start {
            return Err(Error::container_creation("Failed to start sandbox container"));
        }

        let mut containers = self.containers.lock().await;
        let container = containers
            .get_mut(container_id)
            .ok_or_else(|| Error::container_creation(format!("no such container: {}", container_id)))?;

        if self.behavior.exit_on_start {
            container.halt(1);
            return Ok(());
        }

        let serving = self.behavior.serving;
        if let Some(port) = container.spec.port.filter(|_| serving != MockServing::Off) {
            let listener = tokio::net::TcpListener::bind(("0.0.0.0", port.host_port))
                .await
                .map_err(|e| {
                    Error::container_creation(format!(
                        "port {} is already allocated: {}",
                        port.host_port, e
                    ))
                })?;
            container.server = Some(tokio::spawn(serve(listener, serving)));
        }
        container.status = ContainerStatus::Running;
        Ok(())
    }

    async fn stop(&self, container_id: &str, _grace: Duration) -> Result<()> {
        self.record("stop", container_id).await;
        if self.behavior.hang_stop {
            std::future::pending::<()>().await;
        }
        if let Some(container) = self.containers.lock().await.get_mut(container_id) {
            container.halt(0);
        }
        Ok(())
    }

    async fn kill(&self, container_id: &str) -> Result<()> {
        self.record("kill", container_id).await;
        if self.behavior.hang_kill {
            std::future::pending::<()>().await;
        }
        if let Some(container) = self.containers.lock().await.get_mut(container_id) {
            container.halt(137);
        }
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        self.record("remove", container_id).await;
        if let Some(mut container) = self.containers.lock().await.remove(container_id) {
            container.halt(137);
        }
        Ok(())
    }

    async fn status(&self, container_id: &str) -> Result<ContainerStatus> {
        Ok(self
            .containers
            .lock()
            .await
            .get(container_id)
            .map(|c| c.status.clone())
            .unwrap_or(ContainerStatus::NotFound))
    }

    async fn logs(&self, container_id: &str, _tail: usize) -> Result<String> {
        let containers = self.containers.lock().await;
        let container = containers
            .get(container_id)
            .ok_or_else(|| Error::runtime(format!("no such container: {}", container_id)))?;
        Ok(format!("[mock] {} started from {}\n", container_id, container.spec.image))
    }

    async fn ping(&self) -> Result<()> {
        if self.behavior.unavailable {
            return Err(Error::RuntimeUnavailable(
                "Docker daemon did not answer ping: connection refused".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

//! Per-sandbox container state machine.
//!
//! ```text
//! Created ──► Starting ──► Running ──► Stopping ──────────► Removed
//!    │           │            │                               ▲
//!    │           │            └──► HealthCheckFailed ─────────┘
//!    └───────────┴────────────┴──────────► Failed   (from any non-terminal)
//! ```
//!
//! Every transition is logged with the sandbox id, both states and the
//! cause. The current state is published on a `watch` channel so readers
//! never wait behind an in-flight runtime call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mcp_sandbox_core::{Error, Result, SandboxId, SandboxState};
use tokio::sync::watch;

use crate::engine::{ContainerRuntime, ContainerSpec, ContainerStatus};

// =============================================================================
// Health Probe
// =============================================================================

/// Liveness probe against a sandbox's published host port.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `true` if the tool server behind `host_port` is reachable.
    async fn probe(&self, host_port: u16) -> bool;
}

const DEFAULT_READ_WINDOW: Duration = Duration::from_millis(200);

/// Ready once a TCP connection to `127.0.0.1:<port>` is accepted and is
/// neither closed nor reset within a short read window.
///
/// Docker's userland proxy accepts connections on a published port even
/// when nothing listens inside the container, then drops them, so an
/// accepted connect alone does not mean the server is up.
pub struct TcpProbe {
    connect_timeout: Duration,
    read_window: Duration,
}

impl TcpProbe {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            read_window: DEFAULT_READ_WINDOW,
        }
    }

    pub fn with_read_window(mut self, read_window: Duration) -> Self {
        self.read_window = read_window;
        self
    }
}

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn probe(&self, host_port: u16) -> bool {
        let connect = tokio::net::TcpStream::connect(("127.0.0.1", host_port));
        let stream = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            _ => return false,
        };

        let mut buf = [0u8; 1];
        match tokio::time::timeout(self.read_window, stream.peek(&mut buf)).await {
            // Still open, waiting for the client to speak
            Err(_) => true,
            // Greeting
            Ok(Ok(n)) if n > 0 => true,
            // EOF or reset
            Ok(_) => false,
        }
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Timing knobs for one controller.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleTimings {
    pub poll_interval: Duration,
    /// Extra wait on top of the stop grace period before a forced kill.
    pub stop_slack: Duration,
}

pub struct ContainerLifecycleController {
    sandbox_id: SandboxId,
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn HealthProbe>,
    timings: LifecycleTimings,
    container_id: Option<String>,
    host_port: Option<u16>,
    state: watch::Sender<SandboxState>,
}

impl ContainerLifecycleController {
    pub fn new(
        sandbox_id: SandboxId,
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn HealthProbe>,
        timings: LifecycleTimings,
    ) -> Self {
        let (state, _) = watch::channel(SandboxState::Created);
        Self {
            sandbox_id,
            runtime,
            probe,
            timings,
            container_id: None,
            host_port: None,
            state,
        }
    }

    pub fn sandbox_id(&self) -> &SandboxId {
        &self.sandbox_id
    }

    pub fn state(&self) -> SandboxState {
        *self.state.borrow()
    }

    /// Receiver that observes every future transition.
    pub fn subscribe(&self) -> watch::Receiver<SandboxState> {
        self.state.subscribe()
    }

    /// Runtime id, once `create` succeeded.
    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    fn transition(&self, to: SandboxState, cause: &str) -> Result<()> {
        let from = self.state();
        if !from.can_transition_to(to) {
            tracing::warn!(
                sandbox_id = %self.sandbox_id,
                from = %from,
                to = %to,
                cause,
                "Rejected sandbox state transition"
            );
            return Err(Error::InvalidTransition { from, to });
        }
        self.state.send_replace(to);
        tracing::info!(
            sandbox_id = %self.sandbox_id,
            container_id = self.container_id.as_deref().unwrap_or("-"),
            from = %from,
            to = %to,
            cause,
            "Sandbox state transition"
        );
        Ok(())
    }

    /// Move to `Failed` unless already terminal.
    fn fail(&self, cause: &str) {
        if !self.state().is_terminal() {
            let _ = self.transition(SandboxState::Failed, cause);
        }
    }

    /// Create the container without starting it.
    pub async fn create(&mut self, spec: &ContainerSpec) -> Result<()> {
        if self.container_id.is_some() || self.state() != SandboxState::Created {
            return Err(Error::runtime(format!(
                "sandbox {} already has a container",
                self.sandbox_id
            )));
        }

        match self.runtime.create(spec).await {
            Ok(container_id) => {
                tracing::debug!(
                    sandbox_id = %self.sandbox_id,
                    container_id = %container_id,
                    image = %spec.image,
                    network_mode = %spec.network_mode,
                    "Container created"
                );
                self.container_id = Some(container_id);
                self.host_port = spec.port.map(|p| p.host_port);
                Ok(())
            }
            Err(e) => {
                let err = match e {
                    Error::ContainerCreation(_) => e,
                    other => Error::container_creation(other.to_string()),
                };
                self.fail(&err.to_string());
                Err(err)
            }
        }
    }

    /// Start the entry process. `Created -> Starting`.
    pub async fn start(&mut self) -> Result<()> {
        let container_id = self
            .container_id
            .clone()
            .ok_or_else(|| Error::runtime(format!("sandbox {} has no container", self.sandbox_id)))?;

        if let Err(e) = self.runtime.start(&container_id).await {
            self.fail(&e.to_string());
            return Err(match e {
                Error::ContainerCreation(_) => e,
                other => Error::container_creation(other.to_string()),
            });
        }
        self.transition(SandboxState::Starting, "container started")
    }

    /// Poll until the sandbox is reachable. `Starting -> Running`.
    ///
    /// On timeout, or if the container exits first, the sandbox moves to
    /// `Failed` and the container is killed and removed: it may be wedged,
    /// not merely slow.
    pub async fn await_ready(&mut self, timeout: Duration) -> Result<()> {
        if self.state() != SandboxState::Starting {
            return Err(Error::InvalidTransition {
                from: self.state(),
                to: SandboxState::Running,
            });
        }

        let outcome = match tokio::time::timeout(timeout, self.poll_ready()).await {
            Ok(result) => result,
            Err(_) => Err(Error::health_check_timeout(format!(
                "sandbox {} not reachable after {:?}",
                self.sandbox_id, timeout
            ))),
        };

        match outcome {
            Ok(()) => self.transition(SandboxState::Running, "health check passed"),
            Err(e) => {
                self.fail(&e.to_string());
                self.force_remove().await;
                Err(e)
            }
        }
    }

    async fn poll_ready(&self) -> Result<()> {
        let container_id = self
            .container_id
            .as_deref()
            .ok_or_else(|| Error::runtime("no container to probe"))?;

        loop {
            match self.runtime.status(container_id).await {
                Ok(ContainerStatus::Running) => match self.host_port {
                    Some(port) if self.probe.probe(port).await => return Ok(()),
                    Some(_) => {}
                    None => return Ok(()),
                },
                Ok(ContainerStatus::Exited(code)) => {
                    return Err(Error::health_check_timeout(format!(
                        "container exited (code {:?}) before becoming ready",
                        code
                    )));
                }
                Ok(ContainerStatus::NotFound) => {
                    return Err(Error::health_check_timeout(
                        "container disappeared before becoming ready",
                    ));
                }
                Ok(ContainerStatus::Other(status)) => {
                    tracing::trace!(sandbox_id = %self.sandbox_id, status = %status, "Waiting for container");
                }
                Err(e) => {
                    tracing::debug!(sandbox_id = %self.sandbox_id, error = %e, "Status poll failed");
                }
            }
            tokio::time::sleep(self.timings.poll_interval).await;
        }
    }

    /// One liveness check on a running sandbox. Failure moves it to
    /// `HealthCheckFailed`. Returns the resulting state.
    pub async fn check_health(&self) -> Result<SandboxState> {
        if self.state() != SandboxState::Running {
            return Ok(self.state());
        }
        let Some(container_id) = self.container_id.as_deref() else {
            return Ok(self.state());
        };

        let healthy = match self.runtime.status(container_id).await? {
            ContainerStatus::Running => match self.host_port {
                Some(port) => self.probe.probe(port).await,
                None => true,
            },
            _ => false,
        };

        if !healthy {
            self.transition(SandboxState::HealthCheckFailed, "liveness probe failed")?;
        }
        Ok(self.state())
    }

    /// Graceful stop with a forced kill once `grace` (plus slack) runs out.
    pub async fn stop(&mut self, grace: Duration) -> Result<()> {
        let Some(container_id) = self.container_id.clone() else {
            return Ok(());
        };
        if self.state().is_terminal() {
            return Ok(());
        }
        if self.state() == SandboxState::Running {
            self.transition(SandboxState::Stopping, "stop requested")?;
        }

        let bound = grace + self.timings.stop_slack;
        let stopped = tokio::time::timeout(bound, self.runtime.stop(&container_id, grace)).await;
        match stopped {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::warn!(sandbox_id = %self.sandbox_id, error = %e, "Stop failed, killing container");
                self.runtime.kill(&container_id).await
            }
            Err(_) => {
                tracing::warn!(
                    sandbox_id = %self.sandbox_id,
                    grace = ?grace,
                    "Stop did not finish in time, killing container"
                );
                self.runtime.kill(&container_id).await
            }
        }
    }

    /// Delete the container resource.
    ///
    /// A no-op for a never-created or already-removed container; terminal
    /// states are left unchanged.
    pub async fn remove(&mut self) -> Result<()> {
        let Some(container_id) = self.container_id.clone() else {
            return Ok(());
        };
        if self.state() == SandboxState::Removed {
            return Ok(());
        }

        if let Err(e) = self.runtime.remove(&container_id).await {
            self.fail(&e.to_string());
            return Err(e);
        }

        match self.state() {
            SandboxState::Stopping | SandboxState::HealthCheckFailed => {
                self.transition(SandboxState::Removed, "container removed")
            }
            SandboxState::Running => {
                self.transition(SandboxState::Stopping, "removed without stop")?;
                self.transition(SandboxState::Removed, "container removed")
            }
            SandboxState::Created | SandboxState::Starting => {
                self.transition(SandboxState::Failed, "removed before becoming ready")
            }
            SandboxState::Removed | SandboxState::Failed => Ok(()),
        }
    }

    /// Kill and remove regardless of state; errors are logged.
    async fn force_remove(&mut self) {
        let Some(container_id) = self.container_id.clone() else {
            return;
        };
        if let Err(e) = self.runtime.kill(&container_id).await {
            tracing::warn!(sandbox_id = %self.sandbox_id, error = %e, "Forced kill failed");
        }
        if let Err(e) = self.runtime.remove(&container_id).await {
            tracing::error!(
                sandbox_id = %self.sandbox_id,
                container_id = %container_id,
                error = %e,
                "Forced remove failed, container may be orphaned"
            );
        }
    }

    pub async fn logs(&self, tail: usize) -> Result<String> {
        let container_id = self
            .container_id
            .as_deref()
            .ok_or_else(|| Error::runtime(format!("sandbox {} has no container", self.sandbox_id)))?;
        self.runtime.logs(container_id, tail).await
    }
}

//! Sandbox registry: the process-wide owner of live sandboxes.
//!
//! `create` runs validate → stage → allocate → create → start → health-check
//! strictly in sequence and only registers a sandbox once it is `Running`.
//! Every resource acquired on the way is released again if a later step
//! fails, so callers see either a live handle or an error with nothing left
//! behind. That includes a caller that gives up: a sandbox whose create
//! request was cancelled is torn down instead of registered.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use mcp_sandbox_core::{
    Error, ManagerConfig, Result, SandboxConfig, SandboxHandle, SandboxId, SandboxState,
};
use tokio::sync::{oneshot, watch, Mutex, RwLock};

use crate::engine::{ContainerRuntime, ContainerSpec, DockerRuntime, MountSpec, PortMapping};
use crate::lifecycle::{ContainerLifecycleController, HealthProbe, LifecycleTimings, TcpProbe};
use crate::ports::{PortAllocator, PortLease};
use crate::staging::{FileStager, StagingHandle};
use crate::validator::{ConfigValidator, ValidatedConfig};

// =============================================================================
// Registry Entries
// =============================================================================

/// A sandbox that reached `Running` and owns its resources until destroyed.
struct LiveSandbox {
    handle: SandboxHandle,
    state: watch::Receiver<SandboxState>,
    controller: Mutex<ContainerLifecycleController>,
    lease: Option<PortLease>,
    staging: StagingHandle,
}

impl LiveSandbox {
    fn snapshot(&self) -> SandboxHandle {
        SandboxHandle {
            state: *self.state.borrow(),
            ..self.handle.clone()
        }
    }
}

enum Slot {
    /// Reserved by an in-flight `create`; invisible to readers.
    Pending,
    Live(Arc<LiveSandbox>),
}

#[derive(Default)]
struct Table {
    slots: HashMap<SandboxId, Slot>,
    shutting_down: bool,
}

impl Table {
    fn live_count(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count()
    }

    fn pending_count(&self) -> usize {
        self.slots.len() - self.live_count()
    }
}

struct Inner {
    config: ManagerConfig,
    validator: ConfigValidator,
    ports: PortAllocator,
    stager: FileStager,
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn HealthProbe>,
    table: RwLock<Table>,
}

// =============================================================================
// Sandbox Registry
// =============================================================================

/// Creates, tracks, and tears down sandboxes.
///
/// Cheap to clone; clones share the same table.
#[derive(Clone)]
pub struct SandboxRegistry {
    inner: Arc<Inner>,
}

impl SandboxRegistry {
    /// Connect to Docker and verify it answers.
    pub async fn init(config: ManagerConfig) -> Result<Self> {
        let runtime = DockerRuntime::connect(&config.runtime)?;
        Self::init_with_runtime(config, Arc::new(runtime)).await
    }

    /// Like [`init`](Self::init) on an explicit backend: fails with
    /// `RuntimeUnavailable` unless the runtime answers a ping.
    pub async fn init_with_runtime(
        config: ManagerConfig,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self> {
        runtime.ping().await?;
        tracing::info!(
            network_modes = ?config.network_modes,
            max_sandboxes = config.limits.max_sandboxes,
            staging_root = %config.staging.root.display(),
            "Sandbox registry initialized"
        );
        Ok(Self::with_runtime(config, runtime))
    }

    /// Build on an explicit runtime backend (e.g. `MockRuntime` in tests).
    pub fn with_runtime(config: ManagerConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let probe = Arc::new(
            TcpProbe::new(config.lifecycle.probe_timeout())
                .with_read_window(config.lifecycle.probe_read_window()),
        );
        Self::with_runtime_and_probe(config, runtime, probe)
    }

    /// Build on an explicit runtime backend and readiness/liveness probe.
    pub fn with_runtime_and_probe(
        config: ManagerConfig,
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                validator: ConfigValidator::new(&config),
                ports: PortAllocator::new(&config.ports),
                stager: FileStager::new(config.staging.root.clone()),
                runtime,
                probe,
                table: RwLock::new(Table::default()),
                config,
            }),
        }
    }

    /// Create a sandbox under a fresh id.
    pub async fn create(&self, config: SandboxConfig) -> Result<SandboxHandle> {
        self.create_with_id(SandboxId::generate(), config).await
    }

    /// Create a sandbox under a caller-chosen id.
    ///
    /// The id must match `[a-zA-Z0-9][a-zA-Z0-9_.-]*`. Provisioning runs on
    /// its own task so that dropping the returned future never interrupts an
    /// unwind halfway; once the task sees its caller is gone, the finished
    /// sandbox is torn down rather than registered.
    pub async fn create_with_id(
        &self,
        id: SandboxId,
        config: SandboxConfig,
    ) -> Result<SandboxHandle> {
        let checked = id
            .validate()
            .and_then(|()| self.inner.validator.validate(&config));
        let validated = match checked {
            Ok(validated) => validated,
            Err(e) => {
                metrics::counter!("sandbox_create_total", "outcome" => "rejected").increment(1);
                tracing::info!(sandbox_id = %id, error = %e, "Sandbox request rejected");
                return Err(e);
            }
        };

        self.inner.reserve(&id).await?;

        let (reply, outcome) = oneshot::channel();
        let inner = self.inner.clone();
        let task_id = id.clone();
        tokio::spawn(async move { inner.provision(task_id, validated, reply).await });

        match outcome.await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(sandbox_id = %id, "Provisioning task aborted");
                self.inner.release_reservation(&id).await;
                Err(Error::runtime(format!("provisioning of {} aborted", id)))
            }
        }
    }

    /// Stop and remove a sandbox and release everything it holds.
    ///
    /// Never fails: unknown ids are ignored and teardown errors are logged.
    pub async fn destroy(&self, id: &SandboxId) {
        let inner = self.inner.clone();
        let id = id.clone();
        let task_id = id.clone();
        if let Err(e) = tokio::spawn(async move { inner.destroy(&task_id).await }).await {
            tracing::error!(sandbox_id = %id, error = %e, "Destroy task aborted");
        }
    }

    /// Snapshot of a live sandbox. In-flight creates are not visible.
    pub async fn get(&self, id: &SandboxId) -> Option<SandboxHandle> {
        match self.inner.table.read().await.slots.get(id) {
            Some(Slot::Live(live)) => Some(live.snapshot()),
            _ => None,
        }
    }

    /// Snapshots of all live sandboxes, oldest first.
    pub async fn list_active(&self) -> Vec<SandboxHandle> {
        let mut handles: Vec<SandboxHandle> = self
            .inner
            .table
            .read()
            .await
            .slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Live(live) => Some(live.snapshot()),
                Slot::Pending => None,
            })
            .collect();
        handles.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.as_str().cmp(b.id.as_str()))
        });
        handles
    }

    /// Probe a live sandbox once; returns its resulting state.
    pub async fn check_health(&self, id: &SandboxId) -> Result<SandboxState> {
        let live = self.inner.live(id).await?;
        let controller = live.controller.lock().await;
        controller.check_health().await
    }

    /// Last `tail` lines of the sandbox's stdout/stderr.
    pub async fn logs(&self, id: &SandboxId, tail: usize) -> Result<String> {
        let live = self.inner.live(id).await?;
        let controller = live.controller.lock().await;
        controller.logs(tail).await
    }

    /// Reject new creates and destroy every sandbox, waiting for in-flight
    /// creates to settle.
    pub async fn shutdown(&self) {
        self.inner.table.write().await.shutting_down = true;
        tracing::info!("Sandbox registry draining");

        loop {
            let (live, pending) = {
                let table = self.inner.table.read().await;
                let live: Vec<SandboxId> = table
                    .slots
                    .iter()
                    .filter(|(_, slot)| matches!(slot, Slot::Live(_)))
                    .map(|(id, _)| id.clone())
                    .collect();
                (live, table.pending_count())
            };

            if live.is_empty() && pending == 0 {
                break;
            }
            join_all(live.iter().map(|id| self.destroy(id))).await;
            if pending > 0 {
                tokio::time::sleep(self.inner.config.lifecycle.poll_interval()).await;
            }
        }

        tracing::info!("Sandbox registry drained");
    }
}

// =============================================================================
// Provisioning & Teardown
// =============================================================================

impl Inner {
    async fn reserve(&self, id: &SandboxId) -> Result<()> {
        let mut table = self.table.write().await;
        if table.shutting_down {
            return Err(Error::ShuttingDown);
        }
        if table.slots.contains_key(id) {
            return Err(Error::DuplicateSandbox(id.to_string()));
        }
        let max = self.config.limits.max_sandboxes;
        if table.slots.len() >= max {
            metrics::counter!("sandbox_create_total", "outcome" => "limit_reached").increment(1);
            return Err(Error::LimitReached(max));
        }
        table.slots.insert(id.clone(), Slot::Pending);
        Ok(())
    }

    async fn release_reservation(&self, id: &SandboxId) {
        let mut table = self.table.write().await;
        if matches!(table.slots.get(id), Some(Slot::Pending)) {
            table.slots.remove(id);
        }
    }

    async fn live(&self, id: &SandboxId) -> Result<Arc<LiveSandbox>> {
        match self.table.read().await.slots.get(id) {
            Some(Slot::Live(live)) => Ok(live.clone()),
            _ => Err(Error::SandboxNotFound(id.to_string())),
        }
    }

    /// Runs to completion even when the caller is gone; `reply` being closed
    /// is what tells it to tear the sandbox down instead of registering it.
    async fn provision(
        self: Arc<Self>,
        id: SandboxId,
        validated: ValidatedConfig,
        reply: oneshot::Sender<Result<SandboxHandle>>,
    ) {
        let started = std::time::Instant::now();
        let live = match self.acquire(&id, &validated).await {
            Ok(live) => Arc::new(live),
            Err(e) => {
                self.release_reservation(&id).await;
                metrics::counter!("sandbox_create_total", "outcome" => "failure").increment(1);
                tracing::warn!(
                    sandbox_id = %id,
                    kind = e.kind(),
                    error = %e,
                    "Sandbox creation failed"
                );
                let _ = reply.send(Err(e));
                return;
            }
        };

        let registered = {
            let mut table = self.table.write().await;
            let registered = !table.shutting_down && !reply.is_closed();
            if registered {
                table.slots.insert(id.clone(), Slot::Live(live.clone()));
                metrics::gauge!("sandbox_active").set(table.live_count() as f64);
            }
            registered
        };

        if !registered {
            // The reservation is held until teardown ends so shutdown waits
            // for it and the id stays taken.
            let outcome = if reply.is_closed() {
                tracing::info!(sandbox_id = %id, "Create cancelled, tearing down new sandbox");
                "cancelled"
            } else {
                tracing::info!(sandbox_id = %id, "Registry draining, tearing down new sandbox");
                "failure"
            };
            self.teardown(&live).await;
            self.release_reservation(&id).await;
            metrics::counter!("sandbox_create_total", "outcome" => outcome).increment(1);
            let _ = reply.send(Err(Error::ShuttingDown));
            return;
        }

        let handle = live.snapshot();
        tracing::info!(
            sandbox_id = %id,
            container_id = %handle.container_id,
            host_port = ?handle.host_port,
            network_mode = %validated.network_mode(),
            purpose = validated.purpose(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Sandbox running"
        );
        if reply.send(Ok(handle)).is_err() {
            tracing::info!(sandbox_id = %id, "Create cancelled by caller after registration");
            self.destroy(&id).await;
            metrics::counter!("sandbox_create_total", "outcome" => "cancelled").increment(1);
            return;
        }
        metrics::counter!("sandbox_create_total", "outcome" => "success").increment(1);
    }

    /// Stage, lease, and launch. On error nothing acquired here survives.
    async fn acquire(&self, id: &SandboxId, validated: &ValidatedConfig) -> Result<LiveSandbox> {
        let staging = self
            .stager
            .stage(id, validated.files(), validated.writable())
            .await?;

        let lease = match validated.host_port_claim() {
            Some(claim) => match self.ports.allocate(id, claim.requested_port()).await {
                Ok(lease) => Some(lease),
                Err(e) => {
                    self.stager.cleanup(&staging).await;
                    return Err(e);
                }
            },
            None => {
                if validated.preferred_port().is_some() {
                    tracing::debug!(
                        sandbox_id = %id,
                        network_mode = %validated.network_mode(),
                        "preferredPort ignored, no host port is used"
                    );
                }
                None
            }
        };

        let spec = self.container_spec(id, validated, &staging, lease.as_ref());
        let mut controller = ContainerLifecycleController::new(
            id.clone(),
            self.runtime.clone(),
            self.probe.clone(),
            LifecycleTimings {
                poll_interval: self.config.lifecycle.poll_interval(),
                stop_slack: self.config.lifecycle.stop_slack(),
            },
        );

        if let Err(e) = self.launch(&mut controller, &spec).await {
            if let Err(remove_err) = controller.remove().await {
                tracing::error!(
                    sandbox_id = %id,
                    error = %remove_err,
                    "Failed to remove container after failed create"
                );
            }
            if let Some(lease) = &lease {
                self.ports.release(lease).await;
            }
            self.stager.cleanup(&staging).await;
            return Err(e);
        }

        let handle = SandboxHandle {
            id: id.clone(),
            container_id: controller.container_id().unwrap_or_default().to_string(),
            host_port: lease.as_ref().map(PortLease::port),
            state: controller.state(),
            staging_path: staging.root().to_path_buf(),
            created_at: Utc::now(),
        };
        Ok(LiveSandbox {
            handle,
            state: controller.subscribe(),
            controller: Mutex::new(controller),
            lease,
            staging,
        })
    }

    async fn launch(
        &self,
        controller: &mut ContainerLifecycleController,
        spec: &ContainerSpec,
    ) -> Result<()> {
        controller.create(spec).await?;
        controller.start().await?;
        controller
            .await_ready(self.config.lifecycle.ready_timeout())
            .await
    }

    fn container_spec(
        &self,
        id: &SandboxId,
        validated: &ValidatedConfig,
        staging: &StagingHandle,
        lease: Option<&PortLease>,
    ) -> ContainerSpec {
        let profile = validated.profile();
        let limits = &self.config.limits;
        ContainerSpec {
            sandbox_id: id.clone(),
            name: format!("mcp-{}", id),
            image: profile.image.clone(),
            cmd: profile.cmd.clone(),
            env: validated.env().clone(),
            user: profile.user.clone(),
            workdir: profile.workdir.clone(),
            network_mode: validated.network_mode().clone(),
            mount: Some(MountSpec {
                source: staging.root().to_path_buf(),
                target: profile.workdir.clone(),
                read_only: staging.read_only(),
            }),
            port: lease
                .zip(validated.published_container_port())
                .map(|(lease, container_port)| PortMapping {
                    host_port: lease.port(),
                    container_port,
                }),
            memory_bytes: limits.memory_bytes,
            cpu_quota: limits.cpu_quota,
            pids_limit: limits.pids_limit,
        }
    }

    async fn destroy(&self, id: &SandboxId) {
        let live = {
            let mut table = self.table.write().await;
            match table.slots.remove(id) {
                Some(Slot::Live(live)) => {
                    metrics::gauge!("sandbox_active").set(table.live_count() as f64);
                    live
                }
                Some(Slot::Pending) => {
                    table.slots.insert(id.clone(), Slot::Pending);
                    tracing::debug!(sandbox_id = %id, "Destroy ignored, still provisioning");
                    return;
                }
                None => {
                    tracing::debug!(sandbox_id = %id, "Destroy ignored, unknown sandbox");
                    return;
                }
            }
        };

        self.teardown(&live).await;
        metrics::counter!("sandbox_destroy_total").increment(1);
        tracing::info!(sandbox_id = %id, "Sandbox destroyed");
    }

    /// Stop, remove, release the lease, clean staging. Past the destroy
    /// timeout the container is killed and removed directly, each call again
    /// bounded by that timeout, so teardown always finishes.
    async fn teardown(&self, live: &LiveSandbox) {
        let id = &live.handle.id;
        let lifecycle = &self.config.lifecycle;
        let limit = lifecycle.destroy_timeout();
        let graceful = async {
            let mut controller = live.controller.lock().await;
            if let Err(e) = controller.stop(lifecycle.stop_grace()).await {
                tracing::warn!(sandbox_id = %id, error = %e, "Stop failed");
            }
            if let Err(e) = controller.remove().await {
                tracing::error!(sandbox_id = %id, error = %e, "Container remove failed");
            }
        };

        if tokio::time::timeout(limit, graceful).await.is_err() {
            tracing::warn!(
                sandbox_id = %id,
                timeout = ?limit,
                "Destroy timed out, forcing container removal"
            );
            let container_id = &live.handle.container_id;
            match tokio::time::timeout(limit, self.runtime.kill(container_id)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(sandbox_id = %id, error = %e, "Forced kill failed"),
                Err(_) => tracing::warn!(sandbox_id = %id, "Forced kill timed out"),
            }
            let removed = tokio::time::timeout(limit, self.runtime.remove(container_id))
                .await
                .unwrap_or_else(|_| Err(Error::runtime("forced remove timed out")));
            if let Err(e) = removed {
                tracing::error!(
                    sandbox_id = %id,
                    container_id = %container_id,
                    error = %e,
                    "Forced remove failed, container may be orphaned"
                );
            }
        }

        if let Some(lease) = &live.lease {
            self.ports.release(lease).await;
        }
        self.stager.cleanup(&live.staging).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockRuntime;
    use mcp_sandbox_core::ImageProfile;
    use std::path::Path;
    use std::time::{Duration, Instant};

    fn config(staging: &Path, range_start: u16) -> ManagerConfig {
        let mut config = ManagerConfig::default();
        config.staging.root = staging.to_path_buf();
        config.lifecycle.poll_interval_ms = 10;
        config.lifecycle.ready_timeout_ms = 2_000;
        config.lifecycle.stop_slack_ms = 50;
        config.ports.range_start = range_start;
        config
    }

    fn registry(runtime: &MockRuntime, staging: &Path, range_start: u16) -> SandboxRegistry {
        SandboxRegistry::with_runtime(config(staging, range_start), Arc::new(runtime.clone()))
    }

    async fn settled(registry: &SandboxRegistry) -> bool {
        for _ in 0..200 {
            if registry.inner.table.read().await.slots.is_empty() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_init_requires_reachable_runtime() {
        let err = SandboxRegistry::init_with_runtime(
            ManagerConfig::default(),
            Arc::new(MockRuntime::new().unavailable()),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, Error::RuntimeUnavailable(_)));

        let runtime = Arc::new(MockRuntime::new());
        assert!(SandboxRegistry::init_with_runtime(ManagerConfig::default(), runtime)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_container_spec_carries_mount_and_port() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = MockRuntime::new();
        let registry = registry(&runtime, tmp.path(), 56000);

        let handle = registry
            .create(SandboxConfig::new("bridge").with_file("input.sql", "SELECT 1;"))
            .await
            .unwrap();
        let spec = runtime.spec(&handle.container_id).await.unwrap();

        assert_eq!(spec.name, format!("mcp-{}", handle.id));
        assert_eq!(spec.image, "mcp-sandbox/tool-server:latest");
        assert_eq!(spec.user, "nobody");
        let mount = spec.mount.unwrap();
        assert_eq!(mount.source, handle.staging_path);
        assert_eq!(mount.target, "/workspace");
        assert!(mount.read_only);
        let port = spec.port.unwrap();
        assert_eq!(Some(port.host_port), handle.host_port);
        assert_eq!(port.container_port, 3000);

        registry.shutdown().await;
    }

    struct AlwaysUp;

    #[async_trait::async_trait]
    impl HealthProbe for AlwaysUp {
        async fn probe(&self, _host_port: u16) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_custom_probe_decides_readiness() {
        let tmp = tempfile::tempdir().unwrap();
        // Nothing listens on the published port, only the probe says ready
        let runtime = MockRuntime::new().never_ready();
        let registry = SandboxRegistry::with_runtime_and_probe(
            config(tmp.path(), 56100),
            Arc::new(runtime.clone()),
            Arc::new(AlwaysUp),
        );

        let handle = registry.create(SandboxConfig::new("bridge")).await.unwrap();
        assert_eq!(handle.state, SandboxState::Running);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_no_port_without_publishing() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = MockRuntime::new();
        let registry = registry(&runtime, tmp.path(), 56200);

        let handle = registry
            .create(SandboxConfig::new("none").with_preferred_port(58000))
            .await
            .unwrap();
        assert_eq!(handle.host_port, None);
        assert!(runtime.spec(&handle.container_id).await.unwrap().port.is_none());
        assert!(registry.inner.ports.leased_ports().await.is_empty());

        registry.destroy(&handle.id).await;
    }

    #[tokio::test]
    async fn test_pending_sandbox_invisible() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = MockRuntime::new().with_create_delay(Duration::from_millis(200));
        let registry = registry(&runtime, tmp.path(), 56300);

        let id = SandboxId::from("slow-one");
        let background = registry.clone();
        let bg_id = id.clone();
        let create = tokio::spawn(async move {
            background
                .create_with_id(bg_id, SandboxConfig::new("none"))
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.get(&id).await.is_none());
        assert!(registry.list_active().await.is_empty());
        // Reserved ids are still taken
        let err = registry
            .create_with_id(id.clone(), SandboxConfig::new("none"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateSandbox(_)));

        let handle = create.await.unwrap().unwrap();
        assert_eq!(registry.get(&id).await.unwrap().id, handle.id);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_create_leaves_nothing_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = MockRuntime::new().with_create_delay(Duration::from_millis(100));
        let registry = registry(&runtime, tmp.path(), 56400);
        let id = SandboxId::from("abandoned");

        let dropped = tokio::time::timeout(
            Duration::from_millis(20),
            registry.create_with_id(
                id.clone(),
                SandboxConfig::new("bridge").with_file("input.sql", "SELECT 1;"),
            ),
        )
        .await;
        assert!(dropped.is_err());

        assert!(settled(&registry).await, "provisioning never settled");
        assert!(runtime
            .operations()
            .await
            .contains(&"create mock-mcp-abandoned".to_string()));
        assert_eq!(runtime.container_count().await, 0);
        assert!(registry.get(&id).await.is_none());
        assert!(registry.list_active().await.is_empty());
        assert!(registry.inner.ports.leased_ports().await.is_empty());
        assert!(!tmp.path().join("abandoned").exists());

        // The id can be reused
        registry
            .create_with_id(id.clone(), SandboxConfig::new("none"))
            .await
            .unwrap();
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_unsafe_ids_rejected_before_side_effects() {
        let tmp = tempfile::tempdir().unwrap();
        let staging = tmp.path().join("staging");
        let runtime = MockRuntime::new();
        let registry = registry(&runtime, &staging, 56700);
        let outside = tmp.path().join("outside");

        for id in ["../escaped".to_string(), outside.display().to_string()] {
            let err = registry
                .create_with_id(
                    SandboxId(id),
                    SandboxConfig::new("none").with_file("x.sql", "pwn"),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Validation(_)));
        }

        assert!(!tmp.path().join("escaped").exists());
        assert!(!outside.exists());
        assert!(!staging.exists());
        assert!(runtime.operations().await.is_empty());
        assert!(registry.inner.table.read().await.slots.is_empty());
    }

    #[tokio::test]
    async fn test_host_mode_leases_profile_port() {
        let tmp = tempfile::tempdir().unwrap();
        let free = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = free.local_addr().unwrap().port();
        drop(free);

        let mut config = config(tmp.path(), 56800);
        config.profiles.insert(
            "hosted".into(),
            ImageProfile::new("mcp-sandbox/tool-server:latest").with_container_port(port),
        );
        let runtime = MockRuntime::new();
        let registry = SandboxRegistry::with_runtime(config, Arc::new(runtime.clone()));
        let request = || SandboxConfig::new("host").with_purpose("hosted");

        let first = registry.create(request()).await.unwrap();
        assert_eq!(first.host_port, Some(port));
        let spec = runtime.spec(&first.container_id).await.unwrap();
        assert!(spec.port.is_none());
        assert_eq!(registry.inner.ports.leased_ports().await, vec![port]);

        let err = registry.create(request()).await.unwrap_err();
        assert!(matches!(err, Error::PortExhausted(_)));
        assert_eq!(runtime.container_count().await, 1);

        registry.destroy(&first.id).await;
        assert!(registry.inner.ports.leased_ports().await.is_empty());
        let again = registry.create(request()).await.unwrap();
        assert_eq!(again.host_port, Some(port));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_forced_teardown_is_bounded_and_releases() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = MockRuntime::new().hanging_stop().hanging_kill();
        let mut config = config(tmp.path(), 56900);
        config.lifecycle.stop_grace_secs = 0;
        config.lifecycle.destroy_timeout_ms = 200;
        let registry = SandboxRegistry::with_runtime(config, Arc::new(runtime.clone()));

        let handle = registry
            .create(SandboxConfig::new("bridge").with_file("input.sql", "SELECT 1;"))
            .await
            .unwrap();
        let port = handle.host_port.unwrap();
        assert_eq!(registry.inner.ports.leased_ports().await, vec![port]);

        let started = Instant::now();
        tokio::time::timeout(Duration::from_secs(5), registry.destroy(&handle.id))
            .await
            .expect("destroy must be bounded");
        assert!(started.elapsed() < Duration::from_secs(2));

        let ops = runtime.operations().await;
        assert!(ops.contains(&format!("kill {}", handle.container_id)));
        assert!(ops.contains(&format!("remove {}", handle.container_id)));
        assert_eq!(runtime.container_count().await, 0);
        assert!(registry.inner.ports.leased_ports().await.is_empty());
        assert!(!handle.staging_path.exists());
        assert!(registry.get(&handle.id).await.is_none());
    }

    #[tokio::test]
    async fn test_list_active_oldest_first() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = MockRuntime::new();
        let registry = registry(&runtime, tmp.path(), 57000);

        let mut created = Vec::new();
        for name in ["zeta", "alpha", "mid"] {
            let handle = registry
                .create_with_id(SandboxId::from(name), SandboxConfig::new("none"))
                .await
                .unwrap();
            created.push(handle.id);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let listed: Vec<SandboxId> = registry
            .list_active()
            .await
            .into_iter()
            .map(|handle| handle.id)
            .collect();
        assert_eq!(listed, created);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_check_health_and_logs() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = MockRuntime::new();
        let registry = registry(&runtime, tmp.path(), 56500);

        let handle = registry.create(SandboxConfig::new("bridge")).await.unwrap();
        assert_eq!(
            registry.check_health(&handle.id).await.unwrap(),
            SandboxState::Running
        );
        assert!(registry.logs(&handle.id, 10).await.is_ok());

        runtime.crash(&handle.container_id).await;
        assert_eq!(
            registry.check_health(&handle.id).await.unwrap(),
            SandboxState::HealthCheckFailed
        );
        assert_eq!(
            registry.get(&handle.id).await.unwrap().state,
            SandboxState::HealthCheckFailed
        );

        let missing = SandboxId::from("missing");
        assert!(matches!(
            registry.check_health(&missing).await,
            Err(Error::SandboxNotFound(_))
        ));
        assert!(matches!(
            registry.logs(&missing, 10).await,
            Err(Error::SandboxNotFound(_))
        ));

        registry.destroy(&handle.id).await;
        assert!(registry.get(&handle.id).await.is_none());
    }
}

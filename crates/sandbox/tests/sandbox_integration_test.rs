//! Sandbox integration tests.
//!
//! Tests the full pipeline: SandboxRegistry → validator / stager / ports →
//! ContainerLifecycleController → ContainerRuntime (MockRuntime).
//! These tests do NOT require Docker.

use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use mcp_sandbox::{
    is_port_free, Error, ManagerConfig, MockRuntime, SandboxConfig, SandboxId, SandboxRegistry,
    SandboxState,
};

// =============================================================================
// Helpers
// =============================================================================

fn test_config(staging: &Path, range_start: u16) -> ManagerConfig {
    let mut config = ManagerConfig::default();
    config.staging.root = staging.to_path_buf();
    config.ports.range_start = range_start;
    config.lifecycle.poll_interval_ms = 10;
    config.lifecycle.ready_timeout_ms = 2_000;
    config.lifecycle.stop_slack_ms = 50;
    config.lifecycle.destroy_timeout_ms = 1_000;
    config
}

fn registry_with(runtime: &MockRuntime, config: ManagerConfig) -> SandboxRegistry {
    SandboxRegistry::with_runtime(config, Arc::new(runtime.clone()))
}

/// Entries left under the staging root.
fn staging_entries(root: &Path) -> usize {
    match std::fs::read_dir(root) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}

// =============================================================================
// 1. Invalid network mode
// =============================================================================

#[tokio::test]
async fn test_invalid_network_mode_rejected_before_side_effects() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = MockRuntime::new();
    let registry = registry_with(&runtime, test_config(tmp.path(), 40000));

    let err = registry
        .create(SandboxConfig::new("bridgeInvalid"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Validation(_)));
    assert!(err.to_string().contains(
        "networkMode is of invalid type. Expecting one of: bridge, none, host, container:<name>"
    ));
    assert!(runtime.operations().await.is_empty());
    assert_eq!(staging_entries(tmp.path()), 0);
}

// =============================================================================
// 2. Bridge sandbox with one input file
// =============================================================================

#[tokio::test]
async fn test_bridge_sandbox_runs_with_staged_file() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = MockRuntime::new();
    let registry = registry_with(&runtime, test_config(tmp.path(), 40200));

    let handle = registry
        .create(SandboxConfig::new("bridge").with_file("input.sql", "SELECT 1;"))
        .await
        .unwrap();

    assert_eq!(handle.state, SandboxState::Running);
    let port = handle.host_port.expect("bridge sandbox publishes a port");
    assert!(port >= 40200);
    // The tool server holds the port now
    assert!(!is_port_free(port));
    assert_eq!(
        std::fs::read(handle.staging_path.join("input.sql")).unwrap(),
        b"SELECT 1;"
    );

    let listed = registry.list_active().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, handle.id);

    registry.destroy(&handle.id).await;
    assert!(registry.get(&handle.id).await.is_none());
    assert!(!handle.staging_path.exists());
    assert_eq!(runtime.container_count().await, 0);
}

// =============================================================================
// 3. Health check never succeeds
// =============================================================================

#[tokio::test]
async fn test_health_check_timeout_releases_everything() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = MockRuntime::new().never_ready();
    let mut config = test_config(tmp.path(), 40400);
    config.ports.max_attempts = 1;
    config.lifecycle.ready_timeout_ms = 200;
    let registry = registry_with(&runtime, config);

    let id = SandboxId::from("never-ready");
    let err = registry
        .create_with_id(
            id.clone(),
            SandboxConfig::new("bridge").with_file("input.sql", "SELECT 1;"),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::HealthCheckTimeout(_)));
    assert!(registry.get(&id).await.is_none());
    assert_eq!(runtime.container_count().await, 0);
    assert_eq!(staging_entries(tmp.path()), 0);

    // With a single candidate port, a retained lease would surface as
    // PortExhausted on the retry
    let err = registry
        .create(SandboxConfig::new("bridge"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::HealthCheckTimeout(_)));
}

#[tokio::test]
async fn test_accept_then_close_is_not_ready() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = MockRuntime::new().closing_connections();
    let mut config = test_config(tmp.path(), 40500);
    config.ports.max_attempts = 1;
    config.lifecycle.ready_timeout_ms = 300;
    config.lifecycle.probe_read_window_ms = 50;
    let registry = registry_with(&runtime, config);

    let err = registry
        .create(SandboxConfig::new("bridge"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::HealthCheckTimeout(_)));
    assert!(registry.list_active().await.is_empty());
    assert_eq!(runtime.container_count().await, 0);
    assert_eq!(staging_entries(tmp.path()), 0);
}

// =============================================================================
// 4. Concurrent creates
// =============================================================================

#[tokio::test]
async fn test_concurrent_creates_get_distinct_ports() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = MockRuntime::new();
    let registry = registry_with(&runtime, test_config(tmp.path(), 40600));

    let mut tasks = Vec::new();
    for i in 0..5 {
        let registry = registry.clone();
        tasks.push(tokio::spawn(async move {
            registry
                .create(SandboxConfig::new("bridge").with_file("input.sql", format!("SELECT {};", i)))
                .await
        }));
    }

    let mut ports = HashSet::new();
    for task in tasks {
        let handle = task.await.unwrap().unwrap();
        assert!(ports.insert(handle.host_port.unwrap()));
    }
    assert_eq!(registry.list_active().await.len(), 5);

    registry.shutdown().await;
    assert!(registry.list_active().await.is_empty());
    assert_eq!(runtime.container_count().await, 0);
    assert_eq!(staging_entries(tmp.path()), 0);
}

// =============================================================================
// 5. Destroy is idempotent
// =============================================================================

#[tokio::test]
async fn test_destroy_twice_and_unknown_id() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = MockRuntime::new();
    let registry = registry_with(&runtime, test_config(tmp.path(), 40800));

    registry.destroy(&SandboxId::from("never-existed")).await;

    let handle = registry.create(SandboxConfig::new("none")).await.unwrap();
    registry.destroy(&handle.id).await;
    registry.destroy(&handle.id).await;

    assert!(registry.get(&handle.id).await.is_none());
    let removes = runtime
        .operations()
        .await
        .into_iter()
        .filter(|op| op.starts_with("remove"))
        .count();
    assert_eq!(removes, 1);
}

// =============================================================================
// 6. Failed creates leave nothing behind
// =============================================================================

#[tokio::test]
async fn test_container_creation_failure_unwinds() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = MockRuntime::new().failing_create();
    let mut config = test_config(tmp.path(), 41000);
    config.ports.max_attempts = 1;
    let registry = registry_with(&runtime, config);

    let err = registry
        .create(SandboxConfig::new("bridge").with_file("input.sql", "SELECT 1;"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ContainerCreation(_)));
    assert_eq!(staging_entries(tmp.path()), 0);
    assert!(registry.list_active().await.is_empty());

    // The single candidate port was released again
    let err = registry
        .create(SandboxConfig::new("bridge"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ContainerCreation(_)));
}

#[tokio::test]
async fn test_start_failure_removes_container() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = MockRuntime::new().failing_start();
    let registry = registry_with(&runtime, test_config(tmp.path(), 41200));

    let err = registry
        .create(SandboxConfig::new("bridge"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ContainerCreation(_)));
    assert_eq!(runtime.container_count().await, 0);
    assert_eq!(staging_entries(tmp.path()), 0);
}

#[tokio::test]
async fn test_port_exhaustion_unwinds_staging() {
    let tmp = tempfile::tempdir().unwrap();
    let blocker = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
    let taken = blocker.local_addr().unwrap().port();

    let runtime = MockRuntime::new();
    let mut config = test_config(tmp.path(), taken);
    config.ports.max_attempts = 1;
    let registry = registry_with(&runtime, config);

    let err = registry
        .create(SandboxConfig::new("bridge").with_file("input.sql", "SELECT 1;"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::PortExhausted(_)));
    assert_eq!(staging_entries(tmp.path()), 0);
    assert!(runtime.operations().await.is_empty());
}

#[tokio::test]
async fn test_early_exit_unwinds() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = MockRuntime::new().exiting_on_start();
    let registry = registry_with(&runtime, test_config(tmp.path(), 41400));

    let err = registry
        .create(SandboxConfig::new("bridge"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::HealthCheckTimeout(_)));
    assert_eq!(runtime.container_count().await, 0);
    assert_eq!(staging_entries(tmp.path()), 0);
}

// =============================================================================
// 7. Registry admission
// =============================================================================

#[tokio::test]
async fn test_duplicate_id_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = MockRuntime::new();
    let registry = registry_with(&runtime, test_config(tmp.path(), 41600));
    let id = SandboxId::from("pg-tools");

    registry
        .create_with_id(id.clone(), SandboxConfig::new("none"))
        .await
        .unwrap();
    let err = registry
        .create_with_id(id.clone(), SandboxConfig::new("none"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::DuplicateSandbox(_)));
    assert_eq!(registry.list_active().await.len(), 1);
    registry.shutdown().await;
}

#[tokio::test]
async fn test_capacity_limit() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = MockRuntime::new();
    let mut config = test_config(tmp.path(), 41800);
    config.limits.max_sandboxes = 2;
    let registry = registry_with(&runtime, config);

    let first = registry.create(SandboxConfig::new("none")).await.unwrap();
    registry.create(SandboxConfig::new("none")).await.unwrap();

    let err = registry
        .create(SandboxConfig::new("none"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LimitReached(2)));
    assert_eq!(err.to_string(), "Maximum number of sandboxes (2) reached");

    // Destroying frees a slot
    registry.destroy(&first.id).await;
    registry.create(SandboxConfig::new("none")).await.unwrap();
    registry.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_drains_and_rejects() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = MockRuntime::new();
    let registry = registry_with(&runtime, test_config(tmp.path(), 42000));

    for _ in 0..3 {
        registry.create(SandboxConfig::new("bridge")).await.unwrap();
    }
    registry.shutdown().await;

    assert!(registry.list_active().await.is_empty());
    assert_eq!(runtime.container_count().await, 0);
    assert_eq!(staging_entries(tmp.path()), 0);

    let err = registry
        .create(SandboxConfig::new("none"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ShuttingDown));
}

// =============================================================================
// 8. Teardown fallbacks
// =============================================================================

#[tokio::test]
async fn test_hanging_stop_falls_back_to_kill() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = MockRuntime::new().hanging_stop();
    let mut config = test_config(tmp.path(), 42200);
    config.lifecycle.stop_grace_secs = 0;
    let registry = registry_with(&runtime, config);

    let handle = registry.create(SandboxConfig::new("none")).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), registry.destroy(&handle.id))
        .await
        .expect("destroy must be bounded");

    let ops = runtime.operations().await;
    assert!(ops.contains(&format!("kill {}", handle.container_id)));
    assert!(ops.contains(&format!("remove {}", handle.container_id)));
    assert_eq!(runtime.container_count().await, 0);
}

#[tokio::test]
async fn test_container_network_mode_accepted() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = MockRuntime::new();
    let registry = registry_with(&runtime, test_config(tmp.path(), 42400));

    let handle = registry
        .create(SandboxConfig::new("container:pg-main"))
        .await
        .unwrap();
    assert_eq!(handle.host_port, None);
    let spec = runtime.spec(&handle.container_id).await.unwrap();
    assert_eq!(spec.network_mode.to_string(), "container:pg-main");

    registry.shutdown().await;
}

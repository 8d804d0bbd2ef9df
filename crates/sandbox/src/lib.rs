#![deny(unused)]
//! Sandbox lifecycle manager for MCP tool servers.
//!
//! Each sandbox is a hardened container that runs one tool server with a set
//! of caller-supplied files mounted into its workspace. The registry turns a
//! loosely-typed [`SandboxConfig`] into a running container with a leased host
//! port, and tears everything down again on `destroy` or `shutdown`.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────┐
//! │  SandboxRegistry                       │
//! │    create / destroy / get / shutdown   │
//! ├────────────────────────────────────────┤
//! │  ConfigValidator   (pure, no I/O)      │
//! │  FileStager        (staging dir)       │
//! │  PortAllocator     (lease table)       │
//! ├────────────────────────────────────────┤
//! │  ContainerLifecycleController          │
//! │    state machine + readiness polling   │
//! ├────────────────────────────────────────┤
//! │  ContainerRuntime (DockerRuntime)      │
//! │    ↓ Docker API via bollard            │
//! ├────────────────────────────────────────┤
//! │  Docker Container                      │
//! │    /workspace  (bind mount, ro)        │
//! │    non-root, no caps, no-new-privs     │
//! └────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use mcp_sandbox::SandboxRegistry;
//! use mcp_sandbox_core::{ManagerConfig, SandboxConfig};
//!
//! let registry = SandboxRegistry::init(ManagerConfig::load()?).await?;
//! let handle = registry
//!     .create(SandboxConfig::new("bridge").with_file("input.sql", "SELECT 1;"))
//!     .await?;
//! // ... talk to the tool server on handle.host_port ...
//! registry.destroy(&handle.id).await;
//! registry.shutdown().await;
//! ```

pub mod engine;
pub mod lifecycle;
pub mod ports;
pub mod registry;
pub mod staging;
pub mod validator;

pub use engine::{ContainerRuntime, ContainerSpec, ContainerStatus, DockerRuntime, MockRuntime};
pub use lifecycle::{ContainerLifecycleController, HealthProbe, TcpProbe};
pub use mcp_sandbox_core::{
    Error, ManagerConfig, Result, SandboxConfig, SandboxHandle, SandboxId, SandboxState,
};
pub use ports::{is_port_free, PortAllocator, PortLease};
pub use registry::SandboxRegistry;
pub use staging::{FileStager, StagingHandle};
pub use validator::{ConfigValidator, HostPortClaim, ValidatedConfig, ValidatedFile};

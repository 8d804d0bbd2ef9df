//! Host port leasing.
//!
//! The container runtime publishes a sandbox's port on every host interface,
//! so freeness is probed on the wildcard address. Probing and recording the
//! lease happen under one lock: two allocations in this process can never
//! both see the same port as free.

use std::collections::HashMap;
use std::net::{Ipv4Addr, TcpListener};

use mcp_sandbox_core::config::PortConfig;
use mcp_sandbox_core::{Error, Result, SandboxId};
use tokio::sync::Mutex;

/// Returns `true` if a listener can be bound on `0.0.0.0:<port>` right now.
///
/// Any bind failure counts as "not free", not only `AddrInUse`. The probe
/// listener is dropped before returning.
pub fn is_port_free(port: u16) -> bool {
    if port == 0 {
        return false;
    }
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
}

/// An exclusive claim on a host port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortLease {
    port: u16,
    owner: SandboxId,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn owner(&self) -> &SandboxId {
        &self.owner
    }
}

/// In-process table of leased host ports.
pub struct PortAllocator {
    leases: Mutex<HashMap<u16, SandboxId>>,
    range_start: u16,
    max_attempts: u16,
}

impl PortAllocator {
    pub fn new(config: &PortConfig) -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            range_start: config.range_start,
            max_attempts: config.max_attempts,
        }
    }

    /// Lease `preferred` exactly, or the first free port of the scan range.
    pub async fn allocate(&self, owner: &SandboxId, preferred: Option<u16>) -> Result<PortLease> {
        let mut leases = self.leases.lock().await;

        let port = match preferred {
            Some(port) => {
                if let Some(holder) = leases.get(&port) {
                    return Err(Error::port_exhausted(format!(
                        "preferred port {} is already leased to {}",
                        port, holder
                    )));
                }
                if !is_port_free(port) {
                    return Err(Error::port_exhausted(format!(
                        "preferred port {} is not bindable on all interfaces",
                        port
                    )));
                }
                port
            }
            // Blocking binds under the async lock: each one is a single
            // non-waiting syscall and the scan is capped by max_attempts.
            None => (self.range_start..=u16::MAX)
                .take(usize::from(self.max_attempts))
                .find(|port| !leases.contains_key(port) && is_port_free(*port))
                .ok_or_else(|| {
                    Error::port_exhausted(format!(
                        "no free port in {} candidates starting at {}",
                        self.max_attempts, self.range_start
                    ))
                })?,
        };

        leases.insert(port, owner.clone());
        metrics::gauge!("sandbox_port_leases").set(leases.len() as f64);
        tracing::debug!(sandbox_id = %owner, port, "Port leased");

        Ok(PortLease {
            port,
            owner: owner.clone(),
        })
    }

    /// Release a lease. Unknown or already-released leases are ignored.
    pub async fn release(&self, lease: &PortLease) {
        let mut leases = self.leases.lock().await;
        if leases.get(&lease.port) == Some(&lease.owner) {
            leases.remove(&lease.port);
            metrics::gauge!("sandbox_port_leases").set(leases.len() as f64);
            tracing::debug!(sandbox_id = %lease.owner, port = lease.port, "Port released");
        }
    }

    /// Currently leased ports, ascending.
    pub async fn leased_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.leases.lock().await.keys().copied().collect();
        ports.sort_unstable();
        ports
    }
}

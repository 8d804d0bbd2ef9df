#![deny(unused)]
//! Core types, configuration, and error definitions for the MCP sandbox
//! manager.
//!
//! This crate has no runtime dependencies on Docker or tokio; it is shared by
//! the lifecycle crate and the daemon binary.

pub mod config;
pub mod error;
pub mod fs_policy;
pub mod types;

pub use config::{ImageProfile, ManagerConfig};
pub use error::{Error, Result};
pub use types::*;

//! Error types for the sandbox manager.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::SandboxState;

/// Result type alias using the sandbox manager's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the sandbox manager.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Request Errors (surfaced by create)
    // =========================================================================
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Port exhausted: {0}")]
    PortExhausted(String),

    #[error("Container creation failed: {0}")]
    ContainerCreation(String),

    #[error("Health check timed out: {0}")]
    HealthCheckTimeout(String),

    #[error("Staging I/O error at {}: {source}", path.display())]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // =========================================================================
    // Registry Errors
    // =========================================================================
    #[error("Sandbox already exists: {0}")]
    DuplicateSandbox(String),

    #[error("Sandbox not found: {0}")]
    SandboxNotFound(String),

    #[error("Maximum number of sandboxes ({0}) reached")]
    LimitReached(usize),

    #[error("Sandbox registry is shutting down")]
    ShuttingDown,

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: SandboxState, to: SandboxState },

    // =========================================================================
    // Runtime & Configuration Errors
    // =========================================================================
    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a port exhaustion error.
    pub fn port_exhausted(msg: impl Into<String>) -> Self {
        Self::PortExhausted(msg.into())
    }

    /// Create a container creation error.
    pub fn container_creation(msg: impl Into<String>) -> Self {
        Self::ContainerCreation(msg.into())
    }

    /// Create a health check timeout error.
    pub fn health_check_timeout(msg: impl Into<String>) -> Self {
        Self::HealthCheckTimeout(msg.into())
    }

    /// Create a staging error for the given path.
    pub fn staging(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Staging {
            path: path.into(),
            source,
        }
    }

    /// Create a generic runtime error.
    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Stable machine-readable name of the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::PortExhausted(_) => "port_exhausted",
            Self::ContainerCreation(_) => "container_creation",
            Self::HealthCheckTimeout(_) => "health_check_timeout",
            Self::Staging { .. } => "staging_io",
            Self::DuplicateSandbox(_) => "duplicate_sandbox",
            Self::SandboxNotFound(_) => "sandbox_not_found",
            Self::LimitReached(_) => "limit_reached",
            Self::ShuttingDown => "shutting_down",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::RuntimeUnavailable(_) => "runtime_unavailable",
            Self::Runtime(_) => "runtime",
            Self::Config(_) => "config",
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

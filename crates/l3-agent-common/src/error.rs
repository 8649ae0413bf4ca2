//! Error types for L3 agent operations.
//!
//! This module defines the error types used throughout the agent crates.
//! All errors implement `std::error::Error` via `thiserror`.

use l3_agent_types::ParseError;
use std::io;
use thiserror::Error;

/// Result type alias for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Remote exception type raised by the controller when more than one
/// external network exists and none is configured.
pub const TOO_MANY_EXTERNAL_NETWORKS: &str = "TooManyExternalNetworks";

/// Failures of a controller call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// The call did not complete in time.
    #[error("Timeout waiting on RPC response to '{method}'")]
    Timeout {
        /// The remote method.
        method: String,
    },

    /// The controller raised an exception while handling the call.
    #[error("Remote error: {exc_type}: {message}")]
    Remote {
        /// Exception type name reported by the controller.
        exc_type: String,
        /// Error message.
        message: String,
    },

    /// Transport-level failure (connection lost, serialization, ...).
    #[error("Messaging error: {0}")]
    Messaging(String),
}

impl RpcError {
    /// Creates a timeout error.
    pub fn timeout(method: impl Into<String>) -> Self {
        Self::Timeout {
            method: method.into(),
        }
    }

    /// Creates a remote error.
    pub fn remote(exc_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            exc_type: exc_type.into(),
            message: message.into(),
        }
    }

    /// Returns true for timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }

    /// Returns true if the controller raised the given exception type.
    pub fn is_remote_type(&self, exc_type: &str) -> bool {
        matches!(self, RpcError::Remote { exc_type: t, .. } if t == exc_type)
    }

    /// Returns true if the controller does not implement the method.
    pub fn is_unsupported(&self) -> bool {
        self.is_remote_type("AttributeError") || self.is_remote_type("UnsupportedVersion")
    }
}

/// Errors that can occur during agent operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Failed to execute a shell command (spawn error).
    #[error("Failed to execute shell command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Shell command returned non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// Configuration validation error.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// The router cannot be served by this agent in its binding mode.
    #[error("Router {router_id} is not compatible with this agent")]
    RouterNotCompatibleWithAgent {
        /// The rejected router.
        router_id: String,
    },

    /// Distributed routers cannot also be highly available.
    #[error("Router {router_id} is both distributed and HA, which is not supported")]
    DvrHaRouterNotSupported {
        /// The rejected router.
        router_id: String,
    },

    /// The full router fetch failed; the sync pass was aborted.
    #[error("Aborting router synchronization")]
    AbortSyncRouters,

    /// More than one external network and no gateway network configured.
    #[error(
        "The 'gateway_external_network_id' option must be configured for this agent \
         as more than one external network exists"
    )]
    TooManyExternalNetworks,

    /// Controller call failed.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// Namespace/interface driver operation failed.
    #[error("Driver operation failed: {operation}: {message}")]
    Driver {
        /// The operation that failed.
        operation: String,
        /// Error message.
        message: String,
    },

    /// Malformed data from the controller.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// I/O failure (state files, configuration).
    #[error("I/O error on {path}: {source}")]
    Io {
        /// The file involved.
        path: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl AgentError {
    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a router-not-compatible error.
    pub fn not_compatible(router_id: impl Into<String>) -> Self {
        Self::RouterNotCompatibleWithAgent {
            router_id: router_id.into(),
        }
    }

    /// Creates a DVR+HA error.
    pub fn dvr_ha_not_supported(router_id: impl Into<String>) -> Self {
        Self::DvrHaRouterNotSupported {
            router_id: router_id.into(),
        }
    }

    /// Creates a driver error.
    pub fn driver(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Driver {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates an I/O error for a file.
    pub fn io(path: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true for transient failures that a later full sync may fix.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::Rpc(_)
                | AgentError::AbortSyncRouters
                | AgentError::ShellCommandFailed { .. }
                | AgentError::Driver { .. }
        )
    }

    /// Returns true for failures that stop the agent at startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::InvalidConfig { .. } | AgentError::TooManyExternalNetworks
        )
    }
}

//! Common infrastructure for the L3 router agent.
//!
//! - [`shell`]: Safe shell command execution with proper quoting, and the
//!   [`CommandExecutor`] seam used for dry-run and tests
//! - [`iptables`]: Per-router nat table with tagged rules and atomic commit
//! - [`rpc`]: Controller contract ([`PluginApi`]) and the state report
//! - [`driver`]: Namespace/interface driver contract ([`NetworkDriver`])
//! - [`error`]: Error types for agent operations
//!
//! # Example
//!
//! ```ignore
//! use l3_agent_common::{
//!     shell::{self, IP_CMD, shellquote},
//!     AgentResult,
//! };
//!
//! async fn add_namespace(name: &str) -> AgentResult<()> {
//!     let cmd = format!("{} netns add {}", IP_CMD, shellquote(name));
//!     shell::exec_or_throw(&cmd).await?;
//!     Ok(())
//! }
//! ```

pub mod driver;
pub mod error;
pub mod iptables;
pub mod rpc;
pub mod shell;

// Re-export commonly used items at crate root
pub use driver::{KeepalivedConfig, NetworkDriver, PortBinding, RadvdPrefix};
pub use error::{AgentError, AgentResult, RpcError};
pub use iptables::IptablesManager;
pub use rpc::{AgentConfigurations, AgentStateReport, PluginApi};
pub use shell::{CommandExecutor, ExecResult, RecordingExecutor, ShellExecutor};

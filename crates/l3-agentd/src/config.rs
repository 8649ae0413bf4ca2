//! Agent configuration.
//!
//! Loads and validates the agent configuration from a TOML file.
//! Default location: /etc/l3-agent/l3_agent.toml

use l3_agent_common::{AgentError, AgentResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/l3-agent/l3_agent.toml";

/// Role of the agent for distributed routers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    /// Centralized routers only.
    #[default]
    Legacy,
    /// Compute-node agent for distributed routers.
    Dvr,
    /// Network-node agent serving distributed routers and their SNAT.
    DvrSnat,
}

impl AgentMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            AgentMode::Legacy => "legacy",
            AgentMode::Dvr => "dvr",
            AgentMode::DvrSnat => "dvr_snat",
        }
    }
}

impl fmt::Display for AgentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supported interface drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceDriverKind {
    /// Internal ports on an Open vSwitch bridge.
    Ovs,
    /// veth pairs enslaved to a Linux bridge.
    LinuxBridge,
}

impl FromStr for InterfaceDriverKind {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ovs" | "openvswitch" => Ok(InterfaceDriverKind::Ovs),
            "linuxbridge" | "bridge" => Ok(InterfaceDriverKind::LinuxBridge),
            _ => Err(AgentError::invalid_config(
                "interface_driver",
                format!("Error importing interface driver '{}'", s),
            )),
        }
    }
}

/// Complete agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Host name the agent reports under
    #[serde(default = "default_host")]
    pub host: String,

    /// Interface driver name (ovs, linuxbridge); required
    #[serde(default)]
    pub interface_driver: Option<String>,

    /// Run each router in its own network namespace
    #[serde(default = "default_true")]
    pub use_namespaces: bool,

    /// The only router served when namespaces are disabled
    #[serde(default)]
    pub router_id: Option<String>,

    /// Serve routers without an external gateway
    #[serde(default = "default_true")]
    pub handle_internal_only_routers: bool,

    /// Bridge external gateway ports are attached to; empty means any
    /// external network can be served
    #[serde(default = "default_external_network_bridge")]
    pub external_network_bridge: String,

    /// External network served by this agent
    #[serde(default)]
    pub gateway_external_network_id: Option<String>,

    /// Role for distributed routers
    #[serde(default)]
    pub agent_mode: AgentMode,

    /// Number of concurrent router workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Interval between full-sync checks in seconds
    #[serde(default = "default_periodic_interval")]
    pub periodic_interval_secs: u64,

    /// Interval between state reports in seconds; 0 disables reporting
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,

    /// Batching window for HA state changes in milliseconds
    #[serde(default = "default_ha_state_report_interval")]
    pub ha_state_report_interval_ms: u64,

    /// JSON document backing the standalone controller
    #[serde(default)]
    pub controller_state_file: Option<PathBuf>,

    /// Directory for keepalived and radvd configuration files
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    /// Record commands instead of executing them
    #[serde(default)]
    pub dry_run: bool,
}

fn default_host() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn default_true() -> bool {
    true
}

fn default_external_network_bridge() -> String {
    "br-ex".to_string()
}

fn default_workers() -> usize {
    8
}

fn default_periodic_interval() -> u64 {
    40
}

fn default_report_interval() -> u64 {
    30
}

fn default_ha_state_report_interval() -> u64 {
    200
}

fn default_state_path() -> PathBuf {
    PathBuf::from("/var/lib/l3-agent")
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            interface_driver: None,
            use_namespaces: default_true(),
            router_id: None,
            handle_internal_only_routers: default_true(),
            external_network_bridge: default_external_network_bridge(),
            gateway_external_network_id: None,
            agent_mode: AgentMode::default(),
            workers: default_workers(),
            periodic_interval_secs: default_periodic_interval(),
            report_interval_secs: default_report_interval(),
            ha_state_report_interval_ms: default_ha_state_report_interval(),
            controller_state_file: None,
            state_path: default_state_path(),
            dry_run: false,
        }
    }
}

impl AgentConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> AgentResult<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                AgentError::invalid_config(
                    path.display().to_string(),
                    format!("Failed to parse config file: {}", e),
                )
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(AgentError::io(path.display().to_string(), e)),
        }
    }

    /// Validate numeric settings
    pub fn validate(&self) -> AgentResult<()> {
        if self.workers == 0 {
            return Err(AgentError::invalid_config("workers", "must be > 0"));
        }
        if self.periodic_interval_secs == 0 {
            return Err(AgentError::invalid_config(
                "periodic_interval_secs",
                "must be > 0",
            ));
        }
        if self.ha_state_report_interval_ms == 0 {
            return Err(AgentError::invalid_config(
                "ha_state_report_interval_ms",
                "must be > 0",
            ));
        }
        Ok(())
    }

    /// Checks the settings whose absence stops the agent.
    ///
    /// Returns the interface driver to build.
    pub fn check_config_params(&self) -> AgentResult<InterfaceDriverKind> {
        let driver = match self.interface_driver.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => {
                return Err(AgentError::invalid_config(
                    "interface_driver",
                    "An interface driver must be specified",
                ))
            }
        };
        if !self.use_namespaces && self.router_id.is_none() {
            return Err(AgentError::invalid_config(
                "router_id",
                "Router id is required if not using namespaces",
            ));
        }
        driver.parse()
    }

    /// The single router served when namespaces are disabled.
    pub fn restricted_router_id(&self) -> Option<&str> {
        if self.use_namespaces {
            None
        } else {
            self.router_id.as_deref()
        }
    }

    /// External bridge, if one is configured.
    pub fn external_bridge(&self) -> Option<&str> {
        Some(self.external_network_bridge.as_str()).filter(|b| !b.is_empty())
    }

    pub fn periodic_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_interval_secs)
    }

    /// Report interval; `None` when reporting is disabled.
    pub fn report_interval(&self) -> Option<Duration> {
        (self.report_interval_secs > 0).then(|| Duration::from_secs(self.report_interval_secs))
    }

    pub fn ha_state_report_interval(&self) -> Duration {
        Duration::from_millis(self.ha_state_report_interval_ms)
    }
}

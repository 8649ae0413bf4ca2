//! Controller contract consumed by the agent.
//!
//! The transport is not part of this crate: implementations of
//! [`PluginApi`] may talk to a message bus, read a local state file or, in
//! tests, answer from memory.

use async_trait::async_trait;
use l3_agent_types::{FipStatus, HaState, RouterDocument, RouterId};
use serde::Serialize;
use std::collections::HashMap;

use crate::error::RpcError;

/// Topic the agent reports itself under.
pub const L3_AGENT_TOPIC: &str = "l3_agent";

/// Binary name reported to the controller.
pub const AGENT_BINARY: &str = "l3-agentd";

/// Agent type reported to the controller.
pub const AGENT_TYPE_L3: &str = "L3 agent";

/// Calls the agent makes on the controller.
#[async_trait]
pub trait PluginApi: Send + Sync {
    /// Fetches router documents; `None` fetches every router of this agent.
    async fn get_routers(
        &self,
        router_ids: Option<&[RouterId]>,
    ) -> Result<Vec<RouterDocument>, RpcError>;

    /// Returns the single external network, or `None` if there is none.
    ///
    /// Fails with a remote `TooManyExternalNetworks` error when several exist.
    async fn get_external_network_id(&self) -> Result<Option<String>, RpcError>;

    /// Reports floating IP statuses of one router.
    async fn update_floatingip_statuses(
        &self,
        router_id: &str,
        statuses: &HashMap<String, FipStatus>,
    ) -> Result<(), RpcError>;

    /// Lists service plugins enabled on the controller.
    async fn get_service_plugin_list(&self) -> Result<Vec<String>, RpcError>;

    /// Reports HA router states in one batch.
    async fn update_ha_routers_states(
        &self,
        states: &HashMap<RouterId, HaState>,
    ) -> Result<(), RpcError>;

    /// Sends a periodic agent state report.
    async fn report_state(&self, report: &AgentStateReport) -> Result<(), RpcError>;
}

/// Per-agent counters and settings included in every state report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AgentConfigurations {
    pub use_namespaces: bool,
    pub router_id: Option<String>,
    pub handle_internal_only_routers: bool,
    pub external_network_bridge: String,
    pub gateway_external_network_id: Option<String>,
    pub interface_driver: String,
    pub agent_mode: String,
    pub routers: usize,
    pub ex_gw_ports: usize,
    pub interfaces: usize,
    pub floating_ips: usize,
}

/// Periodic agent heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentStateReport {
    pub binary: String,
    pub host: String,
    pub topic: String,
    pub agent_type: String,
    /// Set on the first report after startup.
    pub start_flag: bool,
    pub configurations: AgentConfigurations,
}

impl AgentStateReport {
    pub fn new(host: impl Into<String>, configurations: AgentConfigurations) -> Self {
        Self {
            binary: AGENT_BINARY.to_string(),
            host: host.into(),
            topic: L3_AGENT_TOPIC.to_string(),
            agent_type: AGENT_TYPE_L3.to_string(),
            start_flag: false,
            configurations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_report_defaults() {
        let report = AgentStateReport::new("node-1", AgentConfigurations::default());
        assert_eq!(report.binary, "l3-agentd");
        assert_eq!(report.topic, "l3_agent");
        assert_eq!(report.agent_type, "L3 agent");
        assert!(!report.start_flag);
    }
}

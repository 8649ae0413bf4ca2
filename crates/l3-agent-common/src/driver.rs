//! Namespace and interface driver contract.
//!
//! The agent never touches network devices directly; every namespace,
//! link, address and route change goes through a [`NetworkDriver`].
//! Namespace arguments are `None` when the agent runs without namespaces.

use async_trait::async_trait;
use l3_agent_types::Route;

use crate::error::AgentResult;

/// A router port to plug into a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub network_id: String,
    pub port_id: String,
    /// Device name inside the namespace (e.g. `qr-<port>`).
    pub device_name: String,
    pub mac_address: String,
    /// Bridge to attach the port to; `None` lets the driver pick its default.
    pub bridge: Option<String>,
    pub namespace: Option<String>,
}

/// Desired keepalived settings of an HA router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepalivedConfig {
    pub router_id: String,
    pub namespace: Option<String>,
    /// Device of the HA port.
    pub interface: String,
    /// Virtual addresses (CIDR) owned by the master.
    pub vips: Vec<String>,
}

/// One advertised prefix of the router-advertisement daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadvdPrefix {
    pub interface: String,
    pub prefix: String,
}

/// Operations on namespaces, devices, addresses and routes.
#[async_trait]
pub trait NetworkDriver: Send + Sync {
    async fn create_namespace(&self, name: &str) -> AgentResult<()>;

    async fn delete_namespace(&self, name: &str) -> AgentResult<()>;

    async fn list_namespaces(&self) -> AgentResult<Vec<String>>;

    async fn device_exists(&self, device: &str, namespace: Option<&str>) -> AgentResult<bool>;

    /// Creates the device for `port`, attaches it to its bridge and brings
    /// it up inside the namespace.
    async fn plug(&self, port: &PortBinding) -> AgentResult<()>;

    async fn unplug(
        &self,
        device: &str,
        bridge: Option<&str>,
        namespace: Option<&str>,
    ) -> AgentResult<()>;

    async fn add_address(&self, device: &str, cidr: &str, namespace: Option<&str>)
        -> AgentResult<()>;

    async fn delete_address(
        &self,
        device: &str,
        cidr: &str,
        namespace: Option<&str>,
    ) -> AgentResult<()>;

    /// Lists the IPv4 addresses (CIDR) configured on a device.
    async fn list_addresses(&self, device: &str, namespace: Option<&str>)
        -> AgentResult<Vec<String>>;

    async fn replace_route(&self, route: &Route, namespace: Option<&str>) -> AgentResult<()>;

    async fn delete_route(&self, route: &Route, namespace: Option<&str>) -> AgentResult<()>;

    /// Enables IPv4 forwarding in the namespace.
    async fn enable_forwarding(&self, namespace: Option<&str>) -> AgentResult<()>;

    /// Writes the keepalived configuration of an HA router.
    async fn enable_keepalived(&self, config: &KeepalivedConfig) -> AgentResult<()>;

    async fn disable_keepalived(&self, router_id: &str) -> AgentResult<()>;

    /// Writes the router-advertisement configuration; an empty prefix list
    /// disables the daemon.
    async fn configure_radvd(
        &self,
        router_id: &str,
        namespace: Option<&str>,
        prefixes: &[RadvdPrefix],
    ) -> AgentResult<()>;
}

//! Router desired-state documents as delivered by the controller.

use crate::{ParseError, PortForwardRule};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a tenant router (controller-assigned UUID string).
pub type RouterId = String;

/// One fixed IP of a router port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FixedIp {
    pub subnet_id: String,
    pub ip_address: String,
    /// Prefix length of the subnet; host route (/32) when unknown.
    #[serde(default)]
    pub prefixlen: Option<u8>,
}

impl FixedIp {
    pub fn new(subnet_id: impl Into<String>, ip_address: impl Into<String>, prefixlen: u8) -> Self {
        Self {
            subnet_id: subnet_id.into(),
            ip_address: ip_address.into(),
            prefixlen: Some(prefixlen),
        }
    }

    /// Returns the address in CIDR notation.
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.ip_address, self.prefixlen.unwrap_or(32))
    }

    /// Returns true for IPv6 addresses.
    pub fn is_ipv6(&self) -> bool {
        self.ip_address.contains(':')
    }
}

/// A router port: internal interface, external gateway or HA port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouterPort {
    pub id: String,
    #[serde(default)]
    pub network_id: String,
    #[serde(default)]
    pub mac_address: String,
    #[serde(default)]
    pub fixed_ips: Vec<FixedIp>,
}

impl RouterPort {
    pub fn new(id: impl Into<String>, network_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            network_id: network_id.into(),
            mac_address: String::new(),
            fixed_ips: Vec::new(),
        }
    }

    pub fn with_fixed_ip(mut self, fixed_ip: FixedIp) -> Self {
        self.fixed_ips.push(fixed_ip);
        self
    }

    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.mac_address = mac.into();
        self
    }

    /// Returns the first fixed IP address, if any.
    pub fn first_ip(&self) -> Option<&str> {
        self.fixed_ips.first().map(|ip| ip.ip_address.as_str())
    }

    /// Returns true if any fixed IP is IPv6.
    pub fn has_ipv6(&self) -> bool {
        self.fixed_ips.iter().any(FixedIp::is_ipv6)
    }
}

/// A floating IP bound to a fixed (tenant-internal) address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FloatingIp {
    pub id: String,
    pub floating_ip_address: String,
    pub fixed_ip_address: String,
    #[serde(default)]
    pub port_id: Option<String>,
}

impl FloatingIp {
    pub fn new(
        id: impl Into<String>,
        floating_ip_address: impl Into<String>,
        fixed_ip_address: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            floating_ip_address: floating_ip_address.into(),
            fixed_ip_address: fixed_ip_address.into(),
            port_id: None,
        }
    }
}

/// Operational status of a floating IP as reported to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FipStatus {
    Active,
    Down,
    Error,
}

impl fmt::Display for FipStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FipStatus::Active => "ACTIVE",
            FipStatus::Down => "DOWN",
            FipStatus::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for FipStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ACTIVE" => Ok(FipStatus::Active),
            "DOWN" => Ok(FipStatus::Down),
            "ERROR" => Ok(FipStatus::Error),
            _ => Err(ParseError::InvalidFipStatus(s.to_string())),
        }
    }
}

/// A static route installed in the router namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Route {
    pub destination: String,
    pub nexthop: String,
}

impl Route {
    pub fn new(destination: impl Into<String>, nexthop: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            nexthop: nexthop.into(),
        }
    }
}

/// External gateway settings of a router.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayInfo {
    #[serde(default)]
    pub network_id: Option<String>,
    #[serde(default)]
    pub enable_snat: Option<bool>,
}

/// State of an HA router as reported by keepalived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HaState {
    /// Router is master and owns the virtual addresses.
    Master,
    /// Router is standing by.
    Backup,
    /// keepalived reported a fault.
    Fault,
}

impl HaState {
    /// Returns the state name as reported to the controller ("active"/"standby").
    pub const fn as_controller_str(&self) -> &'static str {
        match self {
            HaState::Master => "active",
            HaState::Backup | HaState::Fault => "standby",
        }
    }
}

impl fmt::Display for HaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HaState::Master => "master",
            HaState::Backup => "backup",
            HaState::Fault => "fault",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for HaState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "master" => Ok(HaState::Master),
            "backup" => Ok(HaState::Backup),
            "fault" => Ok(HaState::Fault),
            _ => Err(ParseError::InvalidHaState(s.to_string())),
        }
    }
}

/// The full desired state of one router.
///
/// Collection fields use the controller's sync-data key names
/// (`_interfaces`, `_floatingips`, ...). `portforwardings` is `None` when the
/// port-forwarding capability is not enabled on the controller, which is
/// distinct from an empty rule list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterDocument {
    pub id: RouterId,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub distributed: Option<bool>,
    #[serde(default)]
    pub ha: bool,
    #[serde(default)]
    pub external_gateway_info: Option<GatewayInfo>,
    #[serde(default)]
    pub gw_port: Option<RouterPort>,
    #[serde(default)]
    pub enable_snat: Option<bool>,
    #[serde(default, rename = "_interfaces")]
    pub interfaces: Vec<RouterPort>,
    #[serde(default, rename = "_floatingips")]
    pub floating_ips: Vec<FloatingIp>,
    #[serde(default, rename = "_snat_router_interfaces")]
    pub snat_ports: Vec<RouterPort>,
    #[serde(default, rename = "_ha_interface")]
    pub ha_port: Option<RouterPort>,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub portforwardings: Option<Vec<PortForwardRule>>,
}

impl RouterDocument {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Returns the id of the external network the gateway is attached to.
    pub fn external_network_id(&self) -> Option<&str> {
        self.external_gateway_info
            .as_ref()
            .and_then(|info| info.network_id.as_deref())
    }

    /// Returns true for distributed routers; an absent flag means legacy.
    pub fn is_distributed(&self) -> bool {
        self.distributed.unwrap_or(false)
    }

    /// Returns the effective SNAT flag (defaults to enabled).
    pub fn snat_enabled(&self) -> bool {
        self.enable_snat
            .or_else(|| {
                self.external_gateway_info
                    .as_ref()
                    .and_then(|info| info.enable_snat)
            })
            .unwrap_or(true)
    }

    /// Returns true if the port-forwarding capability is declared.
    pub fn has_portforwarding(&self) -> bool {
        self.portforwardings.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_fixed_ip_cidr() {
        let ip = FixedIp::new("subnet-1", "10.0.0.1", 24);
        assert_eq!(ip.cidr(), "10.0.0.1/24");
        assert!(!ip.is_ipv6());

        let host = FixedIp {
            subnet_id: "subnet-2".to_string(),
            ip_address: "172.24.4.10".to_string(),
            prefixlen: None,
        };
        assert_eq!(host.cidr(), "172.24.4.10/32");
    }

    #[test]
    fn test_router_port_first_ip() {
        let port = RouterPort::new("gw", "ext-net")
            .with_fixed_ip(FixedIp::new("s1", "172.24.4.2", 24))
            .with_fixed_ip(FixedIp::new("s2", "2001:db8::2", 64));
        assert_eq!(port.first_ip(), Some("172.24.4.2"));
        assert!(port.has_ipv6());
        assert_eq!(RouterPort::new("empty", "net").first_ip(), None);
    }

    #[test]
    fn test_document_defaults() {
        let doc = RouterDocument::new("r1");
        assert!(!doc.is_distributed());
        assert!(!doc.ha);
        assert!(doc.snat_enabled());
        assert!(!doc.has_portforwarding());
        assert_eq!(doc.external_network_id(), None);
    }

    #[test]
    fn test_snat_flag_from_gateway_info() {
        let mut doc = RouterDocument::new("r1");
        doc.external_gateway_info = Some(GatewayInfo {
            network_id: Some("ext".to_string()),
            enable_snat: Some(false),
        });
        assert!(!doc.snat_enabled());
        assert_eq!(doc.external_network_id(), Some("ext"));

        doc.enable_snat = Some(true);
        assert!(doc.snat_enabled());
    }

    #[test]
    fn test_document_deserialize_sync_keys() {
        let json = r#"{
            "id": "r1",
            "ha": true,
            "gw_port": {"id": "gw", "network_id": "ext",
                        "fixed_ips": [{"subnet_id": "s", "ip_address": "172.24.4.2", "prefixlen": 24}]},
            "_interfaces": [{"id": "p1", "network_id": "n1"}],
            "_floatingips": [{"id": "f1", "floating_ip_address": "172.24.4.9",
                              "fixed_ip_address": "10.0.0.5"}],
            "portforwardings": []
        }"#;
        let doc: RouterDocument = serde_json::from_str(json).unwrap();
        assert_eq!(doc.id, "r1");
        assert!(doc.ha);
        assert_eq!(doc.distributed, None);
        assert_eq!(doc.interfaces.len(), 1);
        assert_eq!(doc.floating_ips[0].fixed_ip_address, "10.0.0.5");
        assert_eq!(doc.gw_port.as_ref().and_then(|p| p.first_ip()), Some("172.24.4.2"));
        assert_eq!(doc.portforwardings, Some(vec![]));
    }

    #[test]
    fn test_ha_state_parse_and_display() {
        assert_eq!("MASTER".parse::<HaState>().unwrap(), HaState::Master);
        assert_eq!(HaState::Backup.to_string(), "backup");
        assert_eq!(HaState::Master.as_controller_str(), "active");
        assert_eq!(HaState::Fault.as_controller_str(), "standby");
        assert!("primary".parse::<HaState>().is_err());
    }

    #[test]
    fn test_fip_status_serde() {
        let json = serde_json::to_string(&FipStatus::Active).unwrap();
        assert_eq!(json, "\"ACTIVE\"");
        assert_eq!("down".parse::<FipStatus>().unwrap(), FipStatus::Down);
    }
}

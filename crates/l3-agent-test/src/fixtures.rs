//! Router document fixtures
//!
//! Provides reusable router shapes for agent tests

use l3_agent_types::{
    FixedIp, FloatingIp, GatewayInfo, PortForwardRule, Protocol, Route, RouterDocument, RouterPort,
};

/// External network every fixture gateway is attached to
pub const EXT_NET_ID: &str = "ext-net";

/// Default gateway address of fixture routers
pub const GATEWAY_IP: &str = "172.24.4.2";

/// Builder for router documents
#[derive(Debug, Clone)]
pub struct RouterBuilder {
    doc: RouterDocument,
}

impl RouterBuilder {
    /// Create a legacy router with no ports
    pub fn new(id: impl Into<String>) -> Self {
        let mut doc = RouterDocument::new(id);
        doc.tenant_id = "tenant-1".to_string();
        Self { doc }
    }

    /// Attach an external gateway on [`EXT_NET_ID`] with the given address
    pub fn with_gateway(self, ip: &str) -> Self {
        self.with_gateway_on(EXT_NET_ID, ip)
    }

    /// Attach an external gateway on a specific network
    pub fn with_gateway_on(mut self, network_id: &str, ip: &str) -> Self {
        let port_id = format!("gw-{}", self.doc.id);
        self.doc.external_gateway_info = Some(GatewayInfo {
            network_id: Some(network_id.to_string()),
            enable_snat: None,
        });
        self.doc.gw_port = Some(
            RouterPort::new(port_id, network_id)
                .with_mac("fa:16:3e:00:00:01")
                .with_fixed_ip(FixedIp::new(format!("{}-subnet", network_id), ip, 24)),
        );
        self
    }

    /// Add an internal interface with a /24 address
    pub fn with_interface(mut self, port_id: &str, network_id: &str, ip: &str) -> Self {
        self.doc.interfaces.push(
            RouterPort::new(port_id, network_id)
                .with_mac("fa:16:3e:00:00:02")
                .with_fixed_ip(FixedIp::new(format!("{}-subnet", network_id), ip, 24)),
        );
        self
    }

    /// Add a floating IP
    pub fn with_floating_ip(mut self, id: &str, floating_ip: &str, fixed_ip: &str) -> Self {
        self.doc
            .floating_ips
            .push(FloatingIp::new(id, floating_ip, fixed_ip));
        self
    }

    /// Declare the port-forwarding capability with no rules
    pub fn with_portforwarding(mut self) -> Self {
        self.doc.portforwardings.get_or_insert_with(Vec::new);
        self
    }

    /// Add a port-forwarding rule (declares the capability)
    pub fn with_port_forward(mut self, rule: PortForwardRule) -> Self {
        self.doc.portforwardings.get_or_insert_with(Vec::new).push(rule);
        self
    }

    /// Add an extra route
    pub fn with_route(mut self, destination: &str, nexthop: &str) -> Self {
        self.doc.routes.push(Route::new(destination, nexthop));
        self
    }

    /// Mark the router as highly available, with an HA port
    pub fn ha(mut self) -> Self {
        self.doc.ha = true;
        let port_id = format!("ha-{}", self.doc.id);
        self.doc.ha_port = Some(
            RouterPort::new(port_id, "ha-net")
                .with_fixed_ip(FixedIp::new("ha-subnet", "169.254.192.1", 18)),
        );
        self
    }

    /// Mark the router as distributed
    pub fn distributed(mut self) -> Self {
        self.doc.distributed = Some(true);
        self
    }

    /// Set the SNAT flag
    pub fn with_snat(mut self, enabled: bool) -> Self {
        self.doc.enable_snat = Some(enabled);
        self
    }

    pub fn build(self) -> RouterDocument {
        self.doc
    }
}

/// Legacy router with a gateway, one internal network and port forwarding
pub fn legacy_router(id: &str) -> RouterDocument {
    RouterBuilder::new(id)
        .with_gateway(GATEWAY_IP)
        .with_interface(&format!("{}-p1", id), "net-1", "10.0.0.1")
        .with_portforwarding()
        .build()
}

/// Router with internal interfaces only
pub fn internal_only_router(id: &str) -> RouterDocument {
    RouterBuilder::new(id)
        .with_interface(&format!("{}-p1", id), "net-1", "10.0.0.1")
        .build()
}

/// HA router with a gateway
pub fn ha_router(id: &str) -> RouterDocument {
    RouterBuilder::new(id)
        .with_gateway(GATEWAY_IP)
        .with_interface(&format!("{}-p1", id), "net-1", "10.0.0.1")
        .ha()
        .build()
}

/// Distributed router with a gateway
pub fn dvr_router(id: &str) -> RouterDocument {
    RouterBuilder::new(id)
        .with_gateway(GATEWAY_IP)
        .with_interface(&format!("{}-p1", id), "net-1", "10.0.0.1")
        .distributed()
        .build()
}

/// Invalid distributed + HA router
pub fn dvr_ha_router(id: &str) -> RouterDocument {
    RouterBuilder::new(id)
        .with_gateway(GATEWAY_IP)
        .distributed()
        .ha()
        .build()
}

/// TCP port-forwarding rule
pub fn tcp_forward(outside_port: u16, inside_addr: &str, inside_port: u16) -> PortForwardRule {
    PortForwardRule::new(Protocol::Tcp, outside_port, inside_addr, inside_port)
}

/// UDP port-forwarding rule
pub fn udp_forward(outside_port: u16, inside_addr: &str, inside_port: u16) -> PortForwardRule {
    PortForwardRule::new(Protocol::Udp, outside_port, inside_addr, inside_port)
}

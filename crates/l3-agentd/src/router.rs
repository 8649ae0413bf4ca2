//! Runtime state of one router and its reconciliation pass.
//!
//! A [`RouterInfo`] owns everything the agent has applied for a router: the
//! ports it plugged, the NAT table of its namespace, the routes and
//! port-forwarding rules it installed. Each pass compares the stored desired
//! document against that applied state and converges the difference.
//!
//! The router kind is fixed when the runtime state is built
//! ([`RouterVariant::select`]) and never changes afterwards; a router that
//! changes kind upstream is removed and created again by the controller.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use l3_agent_common::{
    AgentError, AgentResult, CommandExecutor, IptablesManager, KeepalivedConfig, NetworkDriver,
    PluginApi, PortBinding, RadvdPrefix,
};
use l3_agent_types::{
    FipStatus, FloatingIp, PortForwardRule, Route, RouterDocument, RouterId, RouterPort,
};
use tracing::{debug, info, instrument};

use crate::commands::{ha_device_name, internal_device_name, router_ns_name};
use crate::config::AgentConfig;
use crate::diff::{diff_by_key, diff_unordered};
use crate::dvr::FipNamespaces;
use crate::external::update_fip_statuses;

/// Collaborators a reconciliation pass needs.
#[derive(Clone, Copy)]
pub struct ProcessContext<'a> {
    pub conf: &'a AgentConfig,
    pub driver: &'a dyn NetworkDriver,
    pub plugin_rpc: &'a dyn PluginApi,
    pub fip_namespaces: &'a FipNamespaces,
}

/// HA bookkeeping of a router.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HaRouterState {
    /// Registered with the HA state reporter.
    pub monitoring: bool,
    /// Last keepalived configuration written.
    pub keepalived: Option<KeepalivedConfig>,
}

/// Distributed-router bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DvrRouterState {
    /// Floating IP namespace the router is attached to.
    pub fip_ns: Option<String>,
    pub ext_net_id: Option<String>,
    /// Floating IP addresses on the router's link into the fip namespace;
    /// `None` until scanned.
    pub dist_fip_count: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterKind {
    Legacy,
    Ha,
    Distributed,
}

impl fmt::Display for RouterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RouterKind::Legacy => "legacy",
            RouterKind::Ha => "ha",
            RouterKind::Distributed => "distributed",
        })
    }
}

/// Behavior variant of a router
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterVariant {
    Legacy,
    Ha(HaRouterState),
    Distributed(DvrRouterState),
}

impl RouterVariant {
    /// Picks the variant from the document flags.
    pub fn select(router: &RouterDocument) -> AgentResult<Self> {
        match (router.is_distributed(), router.ha) {
            (true, true) => Err(AgentError::dvr_ha_not_supported(&router.id)),
            (true, false) => Ok(RouterVariant::Distributed(DvrRouterState::default())),
            (false, true) => Ok(RouterVariant::Ha(HaRouterState::default())),
            (false, false) => Ok(RouterVariant::Legacy),
        }
    }

    pub fn kind(&self) -> RouterKind {
        match self {
            RouterVariant::Legacy => RouterKind::Legacy,
            RouterVariant::Ha(_) => RouterKind::Ha,
            RouterVariant::Distributed(_) => RouterKind::Distributed,
        }
    }

    pub fn is_ha(&self) -> bool {
        matches!(self, RouterVariant::Ha(_))
    }

    pub fn is_distributed(&self) -> bool {
        matches!(self, RouterVariant::Distributed(_))
    }
}

/// Handle on the router-advertisement daemon of one router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadvdHandle {
    router_id: RouterId,
    namespace: Option<String>,
    prefixes: Vec<RadvdPrefix>,
}

impl RadvdHandle {
    pub fn new(router_id: impl Into<RouterId>, namespace: Option<String>) -> Self {
        Self {
            router_id: router_id.into(),
            namespace,
            prefixes: Vec::new(),
        }
    }

    pub fn prefixes(&self) -> &[RadvdPrefix] {
        &self.prefixes
    }

    pub fn is_enabled(&self) -> bool {
        !self.prefixes.is_empty()
    }

    /// Advertises `prefixes`; only talks to the driver when they changed.
    pub async fn update(
        &mut self,
        driver: &dyn NetworkDriver,
        prefixes: Vec<RadvdPrefix>,
    ) -> AgentResult<()> {
        if prefixes == self.prefixes {
            return Ok(());
        }
        driver
            .configure_radvd(&self.router_id, self.namespace.as_deref(), &prefixes)
            .await?;
        self.prefixes = prefixes;
        Ok(())
    }

    pub async fn disable(&mut self, driver: &dyn NetworkDriver) -> AgentResult<()> {
        self.update(driver, Vec::new()).await
    }
}

/// Everything applied for one router
#[derive(Debug)]
pub struct RouterInfo {
    pub router_id: RouterId,
    /// Desired state as last received.
    pub router: RouterDocument,
    pub ns_name: Option<String>,
    pub iptables: IptablesManager,
    pub radvd: RadvdHandle,
    pub variant: RouterVariant,
    pub internal_ports: Vec<RouterPort>,
    pub ex_gw_port: Option<RouterPort>,
    pub snat_ports: Vec<RouterPort>,
    pub enable_snat: bool,
    /// Floating IPs currently applied.
    pub floating_ips: Vec<FloatingIp>,
    pub routes: Vec<Route>,
    /// Port-forwarding rules currently applied.
    pub portforwardings: Vec<PortForwardRule>,
}

impl RouterInfo {
    /// Builds the runtime state; distributed HA routers are rejected.
    pub fn new(
        router: RouterDocument,
        use_namespaces: bool,
        executor: Arc<dyn CommandExecutor>,
    ) -> AgentResult<Self> {
        let variant = RouterVariant::select(&router)?;
        let router_id = router.id.clone();
        let ns_name = use_namespaces.then(|| router_ns_name(&router_id));
        Ok(Self {
            iptables: IptablesManager::new(ns_name.clone(), executor),
            radvd: RadvdHandle::new(router_id.clone(), ns_name.clone()),
            router_id,
            router,
            ns_name,
            variant,
            internal_ports: Vec::new(),
            ex_gw_port: None,
            snat_ports: Vec::new(),
            enable_snat: true,
            floating_ips: Vec::new(),
            routes: Vec::new(),
            portforwardings: Vec::new(),
        })
    }

    pub fn ns(&self) -> Option<&str> {
        self.ns_name.as_deref()
    }

    pub fn is_ha(&self) -> bool {
        self.variant.is_ha()
    }

    /// Sets up the namespace (and the HA port for HA routers).
    #[instrument(skip(self, ctx), fields(router_id = %self.router_id))]
    pub async fn create(&mut self, ctx: &ProcessContext<'_>) -> AgentResult<()> {
        if let Some(ns) = self.ns_name.clone() {
            ctx.driver.create_namespace(&ns).await?;
        }
        ctx.driver.enable_forwarding(self.ns()).await?;

        if let (RouterVariant::Ha(_), Some(ha_port)) = (&self.variant, &self.router.ha_port) {
            let device = ha_device_name(&ha_port.id);
            ctx.driver
                .plug(&PortBinding {
                    network_id: ha_port.network_id.clone(),
                    port_id: ha_port.id.clone(),
                    device_name: device.clone(),
                    mac_address: ha_port.mac_address.clone(),
                    bridge: None,
                    namespace: self.ns_name.clone(),
                })
                .await?;
            for ip in &ha_port.fixed_ips {
                ctx.driver.add_address(&device, &ip.cidr(), self.ns()).await?;
            }
        }
        info!(kind = %self.variant.kind(), "Router created");
        Ok(())
    }

    /// Tears down what [`RouterInfo::create`] set up.
    #[instrument(skip(self, ctx), fields(router_id = %self.router_id))]
    pub async fn delete(&mut self, ctx: &ProcessContext<'_>) -> AgentResult<()> {
        self.ha_teardown(ctx.driver).await?;
        self.radvd.disable(ctx.driver).await?;
        if let Some(ns) = self.ns_name.clone() {
            ctx.driver.delete_namespace(&ns).await?;
        }
        info!("Router deleted");
        Ok(())
    }

    /// Clears every desired field so the next pass retracts everything.
    pub fn clear_desired_state(&mut self) {
        self.router.gw_port = None;
        self.router.interfaces.clear();
        self.router.floating_ips.clear();
        self.router.routes.clear();
        self.router.snat_ports.clear();
    }

    /// Converges the applied state towards the stored desired document.
    #[instrument(skip(self, ctx), fields(router_id = %self.router_id))]
    pub async fn process(&mut self, ctx: &ProcessContext<'_>) -> AgentResult<()> {
        if self.router.distributed.is_none() {
            self.router.distributed = Some(false);
        }
        let ex_gw_port = self.router.gw_port.clone();

        if self.variant.is_distributed() {
            match ex_gw_port.as_ref() {
                Some(gw) => {
                    self.attach_fip_namespace(ctx, &gw.network_id).await?;
                    self.scan_fip_ports(ctx.driver).await?;
                }
                None => self.detach_fip_namespace(ctx).await?,
            }
        }

        self.process_internal_ports(ctx).await?;

        let existing_fips: Vec<String> =
            self.floating_ips.iter().map(|fip| fip.id.clone()).collect();
        let statuses = match self.process_external(ctx, ex_gw_port.as_ref()).await {
            Ok(statuses) => statuses,
            Err(e) => {
                let failed: HashMap<String, FipStatus> = self
                    .router
                    .floating_ips
                    .iter()
                    .map(|fip| (fip.id.clone(), FipStatus::Error))
                    .collect();
                update_fip_statuses(ctx.plugin_rpc, &self.router_id, &existing_fips, failed)
                    .await?;
                return Err(e);
            }
        };
        update_fip_statuses(ctx.plugin_rpc, &self.router_id, &existing_fips, statuses).await?;

        self.routes_updated(ctx.driver).await?;
        self.process_router_portforwardings(ex_gw_port.as_ref()).await?;
        self.enable_ha_monitoring(ctx.driver).await?;

        self.ex_gw_port = ex_gw_port;
        self.snat_ports = self.router.snat_ports.clone();
        self.enable_snat = self.router.snat_enabled();
        debug!("Router processed");
        Ok(())
    }

    async fn process_internal_ports(&mut self, ctx: &ProcessContext<'_>) -> AgentResult<()> {
        let desired = self.router.interfaces.clone();
        let diff = diff_by_key(&self.internal_ports, &desired, |port| port.id.clone());

        for port in diff.adds {
            self.internal_network_added(ctx, &port).await?;
            self.internal_ports.push(port);
        }
        for port in diff.removes {
            let device = internal_device_name(&port.id);
            ctx.driver.unplug(&device, None, self.ns()).await?;
            self.internal_ports.retain(|p| p.id != port.id);
            info!(port_id = %port.id, "Internal network removed");
        }
        for (old, new) in diff.changed {
            if !self.is_ha() {
                let device = internal_device_name(&new.id);
                let old_cidrs: Vec<String> = old.fixed_ips.iter().map(|ip| ip.cidr()).collect();
                let new_cidrs: Vec<String> = new.fixed_ips.iter().map(|ip| ip.cidr()).collect();
                let cidrs = diff_unordered(&old_cidrs, &new_cidrs);
                for cidr in &cidrs.removes {
                    ctx.driver.delete_address(&device, cidr, self.ns()).await?;
                }
                for cidr in &cidrs.adds {
                    ctx.driver.add_address(&device, cidr, self.ns()).await?;
                }
            }
            if let Some(slot) = self.internal_ports.iter_mut().find(|p| p.id == new.id) {
                *slot = new;
            }
        }

        let prefixes = self
            .internal_ports
            .iter()
            .flat_map(|port| {
                let device = internal_device_name(&port.id);
                port.fixed_ips
                    .iter()
                    .filter(|ip| ip.is_ipv6())
                    .map(move |ip| RadvdPrefix {
                        interface: device.clone(),
                        prefix: ip.cidr(),
                    })
            })
            .collect();
        self.radvd.update(ctx.driver, prefixes).await
    }

    async fn internal_network_added(
        &self,
        ctx: &ProcessContext<'_>,
        port: &RouterPort,
    ) -> AgentResult<()> {
        let device = internal_device_name(&port.id);
        ctx.driver
            .plug(&PortBinding {
                network_id: port.network_id.clone(),
                port_id: port.id.clone(),
                device_name: device.clone(),
                mac_address: port.mac_address.clone(),
                bridge: None,
                namespace: self.ns_name.clone(),
            })
            .await?;
        if !self.is_ha() {
            for ip in &port.fixed_ips {
                ctx.driver.add_address(&device, &ip.cidr(), self.ns()).await?;
            }
        }
        info!(port_id = %port.id, device = %device, "Internal network added");
        Ok(())
    }

    /// Applies the extra-route changes.
    pub async fn routes_updated(&mut self, driver: &dyn NetworkDriver) -> AgentResult<()> {
        let desired = self.router.routes.clone();
        let diff = diff_unordered(&self.routes, &desired);
        for route in &diff.removes {
            debug!(destination = %route.destination, "Removing extra route");
            driver.delete_route(route, self.ns()).await?;
        }
        for route in &diff.adds {
            debug!(destination = %route.destination, "Adding extra route");
            driver.replace_route(route, self.ns()).await?;
        }
        self.routes = desired;
        Ok(())
    }

    /// Virtual addresses keepalived moves to the master.
    fn ha_vips(&self) -> Vec<String> {
        let mut vips: Vec<String> = Vec::new();
        if let Some(gw) = &self.router.gw_port {
            vips.extend(gw.fixed_ips.iter().map(|ip| ip.cidr()));
        }
        for port in &self.internal_ports {
            vips.extend(port.fixed_ips.iter().map(|ip| ip.cidr()));
        }
        vips.extend(
            self.floating_ips
                .iter()
                .map(|fip| format!("{}/32", fip.floating_ip_address)),
        );
        vips
    }

    /// Enables keepalived for monitored HA routers; no-op for the other
    /// variants.
    pub async fn enable_ha_monitoring(&mut self, driver: &dyn NetworkDriver) -> AgentResult<()> {
        let Some(ha_port) = self.router.ha_port.as_ref() else {
            return Ok(());
        };
        if !self.is_ha() {
            return Ok(());
        }
        let config = KeepalivedConfig {
            router_id: self.router_id.clone(),
            namespace: self.ns_name.clone(),
            interface: ha_device_name(&ha_port.id),
            vips: self.ha_vips(),
        };
        if let RouterVariant::Ha(state) = &mut self.variant {
            if state.monitoring && state.keepalived.as_ref() != Some(&config) {
                driver.enable_keepalived(&config).await?;
                debug!(vips = config.vips.len(), "Keepalived configured");
                state.keepalived = Some(config);
            }
        }
        Ok(())
    }

    /// Stops keepalived of an HA router; no-op for the other variants.
    pub async fn ha_teardown(&mut self, driver: &dyn NetworkDriver) -> AgentResult<()> {
        if let RouterVariant::Ha(state) = &mut self.variant {
            if state.keepalived.take().is_some() {
                driver.disable_keepalived(&self.router_id).await?;
            }
            state.monitoring = false;
        }
        Ok(())
    }

    /// Counts used by the agent state report, taken from the desired
    /// document: (gateway ports, interfaces, floating IPs).
    pub fn report_counts(&self) -> (usize, usize, usize) {
        (
            usize::from(self.router.gw_port.is_some()),
            self.router.interfaces.len(),
            self.router.floating_ips.len(),
        )
    }
}

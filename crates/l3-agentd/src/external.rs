//! External gateway, SNAT and floating IPs of a router.

use std::collections::HashMap;

use l3_agent_common::iptables::{TAG_FLOATING_IP, TAG_SNAT};
use l3_agent_common::{AgentResult, PluginApi, PortBinding};
use l3_agent_types::{FipStatus, FloatingIp, RouterPort};
use tracing::{debug, info, warn};

use crate::commands::{
    external_device_name, external_gateway_nat_rules, floating_forward_rules, rtr_fip_device_name,
};
use crate::config::AgentMode;
use crate::diff::diff_unordered;
use crate::router::{ProcessContext, RouterInfo, RouterVariant};

/// Final status map for a router's floating IPs.
///
/// Every id in `existing` missing from `statuses` is reported DOWN.
pub fn compute_fip_statuses(
    existing: &[String],
    mut statuses: HashMap<String, FipStatus>,
) -> HashMap<String, FipStatus> {
    for fip_id in existing {
        statuses
            .entry(fip_id.clone())
            .or_insert(FipStatus::Down);
    }
    statuses
}

/// Sends the floating IP statuses of a router, if there is anything to say.
pub async fn update_fip_statuses(
    plugin_rpc: &dyn PluginApi,
    router_id: &str,
    existing: &[String],
    statuses: HashMap<String, FipStatus>,
) -> AgentResult<()> {
    let statuses = compute_fip_statuses(existing, statuses);
    if statuses.is_empty() {
        return Ok(());
    }
    debug!(router_id, count = statuses.len(), "Updating floating IP statuses");
    plugin_rpc
        .update_floatingip_statuses(router_id, &statuses)
        .await?;
    Ok(())
}

/// Where a floating IP address lives for a router variant.
enum FipDevice {
    Gateway(String),
    RouterToFip(String),
    /// Handled by keepalived.
    Virtual,
}

impl RouterInfo {
    /// Whether this agent terminates the router's gateway.
    fn serves_gateway(&self, agent_mode: AgentMode) -> bool {
        !self.variant.is_distributed() || agent_mode == AgentMode::DvrSnat
    }

    fn fip_device(&self, ex_gw_port: &RouterPort) -> FipDevice {
        match self.variant {
            RouterVariant::Legacy => FipDevice::Gateway(external_device_name(&ex_gw_port.id)),
            RouterVariant::Distributed(_) => {
                FipDevice::RouterToFip(rtr_fip_device_name(&self.router_id))
            }
            RouterVariant::Ha(_) => FipDevice::Virtual,
        }
    }

    /// Processes the gateway port, SNAT and floating IPs, then commits the
    /// NAT table.
    ///
    /// Returns the status of every desired floating IP.
    pub async fn process_external(
        &mut self,
        ctx: &ProcessContext<'_>,
        ex_gw_port: Option<&RouterPort>,
    ) -> AgentResult<HashMap<String, FipStatus>> {
        let serve_gateway = self.serves_gateway(ctx.conf.agent_mode);
        self.process_gateway(ctx, ex_gw_port.filter(|_| serve_gateway))
            .await?;
        self.process_snat_rules(ex_gw_port.filter(|_| serve_gateway))?;
        let statuses = self.process_floating_ips(ctx, ex_gw_port).await?;
        self.iptables.apply().await?;
        Ok(statuses)
    }

    async fn process_gateway(
        &mut self,
        ctx: &ProcessContext<'_>,
        ex_gw_port: Option<&RouterPort>,
    ) -> AgentResult<()> {
        let old = self
            .ex_gw_port
            .clone()
            .filter(|_| self.serves_gateway(ctx.conf.agent_mode));
        let bridge = ctx.conf.external_bridge().map(str::to_string);

        if let Some(old) = old.as_ref() {
            if ex_gw_port.map(|p| p.id.as_str()) != Some(old.id.as_str()) {
                let device = external_device_name(&old.id);
                ctx.driver
                    .unplug(&device, bridge.as_deref(), self.ns())
                    .await?;
                info!(router_id = %self.router_id, device = %device, "External gateway removed");
            }
        }

        let Some(gw) = ex_gw_port else {
            return Ok(());
        };
        let device = external_device_name(&gw.id);
        let same_port = old.as_ref().is_some_and(|o| o.id == gw.id);
        if !same_port {
            ctx.driver
                .plug(&PortBinding {
                    network_id: gw.network_id.clone(),
                    port_id: gw.id.clone(),
                    device_name: device.clone(),
                    mac_address: gw.mac_address.clone(),
                    bridge,
                    namespace: self.ns_name.clone(),
                })
                .await?;
            info!(router_id = %self.router_id, device = %device, "External gateway added");
        }
        if self.is_ha() {
            return Ok(());
        }

        let old_cidrs: Vec<String> = match old.as_ref() {
            Some(o) if same_port => o.fixed_ips.iter().map(|ip| ip.cidr()).collect(),
            _ => Vec::new(),
        };
        let new_cidrs: Vec<String> = gw.fixed_ips.iter().map(|ip| ip.cidr()).collect();
        let cidrs = diff_unordered(&old_cidrs, &new_cidrs);
        for cidr in &cidrs.removes {
            ctx.driver.delete_address(&device, cidr, self.ns()).await?;
        }
        for cidr in &cidrs.adds {
            ctx.driver.add_address(&device, cidr, self.ns()).await?;
        }
        Ok(())
    }

    fn process_snat_rules(&mut self, ex_gw_port: Option<&RouterPort>) -> AgentResult<()> {
        let desired: Vec<(String, String)> = match ex_gw_port {
            Some(gw) if self.router.snat_enabled() => match gw.first_ip() {
                Some(ip) => external_gateway_nat_rules(ip, &external_device_name(&gw.id))
                    .into_iter()
                    .map(|(chain, rule)| (chain.to_string(), rule))
                    .collect(),
                None => Vec::new(),
            },
            _ => Vec::new(),
        };
        let current: Vec<(String, String)> = self
            .iptables
            .rules_by_tag(TAG_SNAT)
            .map(|r| (r.chain.clone(), r.rule.clone()))
            .collect();

        let diff = diff_unordered(&current, &desired);
        for (chain, rule) in &diff.removes {
            self.iptables.remove_rule(chain, rule, TAG_SNAT);
        }
        for (chain, rule) in diff.adds {
            self.iptables.add_rule(&chain, rule, TAG_SNAT)?;
        }
        Ok(())
    }

    async fn process_floating_ips(
        &mut self,
        ctx: &ProcessContext<'_>,
        ex_gw_port: Option<&RouterPort>,
    ) -> AgentResult<HashMap<String, FipStatus>> {
        let desired: Vec<FloatingIp> = match ex_gw_port {
            Some(_) => self.router.floating_ips.clone(),
            None => Vec::new(),
        };
        let device = ex_gw_port.map(|gw| self.fip_device(gw));
        let diff = diff_unordered(&self.floating_ips, &desired);

        for fip in &diff.removes {
            for (chain, rule) in floating_forward_rules(&fip.floating_ip_address, &fip.fixed_ip_address)
            {
                self.iptables.remove_rule(chain, &rule, TAG_FLOATING_IP);
            }
            // Without a gateway the device is already gone with its addresses.
            if let Some(device) = device.as_ref() {
                self.remove_floating_ip_address(ctx, device, fip).await?;
            }
            if let Some(pos) = self.floating_ips.iter().position(|f| f == fip) {
                self.floating_ips.remove(pos);
            }
            info!(router_id = %self.router_id, fip = %fip.floating_ip_address, "Floating IP removed");
        }

        let mut statuses = HashMap::new();
        for fip in &diff.adds {
            if let Some(device) = device.as_ref() {
                if let Err(e) = self.add_floating_ip_address(ctx, device, fip).await {
                    warn!(
                        router_id = %self.router_id,
                        fip = %fip.floating_ip_address,
                        error = %e,
                        "Unable to configure floating IP"
                    );
                    statuses.insert(fip.id.clone(), FipStatus::Error);
                    continue;
                }
            }
            for (chain, rule) in floating_forward_rules(&fip.floating_ip_address, &fip.fixed_ip_address)
            {
                self.iptables.add_rule(chain, rule, TAG_FLOATING_IP)?;
            }
            self.floating_ips.push(fip.clone());
            info!(router_id = %self.router_id, fip = %fip.floating_ip_address, "Floating IP added");
        }

        for fip in &desired {
            statuses.entry(fip.id.clone()).or_insert(FipStatus::Active);
        }
        Ok(statuses)
    }

    async fn add_floating_ip_address(
        &mut self,
        ctx: &ProcessContext<'_>,
        device: &FipDevice,
        fip: &FloatingIp,
    ) -> AgentResult<()> {
        let cidr = format!("{}/32", fip.floating_ip_address);
        match device {
            FipDevice::Gateway(dev) => ctx.driver.add_address(dev, &cidr, self.ns()).await,
            FipDevice::RouterToFip(dev) => {
                ctx.driver.add_address(dev, &cidr, self.ns()).await?;
                if let RouterVariant::Distributed(dvr) = &mut self.variant {
                    dvr.dist_fip_count = Some(dvr.dist_fip_count.unwrap_or(0) + 1);
                }
                Ok(())
            }
            FipDevice::Virtual => Ok(()),
        }
    }

    async fn remove_floating_ip_address(
        &mut self,
        ctx: &ProcessContext<'_>,
        device: &FipDevice,
        fip: &FloatingIp,
    ) -> AgentResult<()> {
        let cidr = format!("{}/32", fip.floating_ip_address);
        match device {
            FipDevice::Gateway(dev) => ctx.driver.delete_address(dev, &cidr, self.ns()).await,
            FipDevice::RouterToFip(dev) => {
                ctx.driver.delete_address(dev, &cidr, self.ns()).await?;
                if let RouterVariant::Distributed(dvr) = &mut self.variant {
                    dvr.dist_fip_count = dvr.dist_fip_count.map(|n| n.saturating_sub(1));
                }
                Ok(())
            }
            FipDevice::Virtual => Ok(()),
        }
    }
}

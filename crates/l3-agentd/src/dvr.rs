//! Floating IP namespaces of distributed routers.
//!
//! Distributed routers reach their external network through one shared
//! `fip-<net>` namespace per external network. The namespace is created when
//! the first router needs it and deleted when the last one leaves.

use std::collections::{BTreeSet, HashMap};

use l3_agent_common::{AgentResult, NetworkDriver, PortBinding};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::commands::{fip_ns_name, rtr_fip_device_name};
use crate::router::{ProcessContext, RouterInfo, RouterVariant};

#[derive(Debug, Default)]
struct FipNamespace {
    name: String,
    routers: BTreeSet<String>,
}

/// Per-external-network floating IP namespaces
#[derive(Debug, Default)]
pub struct FipNamespaces {
    namespaces: Mutex<HashMap<String, FipNamespace>>,
}

impl FipNamespaces {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the namespace of `ext_net_id`, creating it on first use.
    pub async fn get_fip_ns(
        &self,
        driver: &dyn NetworkDriver,
        ext_net_id: &str,
    ) -> AgentResult<String> {
        let mut namespaces = self.namespaces.lock().await;
        if let Some(ns) = namespaces.get(ext_net_id) {
            return Ok(ns.name.clone());
        }
        let name = fip_ns_name(ext_net_id);
        driver.create_namespace(&name).await?;
        driver.enable_forwarding(Some(&name)).await?;
        info!(ext_net_id, namespace = %name, "Created floating IP namespace");
        namespaces.insert(
            ext_net_id.to_string(),
            FipNamespace {
                name: name.clone(),
                routers: BTreeSet::new(),
            },
        );
        Ok(name)
    }

    /// Records that `router_id` uses the namespace of `ext_net_id`.
    pub async fn subscribe(&self, ext_net_id: &str, router_id: &str) {
        if let Some(ns) = self.namespaces.lock().await.get_mut(ext_net_id) {
            ns.routers.insert(router_id.to_string());
        }
    }

    /// Drops a router from the namespace; the namespace itself is deleted
    /// once no router uses it.
    pub async fn unsubscribe(
        &self,
        driver: &dyn NetworkDriver,
        ext_net_id: &str,
        router_id: &str,
    ) -> AgentResult<()> {
        let mut namespaces = self.namespaces.lock().await;
        let Some(ns) = namespaces.get_mut(ext_net_id) else {
            return Ok(());
        };
        ns.routers.remove(router_id);
        if !ns.routers.is_empty() {
            return Ok(());
        }
        let name = ns.name.clone();
        driver.delete_namespace(&name).await?;
        namespaces.remove(ext_net_id);
        info!(ext_net_id, namespace = %name, "Deleted floating IP namespace");
        Ok(())
    }

    /// Routers attached to the namespace of `ext_net_id`.
    pub async fn routers(&self, ext_net_id: &str) -> Vec<String> {
        self.namespaces
            .lock()
            .await
            .get(ext_net_id)
            .map(|ns| ns.routers.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.namespaces.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.namespaces.lock().await.is_empty()
    }
}

impl RouterInfo {
    /// Connects a distributed router to the floating IP namespace of its
    /// external network.
    pub async fn attach_fip_namespace(
        &mut self,
        ctx: &ProcessContext<'_>,
        ext_net_id: &str,
    ) -> AgentResult<()> {
        let attached = match &self.variant {
            RouterVariant::Distributed(dvr) => dvr.ext_net_id.as_deref() == Some(ext_net_id),
            _ => return Ok(()),
        };
        if attached {
            return Ok(());
        }
        // The external network changed under us.
        self.detach_fip_namespace(ctx).await?;

        let fip_ns = ctx.fip_namespaces.get_fip_ns(ctx.driver, ext_net_id).await?;
        ctx.fip_namespaces.subscribe(ext_net_id, &self.router_id).await;

        let device = rtr_fip_device_name(&self.router_id);
        ctx.driver
            .plug(&PortBinding {
                network_id: ext_net_id.to_string(),
                port_id: self.router_id.clone(),
                device_name: device.clone(),
                mac_address: String::new(),
                bridge: ctx.conf.external_bridge().map(str::to_string),
                namespace: self.ns_name.clone(),
            })
            .await?;

        if let RouterVariant::Distributed(dvr) = &mut self.variant {
            dvr.fip_ns = Some(fip_ns);
            dvr.ext_net_id = Some(ext_net_id.to_string());
        }
        debug!(router_id = %self.router_id, device = %device, "Attached to floating IP namespace");
        Ok(())
    }

    /// Disconnects a distributed router from its floating IP namespace.
    pub async fn detach_fip_namespace(&mut self, ctx: &ProcessContext<'_>) -> AgentResult<()> {
        let ext_net_id = match &self.variant {
            RouterVariant::Distributed(dvr) => match dvr.ext_net_id.clone() {
                Some(id) => id,
                None => return Ok(()),
            },
            _ => return Ok(()),
        };
        let device = rtr_fip_device_name(&self.router_id);
        ctx.driver
            .unplug(&device, ctx.conf.external_bridge(), self.ns())
            .await?;
        ctx.fip_namespaces
            .unsubscribe(ctx.driver, &ext_net_id, &self.router_id)
            .await?;
        if let RouterVariant::Distributed(dvr) = &mut self.variant {
            *dvr = Default::default();
        }
        debug!(router_id = %self.router_id, "Detached from floating IP namespace");
        Ok(())
    }

    /// Counts the floating IP addresses already on the router's link into
    /// the floating IP namespace. Runs once per router.
    pub async fn scan_fip_ports(&mut self, driver: &dyn NetworkDriver) -> AgentResult<()> {
        let RouterVariant::Distributed(dvr) = &self.variant else {
            return Ok(());
        };
        if dvr.dist_fip_count.is_some() || dvr.fip_ns.is_none() {
            return Ok(());
        }
        let device = rtr_fip_device_name(&self.router_id);
        let count = driver
            .list_addresses(&device, self.ns())
            .await?
            .iter()
            .filter(|cidr| cidr.ends_with("/32"))
            .count();
        if let RouterVariant::Distributed(dvr) = &mut self.variant {
            dvr.dist_fip_count = Some(count);
        }
        debug!(router_id = %self.router_id, count, "Scanned floating IP ports");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use l3_agent_common::RecordingExecutor;
    use l3_agent_test::{dvr_router, DriverCall, FakeController, FakeDriver, EXT_NET_ID};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fip_namespace_created_once() {
        let driver = FakeDriver::new();
        let fip_namespaces = FipNamespaces::new();

        let first = fip_namespaces.get_fip_ns(&driver, "ext").await.unwrap();
        let second = fip_namespaces.get_fip_ns(&driver, "ext").await.unwrap();
        assert_eq!(first, "fip-ext");
        assert_eq!(first, second);

        let creates = driver
            .calls()
            .into_iter()
            .filter(|c| matches!(c, DriverCall::CreateNamespace(_)))
            .count();
        assert_eq!(creates, 1);
    }

    #[tokio::test]
    async fn test_namespace_deleted_with_last_router() {
        let driver = FakeDriver::new();
        let fip_namespaces = FipNamespaces::new();
        fip_namespaces.get_fip_ns(&driver, "ext").await.unwrap();
        fip_namespaces.subscribe("ext", "r1").await;
        fip_namespaces.subscribe("ext", "r2").await;

        fip_namespaces.unsubscribe(&driver, "ext", "r1").await.unwrap();
        assert!(driver.has_namespace("fip-ext"));
        assert_eq!(fip_namespaces.routers("ext").await, vec!["r2"]);

        fip_namespaces.unsubscribe(&driver, "ext", "r2").await.unwrap();
        assert!(!driver.has_namespace("fip-ext"));
        assert!(fip_namespaces.is_empty().await);
    }

    #[tokio::test]
    async fn test_dvr_router_lifecycle() {
        let conf = AgentConfig {
            interface_driver: Some("ovs".to_string()),
            ..Default::default()
        };
        let driver = FakeDriver::new();
        let controller = FakeController::new();
        let fip_namespaces = FipNamespaces::new();
        let ctx = ProcessContext {
            conf: &conf,
            driver: &driver,
            plugin_rpc: &controller,
            fip_namespaces: &fip_namespaces,
        };
        driver.seed_address(Some("qrouter-r1"), "rfp-r1", "172.24.4.50/32");

        let mut ri =
            RouterInfo::new(dvr_router("r1"), true, Arc::new(RecordingExecutor::new())).unwrap();
        ri.create(&ctx).await.unwrap();
        ri.process(&ctx).await.unwrap();

        let fip_ns = format!("fip-{}", EXT_NET_ID);
        assert!(driver.has_namespace(&fip_ns));
        match &ri.variant {
            RouterVariant::Distributed(dvr) => {
                assert_eq!(dvr.fip_ns.as_deref(), Some(fip_ns.as_str()));
                assert_eq!(dvr.dist_fip_count, Some(1));
            }
            other => panic!("unexpected variant {:?}", other),
        }

        ri.router.gw_port = None;
        ri.process(&ctx).await.unwrap();
        assert!(!driver.has_namespace(&fip_ns));
        assert!(!driver.has_device(Some("qrouter-r1"), "rfp-r1"));
    }
}

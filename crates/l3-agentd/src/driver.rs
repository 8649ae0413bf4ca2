//! `ip netns` implementation of the namespace driver

use async_trait::async_trait;
use l3_agent_common::{
    AgentError, AgentResult, CommandExecutor, KeepalivedConfig, NetworkDriver, PortBinding,
    RadvdPrefix,
};
use l3_agent_types::Route;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::commands::*;
use crate::config::InterfaceDriverKind;

/// Drives namespaces and devices through `ip`, `ovs-vsctl` and `brctl`
pub struct IpNetnsDriver {
    executor: Arc<dyn CommandExecutor>,
    kind: InterfaceDriverKind,
    state_path: PathBuf,
}

impl IpNetnsDriver {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        kind: InterfaceDriverKind,
        state_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            executor,
            kind,
            state_path: state_path.into(),
        }
    }

    async fn exec(&self, namespace: Option<&str>, cmd: &str) -> AgentResult<String> {
        let cmd = ns_exec(namespace, cmd);
        self.executor.run_or_throw(&cmd).await
    }

    fn default_bridge(&self, network_id: &str) -> String {
        match self.kind {
            InterfaceDriverKind::Ovs => OVS_INTEGRATION_BRIDGE.to_string(),
            InterfaceDriverKind::LinuxBridge => linux_bridge_name(network_id),
        }
    }

    fn keepalived_dir(&self, router_id: &str) -> PathBuf {
        self.state_path.join("ha_confs").join(router_id)
    }

    fn radvd_conf_path(&self, router_id: &str) -> PathBuf {
        self.state_path
            .join("ra")
            .join(format!("{}.radvd.conf", router_id))
    }
}

async fn write_file(path: &Path, content: &str) -> AgentResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| AgentError::io(parent.display().to_string(), e))?;
    }
    tokio::fs::write(path, content)
        .await
        .map_err(|e| AgentError::io(path.display().to_string(), e))
}

async fn remove_path(path: &Path, dir: bool) -> AgentResult<()> {
    let result = if dir {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(AgentError::io(path.display().to_string(), e)),
    }
}

/// Render the keepalived configuration of an HA router
pub fn render_keepalived_conf(config: &KeepalivedConfig) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "vrrp_instance VR_1 {{");
    let _ = writeln!(out, "    state BACKUP");
    let _ = writeln!(out, "    interface {}", config.interface);
    let _ = writeln!(out, "    virtual_router_id 1");
    let _ = writeln!(out, "    priority 50");
    let _ = writeln!(out, "    nopreempt");
    let _ = writeln!(out, "    advert_int 2");
    let _ = writeln!(out, "    virtual_ipaddress_excluded {{");
    for vip in &config.vips {
        let _ = writeln!(out, "        {}", vip);
    }
    let _ = writeln!(out, "    }}");
    let _ = writeln!(out, "}}");
    out
}

/// Render the radvd configuration of a router
pub fn render_radvd_conf(prefixes: &[RadvdPrefix]) -> String {
    let mut out = String::new();
    for p in prefixes {
        let _ = writeln!(out, "interface {}", p.interface);
        let _ = writeln!(out, "{{");
        let _ = writeln!(out, "   AdvSendAdvert on;");
        let _ = writeln!(out, "   MinRtrAdvInterval 3;");
        let _ = writeln!(out, "   MaxRtrAdvInterval 10;");
        let _ = writeln!(out, "   prefix {}", p.prefix);
        let _ = writeln!(out, "   {{");
        let _ = writeln!(out, "        AdvOnLink on;");
        let _ = writeln!(out, "        AdvAutonomous on;");
        let _ = writeln!(out, "   }};");
        let _ = writeln!(out, "}};");
    }
    out
}

#[async_trait]
impl NetworkDriver for IpNetnsDriver {
    #[instrument(skip(self))]
    async fn create_namespace(&self, name: &str) -> AgentResult<()> {
        self.exec(None, &build_netns_add_cmd(name)).await?;
        self.exec(Some(name), &build_link_set_up_cmd("lo")).await?;
        info!("Created namespace {}", name);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_namespace(&self, name: &str) -> AgentResult<()> {
        self.exec(None, &build_netns_delete_cmd(name)).await?;
        info!("Deleted namespace {}", name);
        Ok(())
    }

    async fn list_namespaces(&self) -> AgentResult<Vec<String>> {
        let output = self.exec(None, &build_netns_list_cmd()).await?;
        Ok(parse_netns_list(&output))
    }

    async fn device_exists(&self, device: &str, namespace: Option<&str>) -> AgentResult<bool> {
        let cmd = ns_exec(namespace, &build_link_show_cmd(device));
        Ok(self.executor.run(&cmd).await?.success())
    }

    #[instrument(skip(self, port), fields(device = %port.device_name))]
    async fn plug(&self, port: &PortBinding) -> AgentResult<()> {
        let ns = port.namespace.as_deref();
        let bridge = port
            .bridge
            .clone()
            .unwrap_or_else(|| self.default_bridge(&port.network_id));
        let device = port.device_name.as_str();

        if self.device_exists(device, ns).await? {
            debug!("Device {} already exists", device);
            return Ok(());
        }

        match self.kind {
            InterfaceDriverKind::Ovs => {
                self.exec(
                    None,
                    &build_ovs_add_port_cmd(&bridge, device, &port.port_id, &port.mac_address),
                )
                .await?;
                if !port.mac_address.is_empty() {
                    self.exec(None, &build_link_set_mac_cmd(device, &port.mac_address))
                        .await?;
                }
                if let Some(ns) = ns {
                    self.exec(None, &build_link_set_netns_cmd(device, ns)).await?;
                }
                self.exec(ns, &build_link_set_up_cmd(device)).await?;
            }
            InterfaceDriverKind::LinuxBridge => {
                let tap = tap_device_name(device);
                self.exec(None, &build_veth_add_cmd(&tap, device)).await?;
                if !port.mac_address.is_empty() {
                    self.exec(None, &build_link_set_mac_cmd(device, &port.mac_address))
                        .await?;
                }
                if let Some(ns) = ns {
                    self.exec(None, &build_link_set_netns_cmd(device, ns)).await?;
                }
                self.exec(None, &build_brctl_addif_cmd(&bridge, &tap)).await?;
                self.exec(None, &build_link_set_up_cmd(&tap)).await?;
                self.exec(ns, &build_link_set_up_cmd(device)).await?;
            }
        }
        info!("Plugged {} into {}", device, bridge);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unplug(
        &self,
        device: &str,
        bridge: Option<&str>,
        namespace: Option<&str>,
    ) -> AgentResult<()> {
        match self.kind {
            InterfaceDriverKind::Ovs => {
                let bridge = bridge.unwrap_or(OVS_INTEGRATION_BRIDGE);
                self.exec(None, &build_ovs_del_port_cmd(bridge, device)).await?;
            }
            InterfaceDriverKind::LinuxBridge => {
                if self.device_exists(device, namespace).await? {
                    self.exec(namespace, &build_link_del_cmd(device)).await?;
                }
            }
        }
        info!("Unplugged {}", device);
        Ok(())
    }

    async fn add_address(
        &self,
        device: &str,
        cidr: &str,
        namespace: Option<&str>,
    ) -> AgentResult<()> {
        self.exec(namespace, &build_addr_add_cmd(device, cidr)).await?;
        Ok(())
    }

    async fn delete_address(
        &self,
        device: &str,
        cidr: &str,
        namespace: Option<&str>,
    ) -> AgentResult<()> {
        self.exec(namespace, &build_addr_del_cmd(device, cidr)).await?;
        Ok(())
    }

    async fn list_addresses(
        &self,
        device: &str,
        namespace: Option<&str>,
    ) -> AgentResult<Vec<String>> {
        let output = self.exec(namespace, &build_addr_show_cmd(device)).await?;
        Ok(parse_addr_show(&output))
    }

    async fn replace_route(&self, route: &Route, namespace: Option<&str>) -> AgentResult<()> {
        self.exec(namespace, &build_route_replace_cmd(route)).await?;
        Ok(())
    }

    async fn delete_route(&self, route: &Route, namespace: Option<&str>) -> AgentResult<()> {
        self.exec(namespace, &build_route_del_cmd(route)).await?;
        Ok(())
    }

    async fn enable_forwarding(&self, namespace: Option<&str>) -> AgentResult<()> {
        self.exec(namespace, &build_enable_forwarding_cmd()).await?;
        Ok(())
    }

    #[instrument(skip(self, config), fields(router_id = %config.router_id))]
    async fn enable_keepalived(&self, config: &KeepalivedConfig) -> AgentResult<()> {
        let path = self.keepalived_dir(&config.router_id).join("keepalived.conf");
        write_file(&path, &render_keepalived_conf(config)).await?;
        debug!(path = %path.display(), "Wrote keepalived configuration");
        Ok(())
    }

    async fn disable_keepalived(&self, router_id: &str) -> AgentResult<()> {
        remove_path(&self.keepalived_dir(router_id), true).await
    }

    async fn configure_radvd(
        &self,
        router_id: &str,
        _namespace: Option<&str>,
        prefixes: &[RadvdPrefix],
    ) -> AgentResult<()> {
        let path = self.radvd_conf_path(router_id);
        if prefixes.is_empty() {
            return remove_path(&path, false).await;
        }
        write_file(&path, &render_radvd_conf(prefixes)).await?;
        debug!(path = %path.display(), "Wrote radvd configuration");
        Ok(())
    }
}

/// Build the namespace driver selected by the configuration
pub fn create_driver(
    executor: Arc<dyn CommandExecutor>,
    kind: InterfaceDriverKind,
    state_path: impl Into<PathBuf>,
) -> Arc<dyn NetworkDriver> {
    Arc::new(IpNetnsDriver::new(executor, kind, state_path))
}

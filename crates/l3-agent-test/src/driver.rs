//! In-memory namespace driver
//!
//! Tracks namespaces, devices and addresses, records every call, and lets
//! tests inject failures and latency

use async_trait::async_trait;
use l3_agent_common::{
    AgentError, AgentResult, KeepalivedConfig, NetworkDriver, PortBinding, RadvdPrefix,
};
use l3_agent_types::Route;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

/// One recorded driver call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    CreateNamespace(String),
    DeleteNamespace(String),
    Plug {
        device: String,
        namespace: Option<String>,
    },
    Unplug {
        device: String,
        namespace: Option<String>,
    },
    AddAddress {
        device: String,
        cidr: String,
        namespace: Option<String>,
    },
    DeleteAddress {
        device: String,
        cidr: String,
        namespace: Option<String>,
    },
    ReplaceRoute {
        route: Route,
        namespace: Option<String>,
    },
    DeleteRoute {
        route: Route,
        namespace: Option<String>,
    },
    EnableForwarding(Option<String>),
    EnableKeepalived(KeepalivedConfig),
    DisableKeepalived(String),
    ConfigureRadvd {
        router_id: String,
        prefixes: Vec<RadvdPrefix>,
    },
}

type DeviceKey = (Option<String>, String);

#[derive(Debug, Default)]
struct DriverState {
    namespaces: BTreeSet<String>,
    devices: BTreeSet<DeviceKey>,
    addresses: BTreeMap<DeviceKey, Vec<String>>,
    calls: Vec<DriverCall>,
    failures: Vec<(String, String)>,
    delay: Option<Duration>,
    in_flight: HashMap<String, usize>,
    overlap_detected: bool,
}

/// Programmable [`NetworkDriver`] for tests
#[derive(Debug, Default)]
pub struct FakeDriver {
    state: Mutex<DriverState>,
}

impl FakeDriver {
    /// Create a driver whose root namespace has the `br-ex` bridge
    pub fn new() -> Self {
        let driver = Self::default();
        driver.add_device(None, "br-ex");
        driver
    }

    /// Pretend a namespace already exists
    pub fn add_namespace(&self, name: &str) {
        self.state.lock().namespaces.insert(name.to_string());
    }

    /// Pretend a device already exists
    pub fn add_device(&self, namespace: Option<&str>, device: &str) {
        self.state
            .lock()
            .devices
            .insert((namespace.map(str::to_string), device.to_string()));
    }

    /// Remove a device
    pub fn remove_device(&self, namespace: Option<&str>, device: &str) {
        self.state
            .lock()
            .devices
            .remove(&(namespace.map(str::to_string), device.to_string()));
    }

    /// Pretend an address is configured on a device
    pub fn seed_address(&self, namespace: Option<&str>, device: &str, cidr: &str) {
        self.state
            .lock()
            .addresses
            .entry((namespace.map(str::to_string), device.to_string()))
            .or_default()
            .push(cidr.to_string());
    }

    /// Fail `operation` whenever its subject contains `pattern`
    pub fn fail_on(&self, operation: &str, pattern: &str) {
        self.state
            .lock()
            .failures
            .push((operation.to_string(), pattern.to_string()));
    }

    /// Remove all injected failures
    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Sleep this long inside every namespaced call
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = Some(delay);
    }

    /// True if two calls ever ran concurrently in the same namespace
    pub fn overlap_detected(&self) -> bool {
        self.state.lock().overlap_detected
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.state.lock().namespaces.iter().cloned().collect()
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.state.lock().namespaces.contains(name)
    }

    pub fn has_device(&self, namespace: Option<&str>, device: &str) -> bool {
        self.state
            .lock()
            .devices
            .contains(&(namespace.map(str::to_string), device.to_string()))
    }

    pub fn addresses(&self, namespace: Option<&str>, device: &str) -> Vec<String> {
        self.state
            .lock()
            .addresses
            .get(&(namespace.map(str::to_string), device.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    fn record(&self, operation: &str, subject: &str, call: DriverCall) -> AgentResult<()> {
        let mut state = self.state.lock();
        state.calls.push(call);
        let failed = state
            .failures
            .iter()
            .any(|(op, pattern)| op == operation && subject.contains(pattern.as_str()));
        if failed {
            tracing::debug!(operation, subject, "Injected driver failure");
            return Err(AgentError::driver(operation, format!("injected failure on {}", subject)));
        }
        Ok(())
    }

    async fn enter(&self, namespace: Option<&str>) {
        let delay = {
            let mut state = self.state.lock();
            if let Some(ns) = namespace {
                let count = state.in_flight.entry(ns.to_string()).or_insert(0);
                *count += 1;
                if *count > 1 {
                    state.overlap_detected = true;
                }
            }
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn leave(&self, namespace: Option<&str>) {
        if let Some(ns) = namespace {
            if let Some(count) = self.state.lock().in_flight.get_mut(ns) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

fn owned(namespace: Option<&str>) -> Option<String> {
    namespace.map(str::to_string)
}

#[async_trait]
impl NetworkDriver for FakeDriver {
    async fn create_namespace(&self, name: &str) -> AgentResult<()> {
        self.enter(Some(name)).await;
        let result = self.record(
            "create_namespace",
            name,
            DriverCall::CreateNamespace(name.to_string()),
        );
        if result.is_ok() {
            self.state.lock().namespaces.insert(name.to_string());
        }
        self.leave(Some(name));
        result
    }

    async fn delete_namespace(&self, name: &str) -> AgentResult<()> {
        self.record(
            "delete_namespace",
            name,
            DriverCall::DeleteNamespace(name.to_string()),
        )?;
        let mut state = self.state.lock();
        state.namespaces.remove(name);
        state.devices.retain(|(ns, _)| ns.as_deref() != Some(name));
        state.addresses.retain(|(ns, _), _| ns.as_deref() != Some(name));
        Ok(())
    }

    async fn list_namespaces(&self) -> AgentResult<Vec<String>> {
        Ok(self.namespaces())
    }

    async fn device_exists(&self, device: &str, namespace: Option<&str>) -> AgentResult<bool> {
        Ok(self.has_device(namespace, device))
    }

    async fn plug(&self, port: &PortBinding) -> AgentResult<()> {
        let ns = port.namespace.as_deref();
        self.enter(ns).await;
        let result = self.record(
            "plug",
            &port.device_name,
            DriverCall::Plug {
                device: port.device_name.clone(),
                namespace: port.namespace.clone(),
            },
        );
        if result.is_ok() {
            self.add_device(ns, &port.device_name);
        }
        self.leave(ns);
        result
    }

    async fn unplug(
        &self,
        device: &str,
        _bridge: Option<&str>,
        namespace: Option<&str>,
    ) -> AgentResult<()> {
        self.record(
            "unplug",
            device,
            DriverCall::Unplug {
                device: device.to_string(),
                namespace: owned(namespace),
            },
        )?;
        let key = (owned(namespace), device.to_string());
        let mut state = self.state.lock();
        state.devices.remove(&key);
        state.addresses.remove(&key);
        Ok(())
    }

    async fn add_address(
        &self,
        device: &str,
        cidr: &str,
        namespace: Option<&str>,
    ) -> AgentResult<()> {
        self.enter(namespace).await;
        let result = self.record(
            "add_address",
            cidr,
            DriverCall::AddAddress {
                device: device.to_string(),
                cidr: cidr.to_string(),
                namespace: owned(namespace),
            },
        );
        if result.is_ok() {
            let mut state = self.state.lock();
            let addrs = state
                .addresses
                .entry((owned(namespace), device.to_string()))
                .or_default();
            if !addrs.iter().any(|a| a == cidr) {
                addrs.push(cidr.to_string());
            }
        }
        self.leave(namespace);
        result
    }

    async fn delete_address(
        &self,
        device: &str,
        cidr: &str,
        namespace: Option<&str>,
    ) -> AgentResult<()> {
        self.record(
            "delete_address",
            cidr,
            DriverCall::DeleteAddress {
                device: device.to_string(),
                cidr: cidr.to_string(),
                namespace: owned(namespace),
            },
        )?;
        if let Some(addrs) = self
            .state
            .lock()
            .addresses
            .get_mut(&(owned(namespace), device.to_string()))
        {
            addrs.retain(|a| a != cidr);
        }
        Ok(())
    }

    async fn list_addresses(
        &self,
        device: &str,
        namespace: Option<&str>,
    ) -> AgentResult<Vec<String>> {
        Ok(self.addresses(namespace, device))
    }

    async fn replace_route(&self, route: &Route, namespace: Option<&str>) -> AgentResult<()> {
        self.enter(namespace).await;
        let result = self.record(
            "replace_route",
            &route.destination,
            DriverCall::ReplaceRoute {
                route: route.clone(),
                namespace: owned(namespace),
            },
        );
        self.leave(namespace);
        result
    }

    async fn delete_route(&self, route: &Route, namespace: Option<&str>) -> AgentResult<()> {
        self.record(
            "delete_route",
            &route.destination,
            DriverCall::DeleteRoute {
                route: route.clone(),
                namespace: owned(namespace),
            },
        )
    }

    async fn enable_forwarding(&self, namespace: Option<&str>) -> AgentResult<()> {
        self.enter(namespace).await;
        let result = self.record(
            "enable_forwarding",
            namespace.unwrap_or(""),
            DriverCall::EnableForwarding(owned(namespace)),
        );
        self.leave(namespace);
        result
    }

    async fn enable_keepalived(&self, config: &KeepalivedConfig) -> AgentResult<()> {
        self.record(
            "enable_keepalived",
            &config.router_id,
            DriverCall::EnableKeepalived(config.clone()),
        )
    }

    async fn disable_keepalived(&self, router_id: &str) -> AgentResult<()> {
        self.record(
            "disable_keepalived",
            router_id,
            DriverCall::DisableKeepalived(router_id.to_string()),
        )
    }

    async fn configure_radvd(
        &self,
        router_id: &str,
        _namespace: Option<&str>,
        prefixes: &[RadvdPrefix],
    ) -> AgentResult<()> {
        self.record(
            "configure_radvd",
            router_id,
            DriverCall::ConfigureRadvd {
                router_id: router_id.to_string(),
                prefixes: prefixes.to_vec(),
            },
        )
    }
}

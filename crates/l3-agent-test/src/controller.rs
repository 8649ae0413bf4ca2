//! In-memory controller
//!
//! Answers the agent's RPC calls from a programmable router set and records
//! every status write

use async_trait::async_trait;
use l3_agent_common::error::TOO_MANY_EXTERNAL_NETWORKS;
use l3_agent_common::{AgentStateReport, PluginApi, RpcError};
use l3_agent_types::{FipStatus, HaState, RouterDocument, RouterId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};

#[derive(Debug, Default)]
struct ControllerState {
    routers: BTreeMap<RouterId, RouterDocument>,
    external_network_ids: Vec<String>,
    service_plugins: Vec<String>,
    get_routers_error: Option<RpcError>,
    service_plugin_errors: VecDeque<RpcError>,
    report_error: Option<RpcError>,
    fip_status_updates: Vec<(RouterId, HashMap<String, FipStatus>)>,
    ha_state_updates: Vec<HashMap<RouterId, HaState>>,
    reports: Vec<AgentStateReport>,
    get_routers_calls: Vec<Option<Vec<RouterId>>>,
    external_network_calls: usize,
    service_plugin_calls: usize,
}

/// Programmable [`PluginApi`] for tests
#[derive(Debug, Default)]
pub struct FakeController {
    state: Mutex<ControllerState>,
}

impl FakeController {
    /// Create an empty controller with one external network
    pub fn new() -> Self {
        let controller = Self::default();
        controller.state.lock().external_network_ids = vec![crate::EXT_NET_ID.to_string()];
        controller
    }

    /// Add or replace a router
    pub fn set_router(&self, doc: RouterDocument) {
        self.state.lock().routers.insert(doc.id.clone(), doc);
    }

    /// Remove a router
    pub fn remove_router(&self, router_id: &str) {
        self.state.lock().routers.remove(router_id);
    }

    /// Set the external networks known to the controller
    pub fn set_external_network_ids(&self, ids: Vec<String>) {
        self.state.lock().external_network_ids = ids;
    }

    /// Set the service plugin list
    pub fn set_service_plugins(&self, plugins: Vec<String>) {
        self.state.lock().service_plugins = plugins;
    }

    /// Fail every `get_routers` call until cleared
    pub fn fail_get_routers(&self, error: RpcError) {
        self.state.lock().get_routers_error = Some(error);
    }

    /// Let `get_routers` succeed again
    pub fn clear_get_routers_failure(&self) {
        self.state.lock().get_routers_error = None;
    }

    /// Fail the next `get_service_plugin_list` call with `error`
    pub fn queue_service_plugin_error(&self, error: RpcError) {
        self.state.lock().service_plugin_errors.push_back(error);
    }

    /// Fail every `report_state` call
    pub fn fail_report_state(&self, error: RpcError) {
        self.state.lock().report_error = Some(error);
    }

    /// Floating IP status updates received so far
    pub fn fip_status_updates(&self) -> Vec<(RouterId, HashMap<String, FipStatus>)> {
        self.state.lock().fip_status_updates.clone()
    }

    /// HA state batches received so far
    pub fn ha_state_updates(&self) -> Vec<HashMap<RouterId, HaState>> {
        self.state.lock().ha_state_updates.clone()
    }

    /// State reports received so far
    pub fn reports(&self) -> Vec<AgentStateReport> {
        self.state.lock().reports.clone()
    }

    /// Arguments of every `get_routers` call
    pub fn get_routers_calls(&self) -> Vec<Option<Vec<RouterId>>> {
        self.state.lock().get_routers_calls.clone()
    }

    /// Number of `get_external_network_id` calls
    pub fn external_network_calls(&self) -> usize {
        self.state.lock().external_network_calls
    }

    /// Number of `get_service_plugin_list` calls
    pub fn service_plugin_calls(&self) -> usize {
        self.state.lock().service_plugin_calls
    }
}

#[async_trait]
impl PluginApi for FakeController {
    async fn get_routers(
        &self,
        router_ids: Option<&[RouterId]>,
    ) -> Result<Vec<RouterDocument>, RpcError> {
        let mut state = self.state.lock();
        state.get_routers_calls.push(router_ids.map(<[RouterId]>::to_vec));
        if let Some(err) = &state.get_routers_error {
            return Err(err.clone());
        }
        let routers = match router_ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| state.routers.get(id).cloned())
                .collect(),
            None => state.routers.values().cloned().collect(),
        };
        Ok(routers)
    }

    async fn get_external_network_id(&self) -> Result<Option<String>, RpcError> {
        let mut state = self.state.lock();
        state.external_network_calls += 1;
        match state.external_network_ids.as_slice() {
            [] => Ok(None),
            [id] => Ok(Some(id.clone())),
            ids => Err(RpcError::remote(
                TOO_MANY_EXTERNAL_NETWORKS,
                format!("{} external networks", ids.len()),
            )),
        }
    }

    async fn update_floatingip_statuses(
        &self,
        router_id: &str,
        statuses: &HashMap<String, FipStatus>,
    ) -> Result<(), RpcError> {
        self.state
            .lock()
            .fip_status_updates
            .push((router_id.to_string(), statuses.clone()));
        Ok(())
    }

    async fn get_service_plugin_list(&self) -> Result<Vec<String>, RpcError> {
        let mut state = self.state.lock();
        state.service_plugin_calls += 1;
        if let Some(err) = state.service_plugin_errors.pop_front() {
            return Err(err);
        }
        Ok(state.service_plugins.clone())
    }

    async fn update_ha_routers_states(
        &self,
        states: &HashMap<RouterId, HaState>,
    ) -> Result<(), RpcError> {
        self.state.lock().ha_state_updates.push(states.clone());
        Ok(())
    }

    async fn report_state(&self, report: &AgentStateReport) -> Result<(), RpcError> {
        let mut state = self.state.lock();
        if let Some(err) = &state.report_error {
            return Err(err.clone());
        }
        state.reports.push(report.clone());
        Ok(())
    }
}

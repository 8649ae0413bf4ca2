//! File-backed controller for standalone mode
//!
//! The desired state lives in a JSON document that is re-read on every
//! call, so an operator (or a test) can edit it while the agent runs.
//! Writes the agent would send upstream are logged.

use async_trait::async_trait;
use l3_agent_common::error::TOO_MANY_EXTERNAL_NETWORKS;
use l3_agent_common::{AgentStateReport, PluginApi, RpcError};
use l3_agent_types::{FipStatus, HaState, RouterDocument, RouterId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// On-disk controller state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerState {
    #[serde(default)]
    pub external_network_ids: Vec<String>,
    #[serde(default)]
    pub service_plugins: Vec<String>,
    #[serde(default)]
    pub routers: Vec<RouterDocument>,
}

/// [`PluginApi`] answering from a JSON state file
#[derive(Debug, Clone)]
pub struct FilePluginApi {
    path: PathBuf,
}

impl FilePluginApi {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the state file; a missing file is an empty controller
    pub async fn load(&self) -> Result<ControllerState, RpcError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                RpcError::Messaging(format!(
                    "invalid controller state {}: {}",
                    self.path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Controller state file not found");
                Ok(ControllerState::default())
            }
            Err(e) => Err(RpcError::Messaging(format!(
                "cannot read controller state {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

#[async_trait]
impl PluginApi for FilePluginApi {
    async fn get_routers(
        &self,
        router_ids: Option<&[RouterId]>,
    ) -> Result<Vec<RouterDocument>, RpcError> {
        let state = self.load().await?;
        Ok(match router_ids {
            Some(ids) => state
                .routers
                .into_iter()
                .filter(|r| ids.contains(&r.id))
                .collect(),
            None => state.routers,
        })
    }

    async fn get_external_network_id(&self) -> Result<Option<String>, RpcError> {
        let mut state = self.load().await?;
        match state.external_network_ids.len() {
            0 => Ok(None),
            1 => Ok(state.external_network_ids.pop()),
            n => Err(RpcError::remote(
                TOO_MANY_EXTERNAL_NETWORKS,
                format!("{} external networks found", n),
            )),
        }
    }

    async fn update_floatingip_statuses(
        &self,
        router_id: &str,
        statuses: &HashMap<String, FipStatus>,
    ) -> Result<(), RpcError> {
        for (fip_id, status) in statuses {
            info!(router_id, fip_id = %fip_id, status = %status, "Floating IP status");
        }
        Ok(())
    }

    async fn get_service_plugin_list(&self) -> Result<Vec<String>, RpcError> {
        Ok(self.load().await?.service_plugins)
    }

    async fn update_ha_routers_states(
        &self,
        states: &HashMap<RouterId, HaState>,
    ) -> Result<(), RpcError> {
        for (router_id, state) in states {
            info!(router_id = %router_id, state = state.as_controller_str(), "HA router state");
        }
        Ok(())
    }

    async fn report_state(&self, report: &AgentStateReport) -> Result<(), RpcError> {
        let json = serde_json::to_string(report)
            .map_err(|e| RpcError::Messaging(format!("cannot encode state report: {}", e)))?;
        debug!(report = %json, "Agent state report");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn state_file(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_get_routers() {
        let file = state_file(
            r#"{"external_network_ids": ["ext"],
                "routers": [{"id": "r1"}, {"id": "r2", "ha": true}]}"#,
        );
        let api = FilePluginApi::new(file.path());

        assert_eq!(api.get_routers(None).await.unwrap().len(), 2);
        let ids = vec!["r2".to_string()];
        let routers = api.get_routers(Some(&ids)).await.unwrap();
        assert_eq!(routers.len(), 1);
        assert!(routers[0].ha);
        assert_eq!(api.get_external_network_id().await.unwrap().as_deref(), Some("ext"));
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let api = FilePluginApi::new("/nonexistent/controller.json");
        assert!(api.get_routers(None).await.unwrap().is_empty());
        assert_eq!(api.get_external_network_id().await.unwrap(), None);
        assert!(api.get_service_plugin_list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_too_many_external_networks() {
        let file = state_file(r#"{"external_network_ids": ["a", "b"]}"#);
        let api = FilePluginApi::new(file.path());
        let err = api.get_external_network_id().await.unwrap_err();
        assert!(err.is_remote_type(TOO_MANY_EXTERNAL_NETWORKS));
    }

    #[tokio::test]
    async fn test_invalid_file_is_messaging_error() {
        let file = state_file("{not json");
        let api = FilePluginApi::new(file.path());
        assert!(matches!(
            api.get_routers(None).await,
            Err(RpcError::Messaging(_))
        ));
    }
}

//! Full resynchronization with the controller.
//!
//! A full sync fetches every router of this agent and enqueues it at
//! [`UpdatePriority::SyncTask`], with deletions for routers that disappeared.
//! The fetched documents travel with the updates, so workers do not fetch
//! them again.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use l3_agent_common::{AgentError, AgentResult};
use tracing::{debug, error, info, instrument, warn};

use crate::agent::L3Agent;
use crate::namespace_manager::NamespaceManager;
use crate::queue::{RouterUpdate, UpdatePriority};

/// Whether the next periodic pass must resync everything.
///
/// Starts set so the first pass always syncs.
#[derive(Debug)]
pub struct FullSyncFlag(AtomicBool);

impl FullSyncFlag {
    pub fn new() -> Self {
        Self(AtomicBool::new(true))
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for FullSyncFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl L3Agent {
    /// Periodic hook for service plugins riding on the agent.
    pub fn process_services_sync(&self) {
        debug!(service_plugins = ?self.service_plugins(), "Processing services sync");
    }

    /// Runs a full sync when one is pending.
    pub async fn periodic_sync_routers_task(&self) {
        self.process_services_sync();
        if !self.fullsync.is_set() {
            return;
        }
        debug!("Starting fullsync periodic_sync_routers_task");

        let mut ns_manager = self.namespaces_manager.lock().await;
        if let Err(e) = ns_manager.begin(self.driver.as_ref()).await {
            warn!(error = %e, "Failed to list router namespaces, skipping cleanup");
        }

        match self.fetch_and_sync_all_routers(&mut ns_manager).await {
            Ok(()) => {
                let deleted = ns_manager.finish(self.driver.as_ref()).await;
                info!(
                    stale_namespaces = deleted.len(),
                    "periodic_sync_routers_task successfully completed"
                );
            }
            Err(e) => {
                warn!(error = %e, "Full sync aborted, will retry");
                self.fullsync.set();
                ns_manager.abort();
            }
        }
    }

    /// Enqueues every router of this agent plus deletions for the routers
    /// that are no longer reported.
    #[instrument(skip(self, ns_manager))]
    pub async fn fetch_and_sync_all_routers(
        &self,
        ns_manager: &mut NamespaceManager,
    ) -> AgentResult<()> {
        let prev_router_ids: BTreeSet<String> = self.registry.router_ids().into_iter().collect();
        let timestamp = Utc::now();

        let restricted = self
            .conf
            .restricted_router_id()
            .map(|id| vec![id.to_string()]);
        let routers = match self.plugin_rpc.get_routers(restricted.as_deref()).await {
            Ok(routers) => routers,
            Err(e) => {
                error!(error = %e, "Failed synchronizing routers due to RPC error");
                return Err(AgentError::AbortSyncRouters);
            }
        };

        let mut curr_router_ids = BTreeSet::new();
        for router in routers {
            ns_manager.keep_router(&router.id);
            curr_router_ids.insert(router.id.clone());
            let update = RouterUpdate::new(router.id.clone(), UpdatePriority::SyncTask)
                .with_router(router)
                .with_timestamp(timestamp);
            self.queue.add(update);
        }
        self.fullsync.clear();
        debug!(routers = curr_router_ids.len(), "Periodic sync routers enqueued");

        for router_id in prev_router_ids.difference(&curr_router_ids) {
            ns_manager.keep_router(router_id);
            self.queue.add(
                RouterUpdate::delete(router_id.as_str(), UpdatePriority::SyncTask)
                    .with_timestamp(timestamp),
            );
            debug!(router_id = %router_id, "Router gone from controller, deletion enqueued");
        }
        Ok(())
    }
}

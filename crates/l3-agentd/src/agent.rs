//! The L3 agent: inbound notifications, router workers and lifecycle.
//!
//! Notifications only enqueue [`RouterUpdate`]s. A fixed pool of workers
//! drains the queue; each worker holds the lease of one router at a time,
//! so a router is never processed by two workers at once while different
//! routers proceed in parallel. Any failure a worker cannot handle sets the
//! full-sync flag and the periodic task re-discovers everything.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use l3_agent_common::error::TOO_MANY_EXTERNAL_NETWORKS;
use l3_agent_common::{AgentError, AgentResult, CommandExecutor, NetworkDriver, PluginApi};
use l3_agent_types::{HaState, RouterDocument, RouterId};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::config::AgentConfig;
use crate::dvr::FipNamespaces;
use crate::ha::HaStateReporter;
use crate::namespace_manager::NamespaceManager;
use crate::observers::{EventObservers, RouterEvent};
use crate::queue::{RouterLease, RouterUpdate, UpdatePriority, UpdateQueue};
use crate::registry::RouterRegistry;
use crate::report::ReportState;
use crate::router::{ProcessContext, RouterInfo, RouterVariant};
use crate::sync::FullSyncFlag;

/// Attempts at fetching the service plugin list before giving up.
pub const SERVICE_PLUGIN_RETRIES: usize = 5;

/// Router list of a `routers_updated` notification: either bare ids or full
/// documents (of which only the ids are used).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RoutersPayload {
    Ids(Vec<RouterId>),
    Documents(Vec<RouterDocument>),
}

impl RoutersPayload {
    pub fn into_ids(self) -> Vec<RouterId> {
        match self {
            RoutersPayload::Ids(ids) => ids,
            RoutersPayload::Documents(docs) => docs.into_iter().map(|doc| doc.id).collect(),
        }
    }
}

/// Payload of `router_removed_from_agent`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RouterRemovedPayload {
    pub router_id: RouterId,
}

/// Router reconciliation agent
pub struct L3Agent {
    pub(crate) conf: AgentConfig,
    pub(crate) plugin_rpc: Arc<dyn PluginApi>,
    pub(crate) driver: Arc<dyn NetworkDriver>,
    executor: Arc<dyn CommandExecutor>,
    pub(crate) queue: UpdateQueue,
    pub(crate) registry: RouterRegistry,
    observers: EventObservers,
    pub(crate) fullsync: FullSyncFlag,
    pub(crate) namespaces_manager: tokio::sync::Mutex<NamespaceManager>,
    fip_namespaces: FipNamespaces,
    ha_reporter: HaStateReporter,
    target_ex_net_id: Mutex<Option<String>>,
    pub(crate) service_plugins: Option<Vec<String>>,
    pub(crate) report_state: ReportState,
}

impl std::fmt::Debug for L3Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("L3Agent")
            .field("host", &self.conf.host)
            .field("routers", &self.registry.len())
            .field("pending_updates", &self.queue.len())
            .field("fullsync", &self.fullsync.is_set())
            .finish()
    }
}

impl L3Agent {
    /// Validates the configuration and asks the controller for its service
    /// plugins.
    ///
    /// Fails on fatal misconfiguration and when the controller keeps timing
    /// out.
    pub async fn new(
        conf: AgentConfig,
        plugin_rpc: Arc<dyn PluginApi>,
        driver: Arc<dyn NetworkDriver>,
        executor: Arc<dyn CommandExecutor>,
    ) -> AgentResult<Arc<Self>> {
        conf.check_config_params()?;
        conf.validate()?;

        let service_plugins = fetch_service_plugins(plugin_rpc.as_ref()).await?;
        info!(
            host = %conf.host,
            agent_mode = %conf.agent_mode,
            workers = conf.workers,
            "L3 agent initialized"
        );

        Ok(Arc::new(Self {
            namespaces_manager: tokio::sync::Mutex::new(NamespaceManager::new(
                conf.use_namespaces,
            )),
            conf,
            plugin_rpc,
            driver,
            executor,
            queue: UpdateQueue::new(),
            registry: RouterRegistry::new(),
            observers: EventObservers::new(),
            fullsync: FullSyncFlag::new(),
            fip_namespaces: FipNamespaces::new(),
            ha_reporter: HaStateReporter::new(),
            target_ex_net_id: Mutex::new(None),
            service_plugins,
            report_state: ReportState::new(),
        }))
    }

    pub fn conf(&self) -> &AgentConfig {
        &self.conf
    }

    pub fn queue(&self) -> &UpdateQueue {
        &self.queue
    }

    pub fn registry(&self) -> &RouterRegistry {
        &self.registry
    }

    pub fn observers(&self) -> &EventObservers {
        &self.observers
    }

    pub fn ha_reporter(&self) -> &HaStateReporter {
        &self.ha_reporter
    }

    pub fn fip_namespaces(&self) -> &FipNamespaces {
        &self.fip_namespaces
    }

    pub fn fullsync(&self) -> bool {
        self.fullsync.is_set()
    }

    /// Service plugins reported by the controller; `None` if unknown.
    pub fn service_plugins(&self) -> Option<&[String]> {
        self.service_plugins.as_deref()
    }

    fn process_context(&self) -> ProcessContext<'_> {
        ProcessContext {
            conf: &self.conf,
            driver: self.driver.as_ref(),
            plugin_rpc: self.plugin_rpc.as_ref(),
            fip_namespaces: &self.fip_namespaces,
        }
    }

    // Inbound notifications

    /// Routers changed on the controller.
    pub fn routers_updated(&self, routers: RoutersPayload) {
        let ids = routers.into_ids();
        debug!(count = ids.len(), "Got routers updated notification");
        for router_id in ids {
            self.queue.add(RouterUpdate::new(router_id, UpdatePriority::Rpc));
        }
    }

    /// A router was deleted on the controller.
    pub fn router_deleted(&self, router_id: &str) {
        debug!(router_id, "Got router deleted notification");
        self.queue
            .add(RouterUpdate::delete(router_id, UpdatePriority::Rpc));
    }

    /// A router was unscheduled from this agent.
    pub fn router_removed_from_agent(&self, payload: RouterRemovedPayload) {
        debug!(router_id = %payload.router_id, "Got router removed from agent");
        self.router_deleted(&payload.router_id);
    }

    /// Routers were scheduled to this agent.
    pub fn router_added_to_agent(&self, payload: RoutersPayload) {
        debug!("Got router added to agent");
        self.routers_updated(payload);
    }

    /// The agent itself changed on the controller; resync everything.
    pub fn agent_updated(&self, payload: &serde_json::Value) {
        self.fullsync.set();
        info!(payload = %payload, "agent_updated by server side");
    }

    /// Records an HA state transition reported by keepalived.
    pub fn enqueue_state_change(&self, router_id: &str, state: HaState) -> bool {
        self.ha_reporter.enqueue_state_change(router_id, state)
    }

    // Worker side

    /// Resolves the external network this agent serves.
    ///
    /// The configured network wins. Without an external bridge any network
    /// can be served. Otherwise the cached answer is used unless `force`.
    pub async fn fetch_external_net_id(&self, force: bool) -> AgentResult<Option<String>> {
        if let Some(id) = &self.conf.gateway_external_network_id {
            return Ok(Some(id.clone()));
        }
        if self.conf.external_bridge().is_none() {
            return Ok(None);
        }
        if !force {
            let cached = self.target_ex_net_id.lock().clone();
            if cached.is_some() {
                return Ok(cached);
            }
        }
        match self.plugin_rpc.get_external_network_id().await {
            Ok(id) => {
                *self.target_ex_net_id.lock() = id.clone();
                Ok(id)
            }
            Err(e) if e.is_remote_type(TOO_MANY_EXTERNAL_NETWORKS) => {
                Err(AgentError::TooManyExternalNetworks)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Checks that this agent may serve `router`, then adds or updates it.
    #[instrument(skip(self, router), fields(router_id = %router.id))]
    pub async fn process_router_if_compatible(&self, router: RouterDocument) -> AgentResult<()> {
        if let Some(bridge) = self.conf.external_bridge() {
            if !self.driver.device_exists(bridge, None).await? {
                error!("The external network bridge '{}' does not exist", bridge);
                return Ok(());
            }
        }

        if let Some(restricted) = self.conf.restricted_router_id() {
            if router.id != restricted {
                return Err(AgentError::not_compatible(&router.id));
            }
        }

        let ex_net_id = router.external_network_id().map(str::to_string);
        if ex_net_id.is_none() && !self.conf.handle_internal_only_routers {
            return Err(AgentError::not_compatible(&router.id));
        }

        if let Some(ex_net_id) = ex_net_id.as_deref() {
            let target = self.fetch_external_net_id(false).await?;
            if target.as_deref().is_some_and(|t| t != ex_net_id) {
                // The cached answer may be stale.
                let target = self.fetch_external_net_id(true).await?;
                if target.as_deref().is_some_and(|t| t != ex_net_id) {
                    return Err(AgentError::not_compatible(&router.id));
                }
            }
        }

        if self.registry.contains(&router.id) {
            self.process_updated_router(router).await
        } else {
            self.process_added_router(router).await
        }
    }

    async fn process_added_router(&self, router: RouterDocument) -> AgentResult<()> {
        let router_id = router.id.clone();
        let ri = RouterInfo::new(router, self.conf.use_namespaces, self.executor.clone())?;
        self.observers.notify(RouterEvent::BeforeAdd, &ri);
        let handle = self.registry.insert(ri);
        let mut ri = handle.lock().await;

        if let RouterVariant::Ha(state) = &mut ri.variant {
            self.ha_reporter.register(&router_id);
            state.monitoring = true;
        }

        let ctx = self.process_context();
        let result = match ri.create(&ctx).await {
            Ok(()) => ri.process(&ctx).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.registry.remove(&router_id);
            self.ha_reporter.unregister(&router_id);
            if let Err(cleanup) = ri.delete(&ctx).await {
                warn!(router_id = %router_id, error = %cleanup, "Cleanup of failed router failed");
            }
            return Err(e);
        }

        self.observers.notify(RouterEvent::AfterAdd, &ri);
        info!(router_id = %router_id, kind = %ri.variant.kind(), "Router added");
        Ok(())
    }

    async fn process_updated_router(&self, router: RouterDocument) -> AgentResult<()> {
        let Some(handle) = self.registry.get(&router.id) else {
            return Err(AgentError::internal(format!(
                "router {} vanished from the registry",
                router.id
            )));
        };
        let mut ri = handle.lock().await;
        ri.router = router;
        self.observers.notify(RouterEvent::BeforeUpdate, &ri);
        ri.process(&self.process_context()).await?;
        self.observers.notify(RouterEvent::AfterUpdate, &ri);
        debug!(router_id = %ri.router_id, "Router updated");
        Ok(())
    }

    /// Retracts everything applied for a router and forgets it.
    #[instrument(skip(self))]
    pub async fn router_removed(&self, router_id: &str) -> AgentResult<()> {
        let Some(handle) = self.registry.get(router_id) else {
            warn!("Info for router {} was not found. Skipping router removal", router_id);
            return Ok(());
        };
        let mut ri = handle.lock().await;
        let ctx = self.process_context();

        self.observers.notify(RouterEvent::BeforeRemove, &ri);
        if ri.is_ha() {
            ri.ha_teardown(ctx.driver).await?;
            self.ha_reporter.unregister(router_id);
        }

        ri.clear_desired_state();
        ri.process(&ctx).await?;

        self.registry.remove(router_id);
        ri.delete(&ctx).await?;
        self.observers.notify(RouterEvent::AfterRemove, &ri);
        info!("Router removed");
        Ok(())
    }

    /// [`L3Agent::router_removed`] that logs failures; returns success.
    pub async fn safe_router_removed(&self, router_id: &str) -> bool {
        match self.router_removed(router_id).await {
            Ok(()) => true,
            Err(e) => {
                error!(router_id, error = %e, "Error while deleting router");
                false
            }
        }
    }

    async fn fetch_router(&self, router_id: &str) -> AgentResult<Option<RouterDocument>> {
        let ids = [router_id.to_string()];
        let routers = self.plugin_rpc.get_routers(Some(&ids)).await?;
        Ok(routers.into_iter().find(|r| r.id == router_id))
    }

    /// Drains every pending update of a leased router.
    #[instrument(skip(self, lease), fields(router_id = %lease.router_id()))]
    pub async fn process_router_update(&self, mut lease: RouterLease) {
        while let Some(update) = lease.next_update() {
            debug!(priority = ?update.priority, action = ?update.action, "Starting router update");

            let mut router = update.router.clone();
            let mut timestamp = update.timestamp;
            if !update.is_delete() && router.is_none() {
                // Anything queued before the fetch is covered by its answer.
                timestamp = Utc::now();
                match self.fetch_router(&update.router_id).await {
                    Ok(fetched) => router = fetched,
                    Err(e) => {
                        error!(error = %e, "Failed to fetch router information");
                        self.fullsync.set();
                        continue;
                    }
                }
            }

            let Some(router) = router else {
                if self.safe_router_removed(&update.router_id).await {
                    lease.fetched_and_processed(timestamp);
                    lease.router_removed();
                } else {
                    self.fullsync.set();
                }
                continue;
            };

            match self.process_router_if_compatible(router).await {
                Ok(()) => lease.fetched_and_processed(timestamp),
                Err(AgentError::RouterNotCompatibleWithAgent { router_id }) => {
                    info!(router_id = %router_id, "Router is not compatible with this agent");
                    if self.registry.contains(&router_id) && !self.safe_router_removed(&router_id).await
                    {
                        self.fullsync.set();
                        continue;
                    }
                    lease.fetched_and_processed(timestamp);
                    lease.router_removed();
                }
                Err(e) => {
                    error!(error = %e, "Failed to process compatible router");
                    self.fullsync.set();
                }
            }
        }
    }

    /// Processes leases until the queue has no eligible router left.
    pub async fn process_pending_updates(&self) {
        let mut leases = Box::pin(self.queue.each_update_to_next_router());
        while let Some(lease) = leases.next().await {
            self.process_router_update(lease).await;
        }
    }

    async fn worker_loop(self: Arc<Self>, worker: usize, cancel: CancellationToken) {
        debug!(worker, "Router worker started");
        loop {
            let lease = tokio::select! {
                _ = cancel.cancelled() => break,
                lease = self.queue.next_router() => lease,
            };
            self.process_router_update(lease).await;
        }
        debug!(worker, "Router worker stopped");
    }

    /// Starts the worker pool.
    pub fn spawn_workers(self: &Arc<Self>, tracker: &TaskTracker, cancel: &CancellationToken) {
        for worker in 0..self.conf.workers {
            let agent = Arc::clone(self);
            tracker.spawn(agent.worker_loop(worker, cancel.clone()));
        }
    }

    /// Runs the agent until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> AgentResult<()> {
        let tracker = TaskTracker::new();
        self.spawn_workers(&tracker, &cancel);

        {
            let agent = Arc::clone(&self);
            let cancel = cancel.clone();
            tracker.spawn(async move {
                let interval = agent.conf.ha_state_report_interval();
                agent
                    .ha_reporter
                    .run(agent.plugin_rpc.as_ref(), interval, cancel)
                    .await;
            });
        }

        if let Some(interval) = self.conf.report_interval() {
            let agent = Arc::clone(&self);
            tracker.spawn(agent.run_state_reporter(interval, cancel.clone()));
        }
        tracker.close();

        info!("L3 agent started");
        self.periodic_sync_routers_task().await;

        let period = self.conf.periodic_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.periodic_sync_routers_task().await,
            }
        }

        info!("L3 agent stopping");
        tracker.wait().await;
        Ok(())
    }
}

/// Asks the controller for its service plugins, retrying on timeouts.
///
/// A controller that does not implement the call yields `None`.
pub async fn fetch_service_plugins(plugin_rpc: &dyn PluginApi) -> AgentResult<Option<Vec<String>>> {
    for attempt in 1..=SERVICE_PLUGIN_RETRIES {
        match plugin_rpc.get_service_plugin_list().await {
            Ok(plugins) => {
                debug!(plugins = ?plugins, "Controller service plugins");
                return Ok(Some(plugins));
            }
            Err(e) if e.is_timeout() => {
                if attempt == SERVICE_PLUGIN_RETRIES {
                    error!(error = %e, "Failed to get service plugin list from the controller");
                    return Err(e.into());
                }
                warn!(
                    attempt,
                    retries = SERVICE_PLUGIN_RETRIES,
                    "Timed out retrieving service plugin list, retrying"
                );
            }
            Err(e @ l3_agent_common::RpcError::Remote { .. }) => {
                warn!(
                    error = %e,
                    "Cannot check service plugins enabled at the controller, \
                     it probably runs an older version"
                );
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(None)
}

//! Batched reporting of HA router state changes.
//!
//! State changes arrive one router at a time; only the latest state per
//! router is kept and the accumulated map is sent in one call per batching
//! window.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use l3_agent_common::{PluginApi, RpcError};
use l3_agent_types::{HaState, RouterId};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct ReporterState {
    monitored: HashSet<RouterId>,
    pending: HashMap<RouterId, HaState>,
}

/// Collects HA state changes and flushes them to the controller
#[derive(Debug, Default)]
pub struct HaStateReporter {
    state: Mutex<ReporterState>,
}

impl HaStateReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts accepting state changes for a router.
    pub fn register(&self, router_id: &str) {
        self.state.lock().monitored.insert(router_id.to_string());
        debug!(router_id, "HA state monitoring started");
    }

    /// Stops accepting state changes for a router and drops any pending one.
    pub fn unregister(&self, router_id: &str) {
        let mut state = self.state.lock();
        state.monitored.remove(router_id);
        state.pending.remove(router_id);
        debug!(router_id, "HA state monitoring stopped");
    }

    pub fn is_registered(&self, router_id: &str) -> bool {
        self.state.lock().monitored.contains(router_id)
    }

    /// Records the latest state of a router. Changes for routers not being
    /// monitored are ignored; returns whether the change was recorded.
    pub fn enqueue_state_change(&self, router_id: &str, ha_state: HaState) -> bool {
        let mut state = self.state.lock();
        if !state.monitored.contains(router_id) {
            debug!(router_id, state = %ha_state, "Ignoring state change of unmonitored router");
            return false;
        }
        info!(router_id, state = %ha_state, "Router transitioned");
        state.pending.insert(router_id.to_string(), ha_state);
        true
    }

    /// Pending changes not yet sent.
    pub fn pending(&self) -> HashMap<RouterId, HaState> {
        self.state.lock().pending.clone()
    }

    /// Sends the pending changes. On failure they are put back unless a
    /// newer change for the same router arrived meanwhile.
    pub async fn flush(&self, plugin_rpc: &dyn PluginApi) -> Result<usize, RpcError> {
        let batch = std::mem::take(&mut self.state.lock().pending);
        if batch.is_empty() {
            return Ok(0);
        }
        match plugin_rpc.update_ha_routers_states(&batch).await {
            Ok(()) => {
                debug!(count = batch.len(), "Reported HA router states");
                Ok(batch.len())
            }
            Err(e) => {
                let mut state = self.state.lock();
                for (router_id, ha_state) in batch {
                    if state.monitored.contains(&router_id) {
                        state.pending.entry(router_id).or_insert(ha_state);
                    }
                }
                Err(e)
            }
        }
    }

    /// Flushes once per `interval` until cancelled, then a final time.
    pub async fn run(
        &self,
        plugin_rpc: &dyn PluginApi,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.flush(plugin_rpc).await {
                        warn!(error = %e, "Failed to report HA router states");
                    }
                }
            }
        }
        if let Err(e) = self.flush(plugin_rpc).await {
            warn!(error = %e, "Failed to report HA router states on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use l3_agent_common::AgentStateReport;
    use l3_agent_test::FakeController;
    use l3_agent_types::{FipStatus, RouterDocument};

    #[tokio::test]
    async fn test_latest_state_wins() {
        let reporter = HaStateReporter::new();
        reporter.register("r1");
        assert!(reporter.enqueue_state_change("r1", HaState::Backup));
        assert!(reporter.enqueue_state_change("r1", HaState::Master));
        assert!(!reporter.enqueue_state_change("r2", HaState::Master));

        let controller = FakeController::new();
        assert_eq!(reporter.flush(&controller).await.unwrap(), 1);
        let updates = controller.ha_state_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].get("r1"), Some(&HaState::Master));

        assert_eq!(reporter.flush(&controller).await.unwrap(), 0);
        assert_eq!(controller.ha_state_updates().len(), 1);
    }

    #[test]
    fn test_unregister_drops_pending() {
        let reporter = HaStateReporter::new();
        reporter.register("r1");
        reporter.enqueue_state_change("r1", HaState::Fault);
        reporter.unregister("r1");
        assert!(reporter.pending().is_empty());
        assert!(!reporter.is_registered("r1"));
    }

    struct FailingController;

    #[async_trait]
    impl PluginApi for FailingController {
        async fn get_routers(
            &self,
            _router_ids: Option<&[RouterId]>,
        ) -> Result<Vec<RouterDocument>, RpcError> {
            Ok(Vec::new())
        }

        async fn get_external_network_id(&self) -> Result<Option<String>, RpcError> {
            Ok(None)
        }

        async fn update_floatingip_statuses(
            &self,
            _router_id: &str,
            _statuses: &HashMap<String, FipStatus>,
        ) -> Result<(), RpcError> {
            Ok(())
        }

        async fn get_service_plugin_list(&self) -> Result<Vec<String>, RpcError> {
            Ok(Vec::new())
        }

        async fn update_ha_routers_states(
            &self,
            _states: &HashMap<RouterId, HaState>,
        ) -> Result<(), RpcError> {
            Err(RpcError::timeout("update_ha_routers_states"))
        }

        async fn report_state(&self, _report: &AgentStateReport) -> Result<(), RpcError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_flush_is_retried() {
        let reporter = HaStateReporter::new();
        reporter.register("r1");
        reporter.enqueue_state_change("r1", HaState::Master);

        assert!(reporter.flush(&FailingController).await.is_err());
        assert_eq!(reporter.pending().get("r1"), Some(&HaState::Master));

        let controller = FakeController::new();
        assert_eq!(reporter.flush(&controller).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_batches_until_cancelled() {
        let reporter = std::sync::Arc::new(HaStateReporter::new());
        let controller = std::sync::Arc::new(FakeController::new());
        let cancel = CancellationToken::new();
        reporter.register("r1");
        reporter.register("r2");

        let task = {
            let reporter = reporter.clone();
            let controller = controller.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                reporter
                    .run(controller.as_ref(), Duration::from_millis(200), cancel)
                    .await
            })
        };
        tokio::task::yield_now().await;

        reporter.enqueue_state_change("r1", HaState::Master);
        reporter.enqueue_state_change("r2", HaState::Backup);
        tokio::time::sleep(Duration::from_millis(250)).await;

        cancel.cancel();
        task.await.unwrap();

        let updates = controller.ha_state_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].len(), 2);
    }
}

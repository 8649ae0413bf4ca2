//! Periodic agent state reports.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use l3_agent_common::{AgentConfigurations, AgentStateReport};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::L3Agent;

/// Reporting state carried between reports
#[derive(Debug)]
pub struct ReportState {
    start_flag: AtomicBool,
    disabled: AtomicBool,
}

impl ReportState {
    pub fn new() -> Self {
        Self {
            start_flag: AtomicBool::new(true),
            disabled: AtomicBool::new(false),
        }
    }

    /// True until the first report is accepted.
    pub fn start_flag(&self) -> bool {
        self.start_flag.load(Ordering::SeqCst)
    }

    /// True once the controller turned out not to support reports.
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }
}

impl Default for ReportState {
    fn default() -> Self {
        Self::new()
    }
}

impl L3Agent {
    /// Settings and counters of the current report.
    pub async fn collect_configurations(&self) -> AgentConfigurations {
        let conf = self.conf();
        let mut configurations = AgentConfigurations {
            use_namespaces: conf.use_namespaces,
            router_id: conf.router_id.clone(),
            handle_internal_only_routers: conf.handle_internal_only_routers,
            external_network_bridge: conf.external_network_bridge.clone(),
            gateway_external_network_id: conf.gateway_external_network_id.clone(),
            interface_driver: conf.interface_driver.clone().unwrap_or_default(),
            agent_mode: conf.agent_mode.to_string(),
            ..Default::default()
        };

        let handles = self.registry.values();
        configurations.routers = handles.len();
        for handle in handles {
            let (ex_gw_ports, interfaces, floating_ips) = handle.lock().await.report_counts();
            configurations.ex_gw_ports += ex_gw_ports;
            configurations.interfaces += interfaces;
            configurations.floating_ips += floating_ips;
        }
        configurations
    }

    /// Sends one state report.
    ///
    /// Returns false once reporting is disabled.
    pub async fn report_state(&self) -> bool {
        if self.report_state.is_disabled() {
            return false;
        }
        let mut report = AgentStateReport::new(
            self.conf().host.clone(),
            self.collect_configurations().await,
        );
        report.start_flag = self.report_state.start_flag();

        match self.plugin_rpc.report_state(&report).await {
            Ok(()) => {
                self.report_state.start_flag.store(false, Ordering::SeqCst);
                debug!(routers = report.configurations.routers, "Agent state reported");
                true
            }
            Err(e) if e.is_unsupported() => {
                warn!(
                    error = %e,
                    "Controller does not support state report. State report for this agent will be disabled."
                );
                self.report_state.disabled.store(true, Ordering::SeqCst);
                false
            }
            Err(e) => {
                warn!(error = %e, "Failed reporting state!");
                true
            }
        }
    }

    /// Reports every `interval` until cancelled or disabled.
    pub async fn run_state_reporter(
        self: std::sync::Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if !self.report_state().await {
                        info!("State reporting stopped");
                        break;
                    }
                }
            }
        }
    }
}

//! Agent integration tests
//!
//! Drive the agent end to end against the in-memory controller and driver:
//! notifications and full syncs go through the update queue and the router
//! lifecycle, and the tests check what reached the driver and controller.

use std::sync::Arc;
use std::time::Duration;

use l3_agent_common::iptables::TAG_PORTFORWARDING;
use l3_agent_common::{AgentError, RecordingExecutor, RpcError};
use l3_agent_test::{
    dvr_ha_router, dvr_router, ha_router, internal_only_router, legacy_router, tcp_forward,
    DriverCall, FakeController, FakeDriver, RouterBuilder, EXT_NET_ID, GATEWAY_IP,
};
use l3_agent_types::{FipStatus, HaState};
use l3_agentd::namespace_manager::NamespaceManager;
use l3_agentd::{
    AgentConfig, L3Agent, RouterEvent, RouterInfo, RouterRemovedPayload, RouterUpdate,
    RoutersPayload, UpdatePriority,
};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

struct TestEnv {
    controller: Arc<FakeController>,
    driver: Arc<FakeDriver>,
    executor: Arc<RecordingExecutor>,
}

impl TestEnv {
    fn new() -> Self {
        Self {
            controller: Arc::new(FakeController::new()),
            driver: Arc::new(FakeDriver::new()),
            executor: Arc::new(RecordingExecutor::new()),
        }
    }

    async fn agent(&self) -> Arc<L3Agent> {
        self.agent_with(base_config()).await
    }

    async fn agent_with(&self, conf: AgentConfig) -> Arc<L3Agent> {
        L3Agent::new(
            conf,
            self.controller.clone(),
            self.driver.clone(),
            self.executor.clone(),
        )
        .await
        .expect("agent starts")
    }
}

fn base_config() -> AgentConfig {
    AgentConfig {
        host: "node-1".to_string(),
        interface_driver: Some("ovs".to_string()),
        report_interval_secs: 0,
        ..Default::default()
    }
}

fn ids(ids: &[&str]) -> RoutersPayload {
    RoutersPayload::Ids(ids.iter().map(|id| id.to_string()).collect())
}

async fn full_sync(agent: &L3Agent) {
    agent.periodic_sync_routers_task().await;
    agent.process_pending_updates().await;
}

#[tokio::test]
async fn test_initial_full_sync_builds_routers() {
    let env = TestEnv::new();
    env.controller.set_router(legacy_router("r1"));
    env.controller.set_router(internal_only_router("r2"));
    let agent = env.agent().await;
    assert!(agent.fullsync());

    full_sync(&agent).await;

    assert!(!agent.fullsync());
    assert_eq!(agent.registry().router_ids().len(), 2);
    assert!(agent.queue().is_empty());
    assert!(env.driver.has_namespace("qrouter-r1"));
    assert!(env.driver.has_namespace("qrouter-r2"));
    assert!(env.driver.has_device(Some("qrouter-r1"), "qg-gw-r1"));
    assert!(env.driver.has_device(Some("qrouter-r1"), "qr-r1-p1"));
    assert_eq!(
        env.driver.addresses(Some("qrouter-r1"), "qr-r1-p1"),
        vec!["10.0.0.1/24"]
    );
    // the sync carries the documents, so no per-router fetch happens
    assert_eq!(env.controller.get_routers_calls(), vec![None]);
}

#[tokio::test]
async fn test_second_sync_only_when_flagged() {
    let env = TestEnv::new();
    env.controller.set_router(legacy_router("r1"));
    let agent = env.agent().await;
    full_sync(&agent).await;

    full_sync(&agent).await;
    assert_eq!(env.controller.get_routers_calls().len(), 1);

    agent.agent_updated(&serde_json::json!({"admin_state_up": true}));
    full_sync(&agent).await;
    assert_eq!(env.controller.get_routers_calls().len(), 2);
    assert!(!agent.fullsync());
}

#[tokio::test]
async fn test_sync_enqueues_delete_for_vanished_router() {
    let env = TestEnv::new();
    env.controller.set_router(legacy_router("r1"));
    env.controller.set_router(legacy_router("r2"));
    let agent = env.agent().await;
    full_sync(&agent).await;

    env.controller.remove_router("r1");
    let mut ns_manager = NamespaceManager::new(true);
    ns_manager.begin(env.driver.as_ref()).await.unwrap();
    agent
        .fetch_and_sync_all_routers(&mut ns_manager)
        .await
        .unwrap();

    let pending = agent.queue().pending("r1");
    assert_eq!(pending.len(), 1);
    assert!(pending[0].is_delete());
    assert_eq!(pending[0].priority, UpdatePriority::SyncTask);
    assert!(ns_manager.is_kept("r1"));
    assert!(ns_manager.is_kept("r2"));
    assert!(!agent.queue().pending("r2")[0].is_delete());

    agent.process_pending_updates().await;
    assert!(!agent.registry().contains("r1"));
    assert!(agent.registry().contains("r2"));
    assert!(!env.driver.has_namespace("qrouter-r1"));

    // the delete was kept out of the snapshot cleanup
    assert!(ns_manager.finish(env.driver.as_ref()).await.is_empty());
}

#[tokio::test]
async fn test_first_sync_cleans_stale_namespaces() {
    let env = TestEnv::new();
    env.driver.add_namespace("qrouter-stale");
    env.driver.add_namespace("qrouter-r1");
    env.controller.set_router(legacy_router("r1"));
    let agent = env.agent().await;

    full_sync(&agent).await;

    assert!(!env.driver.has_namespace("qrouter-stale"));
    assert!(env.driver.has_namespace("qrouter-r1"));
}

#[tokio::test]
async fn test_fetch_failure_keeps_fullsync() {
    let env = TestEnv::new();
    env.driver.add_namespace("qrouter-stale");
    env.controller.set_router(legacy_router("r1"));
    env.controller
        .fail_get_routers(RpcError::Messaging("connection reset".to_string()));
    let agent = env.agent().await;

    full_sync(&agent).await;
    assert!(agent.fullsync());
    assert!(agent.registry().is_empty());
    assert!(env.driver.has_namespace("qrouter-stale"));

    env.controller.clear_get_routers_failure();
    full_sync(&agent).await;
    assert!(!agent.fullsync());
    assert!(agent.registry().contains("r1"));
    assert!(!env.driver.has_namespace("qrouter-stale"));
}

#[tokio::test]
async fn test_fetch_and_sync_signals_abort() {
    let env = TestEnv::new();
    env.controller.fail_get_routers(RpcError::timeout("get_routers"));
    let agent = env.agent().await;

    let mut ns_manager = NamespaceManager::new(true);
    let err = agent
        .fetch_and_sync_all_routers(&mut ns_manager)
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::AbortSyncRouters));
    assert!(agent.queue().is_empty());
}

#[tokio::test]
async fn test_router_update_fetches_document() {
    let env = TestEnv::new();
    let agent = env.agent().await;
    full_sync(&agent).await;

    env.controller.set_router(legacy_router("r1"));
    agent.routers_updated(ids(&["r1"]));
    agent.process_pending_updates().await;

    assert!(agent.registry().contains("r1"));
    assert_eq!(
        env.controller.get_routers_calls().last().cloned(),
        Some(Some(vec!["r1".to_string()]))
    );
    assert!(agent.queue().is_empty());
}

#[tokio::test]
async fn test_per_router_fetch_failure_sets_fullsync() {
    let env = TestEnv::new();
    let agent = env.agent().await;
    full_sync(&agent).await;

    env.controller.fail_get_routers(RpcError::timeout("get_routers"));
    agent.routers_updated(ids(&["r1"]));
    agent.process_pending_updates().await;

    assert!(agent.fullsync());
    assert!(agent.registry().is_empty());
    assert!(agent.queue().is_empty());
    assert!(!agent.queue().is_leased("r1"));
}

#[tokio::test]
async fn test_router_gone_upstream_is_removed() {
    let env = TestEnv::new();
    env.controller.set_router(legacy_router("r1"));
    let agent = env.agent().await;
    full_sync(&agent).await;

    env.controller.remove_router("r1");
    agent.routers_updated(ids(&["r1"]));
    agent.process_pending_updates().await;

    assert!(agent.registry().is_empty());
    assert!(!env.driver.has_namespace("qrouter-r1"));
    assert!(!agent.fullsync());
}

#[tokio::test]
async fn test_router_deleted_notifications() {
    let env = TestEnv::new();
    env.controller.set_router(legacy_router("r1"));
    env.controller.set_router(legacy_router("r2"));
    let agent = env.agent().await;
    full_sync(&agent).await;
    let fetches = env.controller.get_routers_calls().len();

    agent.router_deleted("r1");
    agent.router_removed_from_agent(RouterRemovedPayload {
        router_id: "r2".to_string(),
    });
    agent.router_deleted("ghost");
    agent.process_pending_updates().await;

    assert!(agent.registry().is_empty());
    assert!(!agent.fullsync());
    // deletions never fetch
    assert_eq!(env.controller.get_routers_calls().len(), fetches);
}

#[tokio::test]
async fn test_dvr_ha_router_is_never_registered() {
    let env = TestEnv::new();
    let agent = env.agent().await;
    full_sync(&agent).await;

    env.controller.set_router(dvr_ha_router("r1"));
    agent.router_added_to_agent(ids(&["r1"]));
    agent.process_pending_updates().await;

    assert!(!agent.registry().contains("r1"));
    assert!(!env.driver.has_namespace("qrouter-r1"));
    assert!(agent.fullsync());
    assert!(agent.queue().is_empty());
}

#[tokio::test]
async fn test_internal_only_router_rejected_and_removed() {
    let env = TestEnv::new();
    env.controller.set_router(legacy_router("r1"));
    let agent = env
        .agent_with(AgentConfig {
            handle_internal_only_routers: false,
            ..base_config()
        })
        .await;
    full_sync(&agent).await;
    assert!(agent.registry().contains("r1"));

    env.controller.set_router(internal_only_router("r1"));
    agent.routers_updated(ids(&["r1"]));
    agent.process_pending_updates().await;

    assert!(!agent.registry().contains("r1"));
    assert!(!env.driver.has_namespace("qrouter-r1"));
    assert!(!agent.fullsync());
    assert!(agent.queue().is_empty());
}

#[tokio::test]
async fn test_restricted_router_id() {
    let env = TestEnv::new();
    env.controller.set_router(legacy_router("r1"));
    env.controller.set_router(legacy_router("r2"));
    let agent = env
        .agent_with(AgentConfig {
            use_namespaces: false,
            router_id: Some("r1".to_string()),
            ..base_config()
        })
        .await;

    full_sync(&agent).await;
    assert_eq!(
        env.controller.get_routers_calls(),
        vec![Some(vec!["r1".to_string()])]
    );
    assert_eq!(agent.registry().router_ids(), vec!["r1".to_string()]);
    assert!(env.driver.has_device(None, "qg-gw-r1"));

    agent.routers_updated(ids(&["r2"]));
    agent.process_pending_updates().await;
    assert!(!agent.registry().contains("r2"));
    assert!(!agent.fullsync());
}

#[tokio::test]
async fn test_external_network_conflict_rechecked() {
    let env = TestEnv::new();
    env.controller.set_router(legacy_router("r1"));
    let agent = env.agent().await;
    full_sync(&agent).await;
    assert!(agent.registry().contains("r1"));
    assert_eq!(env.controller.external_network_calls(), 1);

    // The controller moved to another external network: the cached answer
    // is stale and a forced check accepts the router.
    env.controller.set_external_network_ids(vec!["ext-2".to_string()]);
    env.controller.set_router(
        RouterBuilder::new("r2")
            .with_gateway_on("ext-2", "192.0.2.2")
            .build(),
    );
    agent.routers_updated(ids(&["r2"]));
    agent.process_pending_updates().await;
    assert!(agent.registry().contains("r2"));
    assert_eq!(env.controller.external_network_calls(), 2);

    // A router on the old network is now a real conflict.
    env.controller.set_router(legacy_router("r3"));
    agent.routers_updated(ids(&["r3"]));
    agent.process_pending_updates().await;
    assert!(!agent.registry().contains("r3"));
    assert_eq!(env.controller.external_network_calls(), 3);
    assert!(!agent.fullsync());
}

#[tokio::test]
async fn test_too_many_external_networks() {
    let env = TestEnv::new();
    env.controller
        .set_external_network_ids(vec!["ext-a".to_string(), "ext-b".to_string()]);
    let agent = env.agent().await;

    let err = agent.fetch_external_net_id(false).await.unwrap_err();
    assert!(matches!(err, AgentError::TooManyExternalNetworks));

    env.controller.set_router(legacy_router("r1"));
    full_sync(&agent).await;
    assert!(!agent.registry().contains("r1"));
    assert!(agent.fullsync());
}

#[tokio::test]
async fn test_configured_external_network_skips_controller() {
    let env = TestEnv::new();
    env.controller.set_router(legacy_router("r1"));
    let agent = env
        .agent_with(AgentConfig {
            gateway_external_network_id: Some(EXT_NET_ID.to_string()),
            ..base_config()
        })
        .await;
    full_sync(&agent).await;

    assert!(agent.registry().contains("r1"));
    assert_eq!(env.controller.external_network_calls(), 0);
}

#[tokio::test]
async fn test_without_bridge_any_network_is_served() {
    let env = TestEnv::new();
    env.controller
        .set_external_network_ids(vec!["ext-a".to_string(), "ext-b".to_string()]);
    env.controller.set_router(legacy_router("r1"));
    let agent = env
        .agent_with(AgentConfig {
            external_network_bridge: String::new(),
            ..base_config()
        })
        .await;
    full_sync(&agent).await;

    assert!(agent.registry().contains("r1"));
    assert_eq!(env.controller.external_network_calls(), 0);
}

#[tokio::test]
async fn test_missing_external_bridge_skips_update() {
    let env = TestEnv::new();
    env.driver.remove_device(None, "br-ex");
    env.controller.set_router(legacy_router("r1"));
    let agent = env.agent().await;

    full_sync(&agent).await;

    assert!(agent.registry().is_empty());
    assert!(!agent.fullsync());
    assert!(agent.queue().is_empty());
    assert!(!env.driver.has_namespace("qrouter-r1"));
}

#[tokio::test]
async fn test_failed_create_unregisters_router() {
    let env = TestEnv::new();
    env.driver.fail_on("plug", "qr-r1-p1");
    env.controller.set_router(legacy_router("r1"));
    let agent = env.agent().await;

    full_sync(&agent).await;

    assert!(!agent.registry().contains("r1"));
    assert!(!env.driver.has_namespace("qrouter-r1"));
    assert!(agent.fullsync());

    env.driver.clear_failures();
    full_sync(&agent).await;
    assert!(agent.registry().contains("r1"));
    assert!(!agent.fullsync());
}

#[tokio::test]
async fn test_port_forward_inside_address_change_replaces_rule() {
    let env = TestEnv::new();
    let doc = RouterBuilder::new("r1")
        .with_gateway(GATEWAY_IP)
        .with_port_forward(tcp_forward(80, "10.0.0.5", 8080))
        .build();
    env.controller.set_router(doc);
    let agent = env.agent().await;
    full_sync(&agent).await;

    let updated = RouterBuilder::new("r1")
        .with_gateway(GATEWAY_IP)
        .with_port_forward(tcp_forward(80, "10.0.0.6", 8080))
        .build();
    env.controller.set_router(updated);
    agent.routers_updated(ids(&["r1"]));
    agent.process_pending_updates().await;

    let handle = agent.registry().get("r1").unwrap();
    let ri = handle.lock().await;
    let rules: Vec<String> = ri
        .iptables
        .rules_by_tag(TAG_PORTFORWARDING)
        .map(|r| r.rule.clone())
        .collect();
    assert_eq!(
        rules,
        vec!["-p tcp -d 172.24.4.2 --dport 80 -j DNAT --to 10.0.0.6:8080"]
    );
    assert_eq!(ri.portforwardings.len(), 1);
    assert_eq!(ri.portforwardings[0].inside_addr, "10.0.0.6");
}

#[tokio::test]
async fn test_fetched_state_supersedes_older_sync_snapshot() {
    let env = TestEnv::new();
    let agent = env.agent().await;
    full_sync(&agent).await;

    agent.routers_updated(ids(&["r1"]));
    let notified_at = agent.queue().pending("r1")[0].timestamp;

    let snapshot = RouterBuilder::new("r1")
        .with_gateway(GATEWAY_IP)
        .with_port_forward(tcp_forward(80, "10.0.0.5", 8080))
        .build();
    agent.queue().add(
        RouterUpdate::new("r1", UpdatePriority::SyncTask)
            .with_router(snapshot)
            .with_timestamp(notified_at + chrono::Duration::microseconds(1)),
    );
    assert_eq!(agent.queue().pending("r1").len(), 2);
    tokio::time::sleep(Duration::from_millis(5)).await;

    let current = RouterBuilder::new("r1")
        .with_gateway(GATEWAY_IP)
        .with_port_forward(tcp_forward(80, "10.0.0.6", 8080))
        .build();
    env.controller.set_router(current);
    agent.process_pending_updates().await;

    assert!(agent.queue().is_empty());
    let handle = agent.registry().get("r1").unwrap();
    let ri = handle.lock().await;
    let inside: Vec<&str> = ri
        .portforwardings
        .iter()
        .map(|pf| pf.inside_addr.as_str())
        .collect();
    assert_eq!(inside, vec!["10.0.0.6"]);
}

#[tokio::test]
async fn test_removed_router_retracts_port_forwards() {
    let env = TestEnv::new();
    let doc = RouterBuilder::new("r1")
        .with_gateway(GATEWAY_IP)
        .with_port_forward(tcp_forward(22, "10.0.0.2", 22))
        .build();
    env.controller.set_router(doc);
    let agent = env.agent().await;
    full_sync(&agent).await;
    env.executor.clear();

    agent.router_deleted("r1");
    agent.process_pending_updates().await;

    let restore = env
        .executor
        .commands()
        .into_iter()
        .filter(|c| c.command.contains("iptables-restore"))
        .last()
        .expect("nat table committed");
    assert!(!restore.input.unwrap_or_default().contains("DNAT"));
    assert!(agent.registry().is_empty());
}

#[tokio::test]
async fn test_floating_ip_statuses_reported() {
    let env = TestEnv::new();
    let doc = RouterBuilder::new("r1")
        .with_gateway(GATEWAY_IP)
        .with_floating_ip("fip-1", "172.24.4.10", "10.0.0.5")
        .with_floating_ip("fip-2", "172.24.4.11", "10.0.0.6")
        .build();
    env.controller.set_router(doc);
    let agent = env.agent().await;
    full_sync(&agent).await;

    let (router_id, statuses) = env.controller.fip_status_updates().pop().unwrap();
    assert_eq!(router_id, "r1");
    assert_eq!(statuses.get("fip-1"), Some(&FipStatus::Active));
    assert_eq!(statuses.get("fip-2"), Some(&FipStatus::Active));

    let doc = RouterBuilder::new("r1")
        .with_gateway(GATEWAY_IP)
        .with_floating_ip("fip-1", "172.24.4.10", "10.0.0.5")
        .build();
    env.controller.set_router(doc);
    agent.routers_updated(ids(&["r1"]));
    agent.process_pending_updates().await;

    let (_, statuses) = env.controller.fip_status_updates().pop().unwrap();
    assert_eq!(statuses.get("fip-1"), Some(&FipStatus::Active));
    assert_eq!(statuses.get("fip-2"), Some(&FipStatus::Down));
}

#[tokio::test]
async fn test_ha_router_lifecycle() {
    let env = TestEnv::new();
    env.controller.set_router(ha_router("r1"));
    let agent = env.agent().await;
    full_sync(&agent).await;

    assert!(agent.ha_reporter().is_registered("r1"));
    assert!(env
        .driver
        .calls()
        .iter()
        .any(|c| matches!(c, DriverCall::EnableKeepalived(cfg) if cfg.router_id == "r1")));
    assert!(agent.enqueue_state_change("r1", HaState::Master));
    assert_eq!(agent.ha_reporter().pending().get("r1"), Some(&HaState::Master));

    agent.router_deleted("r1");
    agent.process_pending_updates().await;

    assert!(!agent.ha_reporter().is_registered("r1"));
    assert!(!agent.enqueue_state_change("r1", HaState::Backup));
    assert!(env
        .driver
        .calls()
        .contains(&DriverCall::DisableKeepalived("r1".to_string())));
    assert!(!env.driver.has_namespace("qrouter-r1"));
}

#[tokio::test]
async fn test_dvr_routers_share_fip_namespace() {
    let env = TestEnv::new();
    env.controller.set_router(dvr_router("r1"));
    env.controller.set_router(dvr_router("r2"));
    let agent = env.agent().await;
    full_sync(&agent).await;

    let fip_ns = format!("fip-{}", EXT_NET_ID);
    assert!(env.driver.has_namespace(&fip_ns));
    assert_eq!(
        agent.fip_namespaces().routers(EXT_NET_ID).await,
        vec!["r1", "r2"]
    );

    agent.router_deleted("r1");
    agent.process_pending_updates().await;
    assert!(env.driver.has_namespace(&fip_ns));

    agent.router_deleted("r2");
    agent.process_pending_updates().await;
    assert!(!env.driver.has_namespace(&fip_ns));
}

#[tokio::test]
async fn test_observers_see_lifecycle_in_order() {
    let env = TestEnv::new();
    env.controller.set_router(legacy_router("r1"));
    let agent = env.agent().await;
    let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
    {
        let events = events.clone();
        agent.observers().add(Arc::new(move |event: RouterEvent, ri: &RouterInfo| {
            events.lock().push((event, ri.router_id.clone()))
        }));
    }

    full_sync(&agent).await;
    agent.routers_updated(ids(&["r1"]));
    agent.process_pending_updates().await;
    agent.router_deleted("r1");
    agent.process_pending_updates().await;

    let seen: Vec<RouterEvent> = events.lock().iter().map(|(event, _)| *event).collect();
    assert_eq!(
        seen,
        vec![
            RouterEvent::BeforeAdd,
            RouterEvent::AfterAdd,
            RouterEvent::BeforeUpdate,
            RouterEvent::AfterUpdate,
            RouterEvent::BeforeRemove,
            RouterEvent::AfterRemove,
        ]
    );
    assert!(events.lock().iter().all(|(_, id)| id == "r1"));
}

#[tokio::test]
async fn test_state_report() {
    let env = TestEnv::new();
    env.controller.set_router(legacy_router("r1"));
    env.controller.set_router(internal_only_router("r2"));
    let agent = env.agent().await;
    full_sync(&agent).await;

    assert!(agent.report_state().await);
    assert!(agent.report_state().await);

    let reports = env.controller.reports();
    assert_eq!(reports.len(), 2);
    assert!(reports[0].start_flag);
    assert!(!reports[1].start_flag);
    let configurations = &reports[0].configurations;
    assert_eq!(reports[0].host, "node-1");
    assert_eq!(configurations.routers, 2);
    assert_eq!(configurations.ex_gw_ports, 1);
    assert_eq!(configurations.interfaces, 2);
    assert_eq!(configurations.floating_ips, 0);
    assert_eq!(configurations.agent_mode, "legacy");
    assert_eq!(configurations.interface_driver, "ovs");
}

#[tokio::test]
async fn test_state_report_disabled_when_unsupported() {
    let env = TestEnv::new();
    let agent = env.agent().await;

    env.controller
        .fail_report_state(RpcError::timeout("report_state"));
    assert!(agent.report_state().await);

    env.controller
        .fail_report_state(RpcError::remote("AttributeError", "no report_state"));
    assert!(!agent.report_state().await);
    assert!(!agent.report_state().await);
    assert!(env.controller.reports().is_empty());
}

#[tokio::test]
async fn test_startup_fails_on_messaging_error() {
    let env = TestEnv::new();
    env.controller
        .queue_service_plugin_error(RpcError::Messaging("broker unreachable".to_string()));
    let result = L3Agent::new(
        base_config(),
        env.controller.clone(),
        env.driver.clone(),
        env.executor.clone(),
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_workers_never_process_a_router_twice_at_once() {
    let env = TestEnv::new();
    for i in 0..6 {
        env.controller.set_router(legacy_router(&format!("r{}", i)));
    }
    env.driver.set_delay(Duration::from_millis(2));
    let agent = env
        .agent_with(AgentConfig {
            workers: 4,
            ..base_config()
        })
        .await;

    let cancel = CancellationToken::new();
    let runner = tokio::spawn(agent.clone().run(cancel.clone()));

    for _ in 0..5 {
        agent.routers_updated(ids(&["r0", "r1", "r2", "r3", "r4", "r5"]));
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let idle = agent.queue().is_empty()
            && (0..6).all(|i| !agent.queue().is_leased(&format!("r{}", i)));
        if idle && agent.registry().len() == 6 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "agent did not settle");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    cancel.cancel();
    runner.await.unwrap().unwrap();
    assert!(!env.driver.overlap_detected());
    assert!(!agent.fullsync());
}

//! Port-forwarding reconciliation.
//!
//! Only inbound DNAT rules are installed; replies are handled by connection
//! tracking. The applied rule set is replaced wholesale after every pass.

use l3_agent_common::iptables::TAG_PORTFORWARDING;
use l3_agent_common::AgentResult;
use l3_agent_types::{PortForwardRule, RouterPort};
use tracing::{debug, info};

use crate::commands::build_dnat_rule;
use crate::diff::{diff_unordered, Diff};
use crate::router::RouterInfo;

/// Chain the DNAT rules live in.
pub const PORTFORWARDING_CHAIN: &str = "PREROUTING";

/// Desired rules with their outside address bound to the gateway's first
/// fixed IP.
pub fn bind_outside_addr(rules: &[PortForwardRule], ex_gw_port: &RouterPort) -> Vec<PortForwardRule> {
    match ex_gw_port.first_ip() {
        Some(addr) => rules.iter().map(|rule| rule.with_outside_addr(addr)).collect(),
        None => Vec::new(),
    }
}

impl RouterInfo {
    /// Converges the router's DNAT rules with its port-forwarding entries.
    ///
    /// Routers without the port-forwarding capability are left alone.
    /// Without a gateway every applied rule is retracted.
    pub async fn process_router_portforwardings(
        &mut self,
        ex_gw_port: Option<&RouterPort>,
    ) -> AgentResult<Diff<PortForwardRule>> {
        let Some(rules) = self.router.portforwardings.as_ref() else {
            return Ok(Diff::default());
        };
        let desired = match ex_gw_port {
            Some(gw) => bind_outside_addr(rules, gw),
            None => Vec::new(),
        };

        let diff = diff_unordered(&self.portforwardings, &desired);
        for rule in &diff.removes {
            let spec = build_dnat_rule(rule)?;
            self.iptables
                .remove_rule(PORTFORWARDING_CHAIN, &spec, TAG_PORTFORWARDING);
            info!(router_id = %self.router_id, rule = %rule, "Port forwarding removed");
        }
        for rule in &diff.adds {
            let spec = build_dnat_rule(rule)?;
            self.iptables
                .add_rule(PORTFORWARDING_CHAIN, spec, TAG_PORTFORWARDING)?;
            info!(router_id = %self.router_id, rule = %rule, "Port forwarding added");
        }
        self.iptables.apply().await?;

        debug!(
            router_id = %self.router_id,
            adds = diff.adds.len(),
            removes = diff.removes.len(),
            "Port forwardings processed"
        );
        self.portforwardings = desired;
        Ok(diff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use l3_agent_common::iptables::NatRule;
    use l3_agent_common::RecordingExecutor;
    use l3_agent_test::{tcp_forward, udp_forward, RouterBuilder, GATEWAY_IP};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn router(rules: Vec<PortForwardRule>) -> (RouterInfo, Arc<RecordingExecutor>) {
        let mut builder = RouterBuilder::new("r1")
            .with_gateway(GATEWAY_IP)
            .with_portforwarding();
        for rule in rules {
            builder = builder.with_port_forward(rule);
        }
        let executor = Arc::new(RecordingExecutor::new());
        let ri = RouterInfo::new(builder.build(), true, executor.clone()).unwrap();
        (ri, executor)
    }

    fn dnat_rules(ri: &RouterInfo) -> Vec<String> {
        ri.iptables
            .rules_by_tag(TAG_PORTFORWARDING)
            .map(|r: &NatRule| r.rule.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_rules_installed_with_gateway_address() {
        let (mut ri, executor) = router(vec![tcp_forward(80, "10.0.0.5", 8080)]);
        let gw = ri.router.gw_port.clone();

        let diff = ri.process_router_portforwardings(gw.as_ref()).await.unwrap();
        assert_eq!(diff.adds.len(), 1);
        assert_eq!(
            dnat_rules(&ri),
            vec!["-p tcp -d 172.24.4.2 --dport 80 -j DNAT --to 10.0.0.5:8080"]
        );
        assert_eq!(
            ri.portforwardings[0].outside_addr.as_deref(),
            Some(GATEWAY_IP)
        );

        let restore = executor.commands().pop().unwrap();
        assert!(restore.command.contains("iptables-restore"));
        assert!(restore
            .input
            .unwrap()
            .contains("-A l3-agent-PREROUTING -p tcp -d 172.24.4.2 --dport 80"));
    }

    #[tokio::test]
    async fn test_second_pass_has_no_deltas() {
        let (mut ri, executor) = router(vec![
            tcp_forward(80, "10.0.0.5", 8080),
            udp_forward(53, "10.0.0.9", 5353),
        ]);
        let gw = ri.router.gw_port.clone();
        ri.process_router_portforwardings(gw.as_ref()).await.unwrap();
        let applied = executor.commands().len();

        let diff = ri.process_router_portforwardings(gw.as_ref()).await.unwrap();
        assert!(diff.is_empty());
        assert_eq!(executor.commands().len(), applied);
        assert_eq!(ri.portforwardings.len(), 2);
    }

    #[tokio::test]
    async fn test_inside_address_change_replaces_rule() {
        let (mut ri, _) = router(vec![tcp_forward(80, "10.0.0.5", 8080)]);
        let gw = ri.router.gw_port.clone();
        ri.process_router_portforwardings(gw.as_ref()).await.unwrap();

        ri.router.portforwardings = Some(vec![tcp_forward(80, "10.0.0.6", 8080)]);
        let diff = ri.process_router_portforwardings(gw.as_ref()).await.unwrap();

        assert_eq!(diff.removes[0].inside_addr, "10.0.0.5");
        assert_eq!(diff.adds[0].inside_addr, "10.0.0.6");
        assert_eq!(
            dnat_rules(&ri),
            vec!["-p tcp -d 172.24.4.2 --dport 80 -j DNAT --to 10.0.0.6:8080"]
        );
    }

    #[tokio::test]
    async fn test_no_gateway_removes_everything() {
        let (mut ri, _) = router(vec![tcp_forward(80, "10.0.0.5", 8080)]);
        let gw = ri.router.gw_port.clone();
        ri.process_router_portforwardings(gw.as_ref()).await.unwrap();

        let diff = ri.process_router_portforwardings(None).await.unwrap();
        assert_eq!(diff.removes.len(), 1);
        assert!(diff.adds.is_empty());
        assert!(dnat_rules(&ri).is_empty());
        assert!(ri.portforwardings.is_empty());
    }

    #[tokio::test]
    async fn test_without_capability_is_noop() {
        let executor = Arc::new(RecordingExecutor::new());
        let doc = RouterBuilder::new("r1").with_gateway(GATEWAY_IP).build();
        let mut ri = RouterInfo::new(doc, true, executor.clone()).unwrap();
        let gw = ri.router.gw_port.clone();

        let diff = ri.process_router_portforwardings(gw.as_ref()).await.unwrap();
        assert!(diff.is_empty());
        assert!(executor.commands().is_empty());
    }

    #[tokio::test]
    async fn test_only_dnat_rules_installed() {
        let (mut ri, _) = router(vec![tcp_forward(22, "10.0.0.2", 22)]);
        let gw = ri.router.gw_port.clone();
        ri.process_router_portforwardings(gw.as_ref()).await.unwrap();
        assert!(ri
            .iptables
            .rules()
            .iter()
            .all(|r| r.chain == PORTFORWARDING_CHAIN && r.rule.contains("DNAT")));
    }
}

//! NAT rule table of one router.
//!
//! Rules are kept in memory in agent-owned chains of the `nat` table and
//! committed with a single `iptables-restore --noflush` run, so the kernel
//! never observes a half-applied rule set. Every rule carries a tag so that
//! a whole class of rules (floating IPs, port forwarding, SNAT) can be
//! retracted at once.

use std::fmt::Write as _;
use std::sync::Arc;

use crate::error::{AgentError, AgentResult};
use crate::shell::{shellquote, CommandExecutor, IPTABLES_RESTORE_CMD, IP_CMD};

/// Prefix of every chain owned by the agent.
pub const CHAIN_PREFIX: &str = "l3-agent-";

/// Chains managed in the nat table, by unwrapped name.
pub const MANAGED_CHAINS: [&str; 5] = ["PREROUTING", "OUTPUT", "POSTROUTING", "snat", "float-snat"];

/// Tag of rules installed for floating IPs.
pub const TAG_FLOATING_IP: &str = "floating_ip";
/// Tag of rules installed for port forwarding.
pub const TAG_PORTFORWARDING: &str = "portforwarding";
/// Tag of the default SNAT rule.
pub const TAG_SNAT: &str = "snat";

/// Returns the agent-owned name of a managed chain.
pub fn wrap_chain(chain: &str) -> String {
    format!("{}{}", CHAIN_PREFIX, chain)
}

/// One rule in a managed chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatRule {
    /// Unwrapped chain name.
    pub chain: String,
    /// Rule specification without the `-A <chain>` prefix.
    pub rule: String,
    pub tag: String,
}

/// In-memory nat table of one router namespace.
pub struct IptablesManager {
    namespace: Option<String>,
    executor: Arc<dyn CommandExecutor>,
    rules: Vec<NatRule>,
    dirty: bool,
    applied_once: bool,
}

impl std::fmt::Debug for IptablesManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IptablesManager")
            .field("namespace", &self.namespace)
            .field("rules", &self.rules.len())
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl IptablesManager {
    /// Creates an empty table for the given namespace (`None` = root).
    pub fn new(namespace: Option<String>, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            namespace,
            executor,
            rules: Vec::new(),
            dirty: false,
            applied_once: false,
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Adds a rule; adding an identical rule twice is a no-op.
    pub fn add_rule(&mut self, chain: &str, rule: impl Into<String>, tag: &str) -> AgentResult<()> {
        check_chain(chain)?;
        let rule = NatRule {
            chain: chain.to_string(),
            rule: rule.into(),
            tag: tag.to_string(),
        };
        if !self.rules.contains(&rule) {
            self.rules.push(rule);
            self.dirty = true;
        }
        Ok(())
    }

    /// Removes a rule; returns false if it was not present.
    pub fn remove_rule(&mut self, chain: &str, rule: &str, tag: &str) -> bool {
        let before = self.rules.len();
        self.rules
            .retain(|r| !(r.chain == chain && r.rule == rule && r.tag == tag));
        let removed = self.rules.len() != before;
        self.dirty |= removed;
        removed
    }

    /// Removes every rule carrying `tag`.
    pub fn clear_rules_by_tag(&mut self, tag: &str) -> usize {
        let before = self.rules.len();
        self.rules.retain(|r| r.tag != tag);
        let removed = before - self.rules.len();
        if removed > 0 {
            self.dirty = true;
        }
        removed
    }

    pub fn rules(&self) -> &[NatRule] {
        &self.rules
    }

    /// Returns the rules carrying `tag`.
    pub fn rules_by_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a NatRule> + 'a {
        self.rules.iter().filter(move |r| r.tag == tag)
    }

    /// Returns true if there are changes not yet committed.
    pub fn is_dirty(&self) -> bool {
        self.dirty || !self.applied_once
    }

    /// Renders the `iptables-restore` payload for the nat table.
    ///
    /// Declaring the managed chains flushes them under `--noflush`, so the
    /// payload always carries the complete rule set.
    pub fn render(&self) -> String {
        let mut out = String::from("*nat\n");
        for chain in MANAGED_CHAINS {
            let _ = writeln!(out, ":{} - [0:0]", wrap_chain(chain));
        }
        if !self.applied_once {
            for builtin in ["PREROUTING", "OUTPUT", "POSTROUTING"] {
                let _ = writeln!(out, "-I {} 1 -j {}", builtin, wrap_chain(builtin));
            }
            let _ = writeln!(out, "-A POSTROUTING -j {}", wrap_chain("snat"));
        }
        let _ = writeln!(
            out,
            "-A {} -j {}",
            wrap_chain("snat"),
            wrap_chain("float-snat")
        );
        for rule in &self.rules {
            let _ = writeln!(out, "-A {} {}", wrap_chain(&rule.chain), rule.rule);
        }
        out.push_str("COMMIT\n");
        out
    }

    /// Commits the accumulated rule set atomically.
    ///
    /// Does nothing when no rule changed since the last successful commit.
    pub async fn apply(&mut self) -> AgentResult<()> {
        if !self.is_dirty() {
            return Ok(());
        }
        let cmd = match &self.namespace {
            Some(ns) => format!(
                "{} netns exec {} {} -n",
                IP_CMD,
                shellquote(ns),
                IPTABLES_RESTORE_CMD
            ),
            None => format!("{} -n", IPTABLES_RESTORE_CMD),
        };
        let payload = self.render();
        self.executor
            .run_with_input(&cmd, &payload)
            .await?
            .into_stdout(&cmd)?;

        tracing::debug!(
            namespace = ?self.namespace,
            rules = self.rules.len(),
            "Committed nat rules"
        );
        self.dirty = false;
        self.applied_once = true;
        Ok(())
    }
}

fn check_chain(chain: &str) -> AgentResult<()> {
    if MANAGED_CHAINS.contains(&chain) {
        Ok(())
    } else {
        Err(AgentError::internal(format!("unmanaged nat chain '{}'", chain)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::RecordingExecutor;
    use pretty_assertions::assert_eq;

    fn manager() -> (IptablesManager, Arc<RecordingExecutor>) {
        let exec = Arc::new(RecordingExecutor::new());
        let mgr = IptablesManager::new(Some("qrouter-r1".to_string()), exec.clone());
        (mgr, exec)
    }

    #[test]
    fn test_add_and_remove_rule() {
        let (mut mgr, _) = manager();
        mgr.add_rule("PREROUTING", "-d 1.1.1.1 -j DNAT --to 10.0.0.1", TAG_FLOATING_IP)
            .unwrap();
        mgr.add_rule("PREROUTING", "-d 1.1.1.1 -j DNAT --to 10.0.0.1", TAG_FLOATING_IP)
            .unwrap();
        assert_eq!(mgr.rules().len(), 1);

        assert!(mgr.remove_rule("PREROUTING", "-d 1.1.1.1 -j DNAT --to 10.0.0.1", TAG_FLOATING_IP));
        assert!(!mgr.remove_rule("PREROUTING", "-d 1.1.1.1 -j DNAT --to 10.0.0.1", TAG_FLOATING_IP));
        assert!(mgr.rules().is_empty());
    }

    #[test]
    fn test_unmanaged_chain_rejected() {
        let (mut mgr, _) = manager();
        assert!(mgr.add_rule("INPUT", "-j ACCEPT", "x").is_err());
    }

    #[test]
    fn test_clear_rules_by_tag() {
        let (mut mgr, _) = manager();
        mgr.add_rule("PREROUTING", "rule-a", TAG_PORTFORWARDING).unwrap();
        mgr.add_rule("PREROUTING", "rule-b", TAG_PORTFORWARDING).unwrap();
        mgr.add_rule("snat", "rule-c", TAG_SNAT).unwrap();
        assert_eq!(mgr.clear_rules_by_tag(TAG_PORTFORWARDING), 2);
        assert_eq!(mgr.rules_by_tag(TAG_SNAT).count(), 1);
    }

    #[test]
    fn test_render_payload() {
        let (mut mgr, _) = manager();
        mgr.add_rule("PREROUTING", "-p tcp -j DNAT", TAG_PORTFORWARDING).unwrap();
        let payload = mgr.render();
        assert!(payload.starts_with("*nat\n:l3-agent-PREROUTING - [0:0]\n"));
        assert!(payload.contains("-I PREROUTING 1 -j l3-agent-PREROUTING\n"));
        assert!(payload.contains("-A l3-agent-snat -j l3-agent-float-snat\n"));
        assert!(payload.contains("-A l3-agent-PREROUTING -p tcp -j DNAT\n"));
        assert!(payload.ends_with("COMMIT\n"));
    }

    #[tokio::test]
    async fn test_apply_commits_once_per_change() {
        let (mut mgr, exec) = manager();
        mgr.add_rule("PREROUTING", "-p tcp -j DNAT", TAG_PORTFORWARDING).unwrap();
        mgr.apply().await.unwrap();
        mgr.apply().await.unwrap();

        let commands = exec.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(
            commands[0].command,
            "/sbin/ip netns exec \"qrouter-r1\" /sbin/iptables-restore -n"
        );
        assert!(commands[0].input.as_deref().unwrap_or("").contains("-p tcp -j DNAT"));

        mgr.clear_rules_by_tag(TAG_PORTFORWARDING);
        mgr.apply().await.unwrap();
        let commands = exec.commands();
        assert_eq!(commands.len(), 2);
        let second = commands[1].input.clone().unwrap_or_default();
        assert!(!second.contains("-I PREROUTING"));
        assert!(!second.contains("DNAT"));
    }

    #[tokio::test]
    async fn test_apply_failure_keeps_dirty() {
        let (mut mgr, exec) = manager();
        exec.fail_on("iptables-restore");
        mgr.add_rule("snat", "-s 10.0.0.0/24 -j SNAT --to-source 1.1.1.1", TAG_SNAT)
            .unwrap();
        assert!(mgr.apply().await.is_err());
        assert!(mgr.is_dirty());

        exec.clear_failures();
        mgr.apply().await.unwrap();
        assert!(!mgr.is_dirty());
    }
}

//! Cleanup of stale router namespaces around a full sync.
//!
//! The namespace inventory is taken before the router list is fetched, so a
//! router deleted between the two is still seen as stale. Routers the sync
//! enqueues (including deletions) are marked kept; their namespaces are
//! handled by the regular removal path.

use std::collections::BTreeSet;

use l3_agent_common::{AgentResult, NetworkDriver};
use tracing::{debug, info, warn};

use crate::commands::{router_ns_name, NS_PREFIX};

/// Tracks router namespaces during one full sync pass
#[derive(Debug)]
pub struct NamespaceManager {
    enabled: bool,
    snapshot: Option<BTreeSet<String>>,
    kept: BTreeSet<String>,
    cleaned: bool,
}

impl NamespaceManager {
    /// `enabled` is false when the agent runs without namespaces.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            snapshot: None,
            kept: BTreeSet::new(),
            cleaned: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Lists the managed namespaces present right now.
    pub async fn begin(&mut self, driver: &dyn NetworkDriver) -> AgentResult<()> {
        self.kept.clear();
        self.snapshot = None;
        if !self.enabled || self.cleaned {
            return Ok(());
        }
        let namespaces: BTreeSet<String> = driver
            .list_namespaces()
            .await?
            .into_iter()
            .filter(|ns| ns.starts_with(NS_PREFIX))
            .collect();
        debug!(count = namespaces.len(), "Namespace snapshot taken");
        self.snapshot = Some(namespaces);
        Ok(())
    }

    /// Protects a router's namespace from cleanup in this pass.
    pub fn keep_router(&mut self, router_id: &str) {
        if self.enabled {
            self.kept.insert(router_ns_name(router_id));
        }
    }

    /// Returns true if the router's namespace was kept in this pass.
    pub fn is_kept(&self, router_id: &str) -> bool {
        self.kept.contains(&router_ns_name(router_id))
    }

    /// Namespaces kept in the current pass.
    pub fn kept(&self) -> Vec<String> {
        self.kept.iter().cloned().collect()
    }

    /// Deletes every namespace from the snapshot that was not kept.
    ///
    /// Only the first successful pass cleans up; later passes just drop
    /// their snapshot. Returns the namespaces deleted.
    pub async fn finish(&mut self, driver: &dyn NetworkDriver) -> Vec<String> {
        let Some(snapshot) = self.snapshot.take() else {
            return Vec::new();
        };
        let mut deleted = Vec::new();
        for ns in snapshot.difference(&self.kept) {
            match driver.delete_namespace(ns).await {
                Ok(()) => {
                    info!(namespace = %ns, "Deleted stale router namespace");
                    deleted.push(ns.clone());
                }
                Err(e) => warn!(namespace = %ns, error = %e, "Failed to delete stale namespace"),
            }
        }
        self.cleaned = true;
        self.kept.clear();
        deleted
    }

    /// Discards the snapshot of a failed pass.
    pub fn abort(&mut self) {
        self.snapshot = None;
        self.kept.clear();
    }
}

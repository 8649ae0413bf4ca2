//! Registry of routers served by this agent.
//!
//! Each entry is behind its own async mutex. The queue lease already makes
//! one worker the sole writer of a router; the mutex only lets the state
//! reporter read a consistent snapshot. Map guards are never held across an
//! await: callers clone the `Arc` out first.

use crate::router::RouterInfo;
use dashmap::DashMap;
use l3_agent_types::RouterId;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Shared handle to one router's runtime state.
pub type RouterHandle = Arc<Mutex<RouterInfo>>;

/// Concurrent map of router id to runtime state
#[derive(Debug, Default)]
pub struct RouterRegistry {
    routers: DashMap<RouterId, RouterHandle>,
}

impl RouterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a router, returning its handle.
    pub fn insert(&self, info: RouterInfo) -> RouterHandle {
        let router_id = info.router_id.clone();
        let handle = Arc::new(Mutex::new(info));
        self.routers.insert(router_id, handle.clone());
        handle
    }

    pub fn get(&self, router_id: &str) -> Option<RouterHandle> {
        self.routers.get(router_id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, router_id: &str) -> Option<RouterHandle> {
        self.routers.remove(router_id).map(|(_, handle)| handle)
    }

    pub fn contains(&self, router_id: &str) -> bool {
        self.routers.contains_key(router_id)
    }

    /// Ids of every registered router.
    pub fn router_ids(&self) -> Vec<RouterId> {
        self.routers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Handles of every registered router.
    pub fn values(&self) -> Vec<RouterHandle> {
        self.routers.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.routers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routers.is_empty()
    }
}

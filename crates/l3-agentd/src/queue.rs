//! Per-router serializing update queue.
//!
//! Updates are grouped into one partition per router. A worker takes a
//! [`RouterLease`] on a partition and drains it; while the lease is held no
//! other worker can obtain the same router, but other routers stay
//! available. Dropping the lease releases the router and, if updates arrived
//! in the meantime, makes it eligible again.
//!
//! Eligible routers wait in one FIFO per priority tier. Workers always serve
//! the most urgent non-empty tier, and within a tier routers are served
//! round-robin.

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use l3_agent_types::{RouterDocument, RouterId};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

/// Origin of an update; earlier variants are more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UpdatePriority {
    /// Controller notification.
    Rpc,
    /// Periodic full sync.
    SyncTask,
    /// Anything else.
    Background,
}

impl UpdatePriority {
    const COUNT: usize = 3;

    const fn rank(self) -> usize {
        match self {
            UpdatePriority::Rpc => 0,
            UpdatePriority::SyncTask => 1,
            UpdatePriority::Background => 2,
        }
    }
}

/// What to do with the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateAction {
    /// Fetch (if needed) and reconcile.
    Process,
    /// Tear the router down.
    DeleteRouter,
}

/// One pending change for a router.
#[derive(Debug, Clone, PartialEq)]
pub struct RouterUpdate {
    pub router_id: RouterId,
    pub priority: UpdatePriority,
    pub action: UpdateAction,
    /// Desired state captured with the update; fetched on demand if absent.
    pub router: Option<RouterDocument>,
    pub timestamp: DateTime<Utc>,
    seq: u64,
}

impl RouterUpdate {
    /// A `Process` update stamped now.
    pub fn new(router_id: impl Into<RouterId>, priority: UpdatePriority) -> Self {
        Self {
            router_id: router_id.into(),
            priority,
            action: UpdateAction::Process,
            router: None,
            timestamp: Utc::now(),
            seq: 0,
        }
    }

    /// A `DeleteRouter` update stamped now.
    pub fn delete(router_id: impl Into<RouterId>, priority: UpdatePriority) -> Self {
        Self::new(router_id, priority).with_action(UpdateAction::DeleteRouter)
    }

    pub fn with_action(mut self, action: UpdateAction) -> Self {
        self.action = action;
        self
    }

    pub fn with_router(mut self, router: RouterDocument) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_delete(&self) -> bool {
        self.action == UpdateAction::DeleteRouter
    }

    /// Folds a newer-or-older update for the same router and action into
    /// this one: the more urgent priority wins, the newer snapshot wins.
    fn absorb(&mut self, other: RouterUpdate) {
        self.priority = self.priority.min(other.priority);
        if other.timestamp >= self.timestamp {
            self.router = other.router;
            self.timestamp = other.timestamp;
        }
    }
}

#[derive(Debug, Default)]
struct Partition {
    pending: Vec<RouterUpdate>,
    leased: bool,
    /// Most urgent tier the router currently waits in.
    scheduled: Option<UpdatePriority>,
    /// Timestamp of the newest data successfully applied.
    processed_at: Option<DateTime<Utc>>,
    /// The last applied update tore the router down.
    removed: bool,
}

impl Partition {
    fn most_urgent(&self) -> Option<UpdatePriority> {
        self.pending.iter().map(|u| u.priority).min()
    }
}

#[derive(Debug, Default)]
struct QueueState {
    partitions: HashMap<RouterId, Partition>,
    ready: [VecDeque<RouterId>; UpdatePriority::COUNT],
    next_seq: u64,
}

impl QueueState {
    /// Puts an unleased router with pending updates into the tier of its
    /// most urgent update. Returns true if the router became newly eligible
    /// or moved to a more urgent tier.
    fn schedule(&mut self, router_id: &str) -> bool {
        let Some(partition) = self.partitions.get_mut(router_id) else {
            return false;
        };
        if partition.leased {
            return false;
        }
        let Some(priority) = partition.most_urgent() else {
            return false;
        };
        if partition.scheduled.is_some_and(|p| p <= priority) {
            return false;
        }
        partition.scheduled = Some(priority);
        self.ready[priority.rank()].push_back(router_id.to_string());
        true
    }

    /// Leases the next eligible router, skipping stale tier entries.
    fn lease_next(&mut self) -> Option<RouterId> {
        for tier in [
            UpdatePriority::Rpc,
            UpdatePriority::SyncTask,
            UpdatePriority::Background,
        ] {
            while let Some(router_id) = self.ready[tier.rank()].pop_front() {
                let Some(partition) = self.partitions.get_mut(&router_id) else {
                    continue;
                };
                if partition.leased || partition.scheduled != Some(tier) {
                    continue;
                }
                partition.scheduled = None;
                partition.leased = true;
                return Some(router_id);
            }
        }
        None
    }

    fn has_ready(&self) -> bool {
        self.ready.iter().any(|tier| !tier.is_empty())
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    state: Mutex<QueueState>,
    notify: Notify,
}

/// Queue of router updates, cheap to clone and share between tasks.
#[derive(Debug, Clone, Default)]
pub struct UpdateQueue {
    inner: Arc<QueueInner>,
}

impl UpdateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an update.
    ///
    /// A pending update for the same router and action whose priority is
    /// less or equally urgent absorbs the new one instead of queueing a
    /// second entry.
    pub fn add(&self, mut update: RouterUpdate) {
        let newly_ready = {
            let mut state = self.inner.state.lock();
            update.seq = state.next_seq;
            state.next_seq += 1;

            let router_id = update.router_id.clone();
            let partition = state.partitions.entry(router_id.clone()).or_default();
            let existing = partition
                .pending
                .iter_mut()
                .find(|u| u.action == update.action && u.priority >= update.priority);
            match existing {
                Some(existing) => {
                    debug!(router_id = %router_id, "Merging router update");
                    existing.absorb(update);
                }
                None => partition.pending.push(update),
            }
            state.schedule(&router_id)
        };
        if newly_ready {
            self.inner.notify.notify_one();
        }
    }

    /// Takes a lease on the next eligible router without waiting.
    pub fn try_next_router(&self) -> Option<RouterLease> {
        let (router_id, more) = {
            let mut state = self.inner.state.lock();
            let router_id = state.lease_next()?;
            (router_id, state.has_ready())
        };
        if more {
            self.inner.notify.notify_one();
        }
        Some(RouterLease {
            queue: self.clone(),
            router_id,
        })
    }

    /// Waits until a router is eligible and takes a lease on it.
    pub async fn next_router(&self) -> RouterLease {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(lease) = self.try_next_router() {
                return lease;
            }
            notified.await;
        }
    }

    /// Lazily yields a lease for each eligible router until none is left.
    ///
    /// Every call starts a fresh sequence. Leases must be dropped to make
    /// their router eligible again.
    pub fn each_update_to_next_router(&self) -> impl Stream<Item = RouterLease> {
        let queue = self.clone();
        stream::unfold(queue, |queue| async move {
            let lease = queue.try_next_router()?;
            Some((lease, queue))
        })
    }

    /// Pending updates of one router, in queue order.
    pub fn pending(&self, router_id: &str) -> Vec<RouterUpdate> {
        self.inner
            .state
            .lock()
            .partitions
            .get(router_id)
            .map(|p| p.pending.clone())
            .unwrap_or_default()
    }

    /// Total number of pending updates.
    pub fn len(&self) -> usize {
        self.inner
            .state
            .lock()
            .partitions
            .values()
            .map(|p| p.pending.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of routers the queue keeps state for.
    pub fn tracked_routers(&self) -> usize {
        self.inner.state.lock().partitions.len()
    }

    /// Returns true if a worker holds the router's lease.
    pub fn is_leased(&self, router_id: &str) -> bool {
        self.inner
            .state
            .lock()
            .partitions
            .get(router_id)
            .is_some_and(|p| p.leased)
    }

    fn release(&self, router_id: &str) {
        let ready = {
            let mut state = self.inner.state.lock();
            if let Some(partition) = state.partitions.get_mut(router_id) {
                partition.leased = false;
                partition.scheduled = None;
                if partition.removed && partition.pending.is_empty() {
                    state.partitions.remove(router_id);
                    return;
                }
            }
            state.schedule(router_id)
        };
        if ready {
            self.inner.notify.notify_one();
        }
    }
}

/// Exclusive right to process one router's pending updates.
pub struct RouterLease {
    queue: UpdateQueue,
    router_id: RouterId,
}

impl fmt::Debug for RouterLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterLease")
            .field("router_id", &self.router_id)
            .finish()
    }
}

impl RouterLease {
    pub fn router_id(&self) -> &str {
        &self.router_id
    }

    /// Pops the next update: most urgent priority first, FIFO within a
    /// priority.
    ///
    /// `Process` updates carrying data older than what was already applied
    /// are discarded on the way.
    pub fn next_update(&mut self) -> Option<RouterUpdate> {
        let mut state = self.queue.inner.state.lock();
        let partition = state.partitions.get_mut(&self.router_id)?;
        loop {
            let idx = partition
                .pending
                .iter()
                .enumerate()
                .min_by_key(|(_, u)| (u.priority, u.seq))
                .map(|(i, _)| i)?;
            let update = partition.pending.remove(idx);
            let stale = !update.is_delete()
                && partition
                    .processed_at
                    .is_some_and(|applied| update.timestamp < applied);
            if stale {
                debug!(
                    router_id = %self.router_id,
                    timestamp = %update.timestamp,
                    "Discarding outdated router update"
                );
                continue;
            }
            partition.removed = false;
            return Some(update);
        }
    }

    /// Records that data as of `timestamp` was applied and drops every
    /// pending update stamped at or before it.
    ///
    /// Updates added later carry later timestamps and survive.
    pub fn fetched_and_processed(&mut self, timestamp: DateTime<Utc>) {
        let mut state = self.queue.inner.state.lock();
        if let Some(partition) = state.partitions.get_mut(&self.router_id) {
            partition.processed_at = Some(match partition.processed_at {
                Some(prev) if prev > timestamp => prev,
                _ => timestamp,
            });
            partition.pending.retain(|u| u.timestamp > timestamp);
        }
    }

    /// Records that the router is gone. Once nothing is pending its
    /// partition is dropped when the lease is released.
    pub fn router_removed(&mut self) {
        let mut state = self.queue.inner.state.lock();
        if let Some(partition) = state.partitions.get_mut(&self.router_id) {
            partition.removed = true;
        }
    }
}

impl Drop for RouterLease {
    fn drop(&mut self) {
        self.queue.release(&self.router_id);
    }
}

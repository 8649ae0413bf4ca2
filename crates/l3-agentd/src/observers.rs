//! Router lifecycle notifications.

use crate::router::RouterInfo;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Lifecycle points observers are told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouterEvent {
    BeforeAdd,
    AfterAdd,
    BeforeUpdate,
    AfterUpdate,
    BeforeRemove,
    AfterRemove,
}

impl RouterEvent {
    pub const fn as_str(&self) -> &'static str {
        match self {
            RouterEvent::BeforeAdd => "before_add",
            RouterEvent::AfterAdd => "after_add",
            RouterEvent::BeforeUpdate => "before_update",
            RouterEvent::AfterUpdate => "after_update",
            RouterEvent::BeforeRemove => "before_remove",
            RouterEvent::AfterRemove => "after_remove",
        }
    }
}

impl fmt::Display for RouterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callback invoked for every lifecycle event.
pub type RouterObserver = Arc<dyn Fn(RouterEvent, &RouterInfo) + Send + Sync>;

/// Registered lifecycle observers
#[derive(Default)]
pub struct EventObservers {
    observers: RwLock<Vec<RouterObserver>>,
}

impl fmt::Debug for EventObservers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventObservers")
            .field("count", &self.observers.read().len())
            .finish()
    }
}

impl EventObservers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, observer: RouterObserver) {
        self.observers.write().push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }

    /// Calls every observer in registration order.
    pub fn notify(&self, event: RouterEvent, router: &RouterInfo) {
        let observers = self.observers.read().clone();
        for observer in observers {
            observer(event, router);
        }
    }
}

//! L3 router agent daemon.
//!
//! This crate implements `l3-agentd`, which reconciles the routers a
//! network controller assigns to this host into network namespaces,
//! addresses, routes and NAT rules, including per-router port forwarding.
//!
//! # Responsibilities
//!
//! - Queue router updates by priority and process each router exclusively
//! - Create, update and remove routers (legacy, HA and distributed)
//! - Apply gateway SNAT, floating IP and port-forwarding DNAT rules
//! - Full resynchronization with stale namespace cleanup
//! - Report floating IP statuses, HA states and agent state upstream
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`queue`] | Prioritized per-router update queue with exclusive leases |
//! | [`agent`] | Notifications, worker pool and router lifecycle |
//! | [`router`] | Per-router state and the reconcile pass |
//! | [`sync`] | Full sync with the controller |
//! | [`portforward`] | DNAT rules for port forwarding |
//!
//! # Example
//!
//! ```ignore
//! use l3_agentd::{L3Agent, AgentConfig};
//!
//! let agent = L3Agent::new(conf, plugin_rpc, driver, executor).await?;
//! agent.run(cancel).await?;
//! ```

pub mod agent;
pub mod commands;
pub mod config;
pub mod controller;
pub mod diff;
pub mod driver;
pub mod dvr;
pub mod external;
pub mod ha;
pub mod namespace_manager;
pub mod observers;
pub mod portforward;
pub mod queue;
pub mod registry;
pub mod report;
pub mod router;
pub mod sync;

pub use agent::{L3Agent, RouterRemovedPayload, RoutersPayload};
pub use config::{AgentConfig, AgentMode, InterfaceDriverKind};
pub use controller::FilePluginApi;
pub use observers::{RouterEvent, RouterObserver};
pub use queue::{RouterLease, RouterUpdate, UpdateAction, UpdatePriority, UpdateQueue};
pub use router::{RouterInfo, RouterKind};

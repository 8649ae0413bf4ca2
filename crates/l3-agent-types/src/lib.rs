//! Common types for the L3 router agent.
//!
//! This crate provides the desired-state vocabulary exchanged between the
//! controller and the agent:
//!
//! - [`RouterDocument`]: the full desired state of one tenant router
//! - [`RouterPort`], [`FixedIp`]: internal, gateway and HA ports
//! - [`FloatingIp`], [`FipStatus`]: public addresses mapped 1:1 via NAT
//! - [`Route`]: static routes inside the router namespace
//! - [`PortForwardRule`], [`PortForwardRecord`]: destination NAT mappings and
//!   the persisted row they are loaded from
//! - [`HaState`]: keepalived-reported state of an HA router

mod portfwd;
mod router;

pub use portfwd::{PortForwardRecord, PortForwardRule, Protocol};
pub use router::{
    FipStatus, FixedIp, FloatingIp, GatewayInfo, HaState, Route, RouterDocument, RouterId,
    RouterPort,
};

/// Common error type for parsing and validation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid protocol: {0} (allowed values are tcp, udp)")]
    InvalidProtocol(String),

    #[error("invalid port '{0}'")]
    InvalidPort(String),

    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("column {column} is limited to {max} characters, got {actual}")]
    ColumnTooLong {
        column: &'static str,
        max: usize,
        actual: usize,
    },

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid HA state: {0}")]
    InvalidHaState(String),

    #[error("invalid floating IP status: {0}")]
    InvalidFipStatus(String),
}

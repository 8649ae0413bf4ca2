//! Port-forwarding (destination NAT) rules.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Maximum length of the persisted `inside_addr` column.
pub const INSIDE_ADDR_MAX_LEN: usize = 15;
/// Maximum length of the persisted `protocol` column.
pub const PROTOCOL_MAX_LEN: usize = 4;

/// Transport protocol of a forwarded port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            _ => Err(ParseError::InvalidProtocol(s.to_string())),
        }
    }
}

/// One DNAT mapping from an external (address, port, protocol) to an
/// internal (address, port).
///
/// Equality is structural over every field, so an inside-address change on
/// the same outside port compares unequal and is reconciled as remove+add.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortForwardRule {
    pub protocol: Protocol,
    /// Filled in from the router's gateway port before reconciliation.
    #[serde(default)]
    pub outside_addr: Option<String>,
    pub outside_port: u16,
    pub inside_addr: String,
    pub inside_port: u16,
}

impl PortForwardRule {
    pub fn new(
        protocol: Protocol,
        outside_port: u16,
        inside_addr: impl Into<String>,
        inside_port: u16,
    ) -> Self {
        Self {
            protocol,
            outside_addr: None,
            outside_port,
            inside_addr: inside_addr.into(),
            inside_port,
        }
    }

    /// Returns a copy bound to the given outside address.
    pub fn with_outside_addr(&self, addr: impl Into<String>) -> Self {
        Self {
            outside_addr: Some(addr.into()),
            ..self.clone()
        }
    }
}

impl fmt::Display for PortForwardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{} -> {}:{}",
            self.protocol,
            self.outside_addr.as_deref().unwrap_or("*"),
            self.outside_port,
            self.inside_addr,
            self.inside_port
        )
    }
}

/// A port-forwarding row as persisted by the controller.
///
/// Text columns are kept as stored; `validate()` enforces the column
/// constraints before the row is turned into a [`PortForwardRule`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForwardRecord {
    pub tenant_id: String,
    pub id: String,
    pub router_id: String,
    pub outside_port: u32,
    pub inside_addr: String,
    pub inside_port: u32,
    pub protocol: String,
}

impl PortForwardRecord {
    /// Checks column lengths, protocol, address and port ranges.
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.inside_addr.len() > INSIDE_ADDR_MAX_LEN {
            return Err(ParseError::ColumnTooLong {
                column: "inside_addr",
                max: INSIDE_ADDR_MAX_LEN,
                actual: self.inside_addr.len(),
            });
        }
        if self.protocol.len() > PROTOCOL_MAX_LEN {
            return Err(ParseError::ColumnTooLong {
                column: "protocol",
                max: PROTOCOL_MAX_LEN,
                actual: self.protocol.len(),
            });
        }
        if self.router_id.is_empty() {
            return Err(ParseError::MissingField("router_id"));
        }
        self.protocol.parse::<Protocol>()?;
        self.inside_addr
            .parse::<Ipv4Addr>()
            .map_err(|_| ParseError::InvalidIpAddress(self.inside_addr.clone()))?;
        parse_port(self.outside_port)?;
        parse_port(self.inside_port)?;
        Ok(())
    }

    /// Validates the record and converts it into an unbound rule.
    pub fn to_rule(&self) -> Result<PortForwardRule, ParseError> {
        self.validate()?;
        Ok(PortForwardRule::new(
            self.protocol.parse()?,
            parse_port(self.outside_port)?,
            self.inside_addr.clone(),
            parse_port(self.inside_port)?,
        ))
    }
}

fn parse_port(port: u32) -> Result<u16, ParseError> {
    match u16::try_from(port) {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(ParseError::InvalidPort(port.to_string())),
    }
}

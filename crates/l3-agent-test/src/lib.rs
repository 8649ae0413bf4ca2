//! Integration test infrastructure for the L3 router agent
//!
//! Provides:
//! - Router document fixtures (legacy, HA, distributed, internal-only)
//! - An in-memory controller recording every write the agent makes
//! - An in-memory namespace driver recording every device operation

mod controller;
mod driver;
pub mod fixtures;

pub use controller::FakeController;
pub use driver::{DriverCall, FakeDriver};
pub use fixtures::*;

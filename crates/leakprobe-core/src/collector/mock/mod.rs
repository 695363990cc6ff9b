//! Test doubles for snapshot sources.
//!
//! - [`MockFs`] simulates `/proc/self` for the procfs probe.
//! - [`SimulatedProcess`] is a fully scripted provider whose counters and
//!   inventories are driven by the target under test.

mod filesystem;
mod scenarios;
mod simulated;

pub use filesystem::MockFs;
pub use simulated::SimulatedProcess;

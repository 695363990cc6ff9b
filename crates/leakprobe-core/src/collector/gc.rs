//! Cycle-collector capability.
//!
//! Rust has no tracing collector of its own; runtimes embedded in the
//! process (a scripting engine, a `Gc<T>` arena) can plug theirs in here so
//! the uncollectable-garbage checker can inspect it.

use crate::snapshot::ResourceId;

pub trait CycleCollector {
    /// Runs a full collection cycle.
    fn collect(&mut self);

    /// Objects the last cycle found unreachable but could not free.
    fn uncollectable(&self) -> Vec<ResourceId>;
}

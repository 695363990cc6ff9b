//! Snapshot source abstraction.
//!
//! The detector never talks to the operating system directly; it asks a
//! [`SnapshotProvider`] for a [`Snapshot`] before and after invoking the
//! target. Production code uses [`ProcessProbe`](crate::collector::ProcessProbe),
//! tests use [`SimulatedProcess`](crate::collector::mock::SimulatedProcess).

use crate::snapshot::{Capabilities, Snapshot};

/// Why a snapshot could not be captured.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Reading an OS metrics source failed.
    #[error("cannot read {source_name}: {error}")]
    Io {
        source_name: String,
        #[source]
        error: std::io::Error,
    },
    /// A metrics source had unexpected content.
    #[error("cannot parse {source_name}: {message}")]
    Parse {
        source_name: String,
        message: String,
    },
    /// The allocator refused a statistics query.
    #[error("allocator statistic {name} unavailable (code {code})")]
    Allocator { name: &'static str, code: i32 },
    /// Provider-specific failure.
    #[error("{0}")]
    Other(String),
}

/// Source of process snapshots.
///
/// Implementations must be pure observers: capturing a snapshot must not
/// leave behind descriptors, threads or heap allocations that show up in
/// the next capture.
pub trait SnapshotProvider {
    /// Captures the current memory counters and resource inventories.
    fn capture(&mut self) -> Result<Snapshot, ProviderError>;

    /// Describes what [`capture`](Self::capture) is able to observe.
    fn capabilities(&self) -> Capabilities;

    /// Runs a full cycle-collection pass. No-op without a cycle collector.
    fn force_collection(&mut self) {}

    /// Returns free allocator memory to the OS to stabilize measurements.
    fn release_free_memory(&mut self) {}
}

impl<P: SnapshotProvider + ?Sized> SnapshotProvider for Box<P> {
    fn capture(&mut self) -> Result<Snapshot, ProviderError> {
        (**self).capture()
    }

    fn capabilities(&self) -> Capabilities {
        (**self).capabilities()
    }

    fn force_collection(&mut self) {
        (**self).force_collection()
    }

    fn release_free_memory(&mut self) {
        (**self).release_free_memory()
    }
}

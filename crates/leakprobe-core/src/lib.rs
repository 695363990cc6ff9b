//! leakprobe-core - leak detection for a callable under test.
//!
//! Provides:
//! - `detector` - runs a target and decides whether it leaks
//! - `trend` - escalating memory rounds and their decision
//! - `checker` - single-shot resource checkers and their selection
//! - `collector` - snapshot sources (procfs probe, heap statistics,
//!   thread registry, test doubles)
//! - `provider` - the snapshot source abstraction
//! - `config` - run parameters and tolerances
//! - `report` - verdicts, leak reports and run records
//! - `fmt` - shared formatting helpers (bytes, deltas)
//!
//! With `jemalloc` feature (default):
//! - `collector::JemallocHeap` and `ProcessProbe::current()`, reading heap
//!   statistics from jemalloc. The process must use jemalloc as its global
//!   allocator for the heap counters to move.

pub mod checker;
pub mod collector;
pub mod config;
pub mod detector;
pub mod error;
pub mod fmt;
pub mod provider;
pub mod report;
pub mod snapshot;
pub mod trend;

pub use checker::{CheckerConfig, CheckerKind, LeakFinding, ResourceCategory};
pub use config::{LeakConfig, Tolerance, TrendPolicy};
pub use detector::LeakDetector;
pub use error::LeakError;
pub use provider::{ProviderError, SnapshotProvider};
pub use report::{Leak, LeakReport, MemoryLeak, RunRecord, Verdict};
pub use snapshot::{Metric, Snapshot};

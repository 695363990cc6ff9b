//! Snapshot sources for the running process.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      ProcessProbe                        │
//! │  /proc/self/{status,smaps_rollup,fd,task}   HeapStats    │
//! │            │                                    │        │
//! │     ┌──────▼──────┐                    ┌────────▼──────┐ │
//! │     │  FileSystem │ (trait)            │ JemallocHeap  │ │
//! │     └──────┬──────┘                    └───────────────┘ │
//! └────────────┼─────────────────────────────────────────────┘
//!              │
//!       ┌──────┴──────┐
//!       │             │
//!  ┌────▼────┐   ┌────▼────┐
//!  │ RealFs  │   │ MockFs  │
//!  └─────────┘   └─────────┘
//! ```
//!
//! Optional sources plug into the probe: a [`ThreadRegistry`] separates
//! managed threads from native ones, a [`CycleCollector`] exposes garbage a
//! collector could not free.
//!
//! # Usage
//!
//! ```ignore
//! use leakprobe_core::collector::ProcessProbe;
//! use leakprobe_core::provider::SnapshotProvider;
//!
//! let mut probe = ProcessProbe::current();
//! let snapshot = probe.capture().unwrap();
//! ```
//!
//! ```
//! use leakprobe_core::collector::{HeapInfo, MockFs, ProcessProbe};
//! use leakprobe_core::provider::SnapshotProvider;
//!
//! let mut probe = ProcessProbe::new(MockFs::typical_self(), "/proc/self", HeapInfo::default());
//! let snapshot = probe.capture().unwrap();
//! assert_eq!(snapshot.open_descriptors.len(), 4);
//! ```

pub mod gc;
pub mod heap;
pub mod mock;
pub mod procfs;
pub mod threads;
pub mod traits;

pub use gc::CycleCollector;
#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
pub use heap::JemallocHeap;
pub use heap::{HeapInfo, HeapStats};
pub use mock::{MockFs, SimulatedProcess};
pub use procfs::ProcessProbe;
pub use threads::ThreadRegistry;
pub use traits::{FileSystem, RealFs};

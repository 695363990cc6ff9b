//! Point-in-time view of process memory counters and resource inventories.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Opaque platform-native identifier (descriptor number, handle value,
/// thread id, object address). Only equality is meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(pub u64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Set of resource identifiers captured in one snapshot.
pub type IdSet = BTreeSet<ResourceId>;

/// Memory metrics tracked by the trend analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Bytes handed out by the allocator's regular heap.
    Heap,
    /// Bytes held in large dedicated mappings.
    Mmap,
    /// Number of private heaps (Windows `HeapCreate`).
    HeapCount,
    /// Unique set size: memory private to this process.
    Uss,
    /// Resident set size.
    Rss,
    /// Virtual memory size.
    Vms,
}

impl Metric {
    /// All metrics in report order.
    pub const ALL: [Metric; 6] = [
        Metric::Heap,
        Metric::Mmap,
        Metric::HeapCount,
        Metric::Uss,
        Metric::Rss,
        Metric::Vms,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Metric::Heap => "heap",
            Metric::Mmap => "mmap",
            Metric::HeapCount => "heap_count",
            Metric::Uss => "uss",
            Metric::Rss => "rss",
            Metric::Vms => "vms",
        }
    }

    /// Whether the metric counts bytes (as opposed to objects).
    pub fn is_bytes(self) -> bool {
        !matches!(self, Metric::HeapCount)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Metric::ALL
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// Operating system family the snapshot was taken on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Linux,
    /// Any other POSIX system (descriptors, no handles).
    Unix,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else if cfg!(any(target_os = "linux", target_os = "android")) {
            Platform::Linux
        } else {
            Platform::Unix
        }
    }

    pub fn is_posix(self) -> bool {
        matches!(self, Platform::Linux | Platform::Unix)
    }
}

/// What a snapshot provider is able to observe.
///
/// Checkers whose capability is missing are dropped when resolving the
/// checker set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub platform: Platform,
    /// A thread registry is attached, so managed threads can be told
    /// apart from native ones.
    pub managed_threads: bool,
    /// A cycle collector is attached.
    pub cycle_collector: bool,
}

impl Capabilities {
    pub fn for_platform(platform: Platform) -> Self {
        Self {
            platform,
            managed_threads: false,
            cycle_collector: false,
        }
    }
}

/// Memory counters and resource inventories of the current process at one
/// instant. Never mutated after capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub heap_used: u64,
    pub mmap_used: u64,
    /// Windows only.
    pub heap_count: Option<u64>,
    pub uss: u64,
    pub rss: u64,
    pub vms: u64,
    /// POSIX only; empty elsewhere.
    pub open_descriptors: IdSet,
    /// Windows only; empty elsewhere.
    pub open_handles: IdSet,
    /// Threads known to the thread registry that are still running.
    pub live_threads: IdSet,
    /// OS thread ids not registered with the thread registry.
    pub native_thread_ids: IdSet,
    pub uncollectable_count: u64,
    pub uncollectable_ids: IdSet,
    #[serde(skip)]
    pub timestamp: Instant,
}

impl Snapshot {
    /// Snapshot with every counter at zero and empty inventories.
    pub fn empty() -> Self {
        Self {
            heap_used: 0,
            mmap_used: 0,
            heap_count: None,
            uss: 0,
            rss: 0,
            vms: 0,
            open_descriptors: IdSet::new(),
            open_handles: IdSet::new(),
            live_threads: IdSet::new(),
            native_thread_ids: IdSet::new(),
            uncollectable_count: 0,
            uncollectable_ids: IdSet::new(),
            timestamp: Instant::now(),
        }
    }

    /// Value of a memory metric, `None` when the platform does not report it.
    pub fn metric(&self, metric: Metric) -> Option<u64> {
        match metric {
            Metric::Heap => Some(self.heap_used),
            Metric::Mmap => Some(self.mmap_used),
            Metric::HeapCount => self.heap_count,
            Metric::Uss => Some(self.uss),
            Metric::Rss => Some(self.rss),
            Metric::Vms => Some(self.vms),
        }
    }

    /// Signed per-metric delta `self - baseline` for every metric both
    /// snapshots report.
    pub fn deltas_since(&self, baseline: &Snapshot) -> Vec<(Metric, i64)> {
        Metric::ALL
            .into_iter()
            .filter_map(|m| {
                let after = self.metric(m)?;
                let before = baseline.metric(m)?;
                Some((m, signed_diff(after, before)))
            })
            .collect()
    }
}

fn signed_diff(after: u64, before: u64) -> i64 {
    if after >= before {
        i64::try_from(after - before).unwrap_or(i64::MAX)
    } else {
        i64::try_from(before - after).map_or(i64::MIN, |d| -d)
    }
}

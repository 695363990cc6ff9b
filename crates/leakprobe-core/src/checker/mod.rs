//! Single-shot resource checkers.
//!
//! Every checker diffs one resource inventory across the same single
//! invocation of the target. Resource leaks are deterministic per call, so
//! there is no retry: whatever is left over after one call is a finding.

pub mod registry;

use std::fmt;

use serde::Serialize;

use crate::snapshot::{IdSet, Snapshot};

pub use registry::{CheckerConfig, CheckerKind, CheckerNames, ResolvedCheckers};

/// Resource inventories the checkers know about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceCategory {
    /// POSIX file descriptors.
    FileDescriptor,
    /// Windows kernel handles.
    Handle,
    /// Threads spawned through the thread registry.
    ManagedThread,
    /// OS threads unknown to the thread registry.
    NativeThread,
    /// Objects a cycle collector found unreachable but could not free.
    UncollectableObject,
}

impl ResourceCategory {
    /// Singular human-readable name.
    pub fn label(self) -> &'static str {
        match self {
            ResourceCategory::FileDescriptor => "file descriptor",
            ResourceCategory::Handle => "handle",
            ResourceCategory::ManagedThread => "managed thread",
            ResourceCategory::NativeThread => "native thread",
            ResourceCategory::UncollectableObject => "uncollectable object",
        }
    }

    fn inventory(self, snapshot: &Snapshot) -> &IdSet {
        match self {
            ResourceCategory::FileDescriptor => &snapshot.open_descriptors,
            ResourceCategory::Handle => &snapshot.open_handles,
            ResourceCategory::ManagedThread => &snapshot.live_threads,
            ResourceCategory::NativeThread => &snapshot.native_thread_ids,
            ResourceCategory::UncollectableObject => &snapshot.uncollectable_ids,
        }
    }

    /// Threads get a grace period to exit before the after-capture.
    pub fn is_thread(self) -> bool {
        matches!(
            self,
            ResourceCategory::ManagedThread | ResourceCategory::NativeThread
        )
    }

    /// The inventory is only meaningful after a forced collection cycle.
    pub fn needs_collection(self) -> bool {
        self == ResourceCategory::UncollectableObject
    }

    /// Whether `after` holds items of this category that `before` did not.
    pub fn has_grown(self, before: &Snapshot, after: &Snapshot) -> bool {
        !self.inventory(after).is_subset(self.inventory(before))
    }
}

impl fmt::Display for ResourceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Evidence that a checker found unreleased resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeakFinding {
    pub category: ResourceCategory,
    pub leaked_ids: IdSet,
    pub detail: String,
}

/// Before/after inventory diff for one resource category.
#[derive(Debug, Clone)]
pub struct ResourceChecker {
    category: ResourceCategory,
    before: Option<(IdSet, u64)>,
    after: Option<(IdSet, u64)>,
}

impl ResourceChecker {
    pub fn new(category: ResourceCategory) -> Self {
        Self {
            category,
            before: None,
            after: None,
        }
    }

    pub fn category(&self) -> ResourceCategory {
        self.category
    }

    fn extract(&self, snapshot: &Snapshot) -> (IdSet, u64) {
        let ids = self.category.inventory(snapshot).clone();
        let count = match self.category {
            ResourceCategory::UncollectableObject => snapshot.uncollectable_count,
            _ => ids.len() as u64,
        };
        (ids, count)
    }

    pub fn capture_before(&mut self, snapshot: &Snapshot) {
        self.before = Some(self.extract(snapshot));
        self.after = None;
    }

    pub fn capture_after(&mut self, snapshot: &Snapshot) {
        self.after = Some(self.extract(snapshot));
    }

    /// How many items disappeared over the invocation. Fewer resources
    /// after a call is legitimate (lazy cleanup), but worth reporting.
    pub fn reclaimed(&self) -> u64 {
        match (&self.before, &self.after) {
            (Some((_, before)), Some((_, after))) => before.saturating_sub(*after),
            _ => 0,
        }
    }

    /// `None` when nothing new survived the invocation.
    ///
    /// Descriptor numbers get reused by the OS; a new descriptor that took
    /// the number of one closed during the call cannot be told apart from
    /// the closed one and is not reported.
    pub fn diff_and_classify(&self) -> Option<LeakFinding> {
        let (before_ids, before_count) = self.before.as_ref()?;
        let (after_ids, after_count) = self.after.as_ref()?;

        let leaked_ids: IdSet = after_ids.difference(before_ids).copied().collect();
        let grown = match self.category {
            // Uncollectable objects cannot be attributed one by one; the
            // count is the evidence and the ids are best effort.
            ResourceCategory::UncollectableObject => after_count.saturating_sub(*before_count),
            _ => leaked_ids.len() as u64,
        };
        if grown == 0 {
            return None;
        }

        let plural = if grown > 1 { "s" } else { "" };
        let ids = leaked_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Some(LeakFinding {
            category: self.category,
            detail: format!(
                "detected {} unclosed {}{} after calling the target 1 time (ids: {})",
                grown,
                self.category.label(),
                plural,
                if ids.is_empty() { "-" } else { ids.as_str() }
            ),
            leaked_ids,
        })
    }
}

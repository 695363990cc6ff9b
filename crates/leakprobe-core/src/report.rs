//! Verdicts and diagnostics.
//!
//! [`RunRecord`]s are the structured evidence of the memory-trend loop;
//! the textual table rendered from them is presentation only.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::checker::{LeakFinding, ResourceCategory};
use crate::fmt::{format_bytes_delta, format_count_delta};
use crate::snapshot::Metric;

/// One round of the memory-trend loop. Deltas are relative to the
/// baseline taken after warm-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunRecord {
    pub run_index: u32,
    pub calls_this_round: u32,
    pub cumulative_calls: u32,
    pub deltas: BTreeMap<Metric, i64>,
}

fn format_delta(metric: Metric, delta: i64) -> String {
    if metric.is_bytes() {
        format_bytes_delta(delta)
    } else {
        format_count_delta(delta)
    }
}

impl RunRecord {
    pub fn delta(&self, metric: Metric) -> Option<i64> {
        self.deltas.get(&metric).copied()
    }

    /// Average growth per call since the baseline.
    pub fn avg_per_call(&self, metric: Metric) -> Option<i64> {
        let delta = self.delta(metric)?;
        Some(delta / i64::from(self.cumulative_calls.max(1)))
    }

    /// Metrics that grew since the baseline, in report order.
    pub fn grown(&self) -> impl Iterator<Item = (Metric, i64)> + '_ {
        self.deltas
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(m, d)| (*m, *d))
    }

    /// One line of the round table, e.g.
    /// `Run # 2: heap=+1K    | rss=+4K    (calls=  100, avg/call=+16B)`.
    pub fn format_line(&self) -> String {
        let parts: Vec<String> = self
            .grown()
            .map(|(m, d)| format!("{}={:<6}", m, format_delta(m, d)))
            .collect();
        let avg = self
            .grown()
            .next()
            .and_then(|(m, _)| self.avg_per_call(m).map(|avg| format_delta(m, avg)))
            .unwrap_or_else(|| "+0B".to_string());
        format!(
            "Run #{:>2}: {:<50} (calls={:>5}, avg/call={})",
            self.run_index,
            parts.join(" | "),
            self.cumulative_calls,
            avg
        )
    }
}

/// Memory kept growing through the final round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryLeak {
    pub retries: u32,
    /// Metrics still above tolerance in the final round.
    pub leaking: Vec<Metric>,
    /// Every round, in order.
    pub records: Vec<RunRecord>,
}

impl fmt::Display for MemoryLeak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.leaking.iter().map(|m| m.name()).collect();
        write!(
            f,
            "memory kept increasing after {} runs ({})",
            self.retries,
            names.join(", ")
        )?;
        for record in &self.records {
            write!(f, "\n{}", record.format_line())?;
        }
        Ok(())
    }
}

/// One confirmed leak.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Leak {
    #[error("{0}")]
    Memory(MemoryLeak),
    #[error("{}", .0.detail)]
    Descriptor(LeakFinding),
    #[error("{}", .0.detail)]
    Handle(LeakFinding),
    #[error("{}", .0.detail)]
    ManagedThread(LeakFinding),
    #[error("{}", .0.detail)]
    NativeThread(LeakFinding),
    #[error("{}", .0.detail)]
    UncollectableGarbage(LeakFinding),
}

impl From<LeakFinding> for Leak {
    fn from(finding: LeakFinding) -> Self {
        match finding.category {
            ResourceCategory::FileDescriptor => Leak::Descriptor(finding),
            ResourceCategory::Handle => Leak::Handle(finding),
            ResourceCategory::ManagedThread => Leak::ManagedThread(finding),
            ResourceCategory::NativeThread => Leak::NativeThread(finding),
            ResourceCategory::UncollectableObject => Leak::UncollectableGarbage(finding),
        }
    }
}

impl Leak {
    /// The resource finding, `None` for a memory leak.
    pub fn finding(&self) -> Option<&LeakFinding> {
        match self {
            Leak::Memory(_) => None,
            Leak::Descriptor(f)
            | Leak::Handle(f)
            | Leak::ManagedThread(f)
            | Leak::NativeThread(f)
            | Leak::UncollectableGarbage(f) => Some(f),
        }
    }

    pub fn memory(&self) -> Option<&MemoryLeak> {
        match self {
            Leak::Memory(m) => Some(m),
            _ => None,
        }
    }
}

/// Every leak confirmed by one detection run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeakReport {
    pub leaks: Vec<Leak>,
}

impl LeakReport {
    pub fn memory(&self) -> Option<&MemoryLeak> {
        self.leaks.iter().find_map(Leak::memory)
    }

    pub fn finding(&self, category: ResourceCategory) -> Option<&LeakFinding> {
        self.leaks
            .iter()
            .filter_map(Leak::finding)
            .find(|f| f.category == category)
    }
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let plural = if self.leaks.len() == 1 { "" } else { "s" };
        write!(f, "{} leak{} detected", self.leaks.len(), plural)?;
        for leak in &self.leaks {
            write!(f, "\n- {}", leak)?;
        }
        Ok(())
    }
}

/// Outcome of a run that found nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    /// Resource checkers that ran.
    pub resources_checked: Vec<ResourceCategory>,
    /// Memory rounds, empty when the memory check was not selected.
    pub records: Vec<RunRecord>,
}

//! Round bookkeeping and the per-round decision of the memory-trend loop.
//!
//! Allocator and collector noise is roughly constant per measurement while
//! a real per-call leak grows with the number of calls. Every round adds
//! `times` calls on top of the previous ones and is measured against the
//! same baseline, so noise gets diluted and a leak keeps growing. A leak is
//! declared only when growth survives the final round.

use crate::config::{LeakConfig, Tolerance, TrendPolicy};
use crate::report::RunRecord;
use crate::snapshot::{Metric, Snapshot};

/// What to do after a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundDecision {
    /// Every tracked metric is within bounds.
    Pass,
    /// Something is out of bounds and rounds remain.
    Continue,
    /// Out of bounds in the final round; the listed metrics leak.
    Fail(Vec<Metric>),
}

/// Accumulates [`RunRecord`]s and decides each round.
#[derive(Debug, Clone)]
pub struct TrendAnalyzer {
    times: u32,
    retries: u32,
    tolerance: Tolerance,
    policy: TrendPolicy,
    records: Vec<RunRecord>,
}

impl TrendAnalyzer {
    pub fn new(config: &LeakConfig) -> Self {
        Self {
            times: config.times,
            retries: config.retries,
            tolerance: config.tolerance.clone(),
            policy: config.trend_policy,
            records: Vec::with_capacity(config.retries as usize),
        }
    }

    /// Calls to make in the next round.
    pub fn calls_per_round(&self) -> u32 {
        self.times
    }

    pub fn records(&self) -> &[RunRecord] {
        &self.records
    }

    pub fn last(&self) -> Option<&RunRecord> {
        self.records.last()
    }

    pub fn into_records(self) -> Vec<RunRecord> {
        self.records
    }

    fn in_bounds(&self, metric: Metric, delta: i64, previous: Option<&RunRecord>) -> bool {
        if self.tolerance.allows(metric, delta) {
            return true;
        }
        match self.policy {
            TrendPolicy::AboveTolerance => false,
            TrendPolicy::RequireGrowth => previous
                .and_then(|p| p.delta(metric))
                .is_some_and(|prev| delta <= prev),
        }
    }

    /// Records the round measured by `snapshot` and decides what comes next.
    pub fn record(&mut self, baseline: &Snapshot, snapshot: &Snapshot) -> RoundDecision {
        let run_index = self.records.len() as u32 + 1;
        let record = RunRecord {
            run_index,
            calls_this_round: self.times,
            cumulative_calls: self.times.saturating_mul(run_index),
            deltas: snapshot.deltas_since(baseline).into_iter().collect(),
        };

        let out_of_bounds: Vec<Metric> = record
            .deltas
            .iter()
            .filter(|(m, d)| !self.in_bounds(**m, **d, self.records.last()))
            .map(|(m, _)| *m)
            .collect();
        self.records.push(record);

        if out_of_bounds.is_empty() {
            RoundDecision::Pass
        } else if run_index >= self.retries {
            RoundDecision::Fail(out_of_bounds)
        } else {
            RoundDecision::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap(bytes: u64) -> Snapshot {
        let mut snap = Snapshot::empty();
        snap.heap_used = bytes;
        snap
    }

    fn analyzer(times: u32, retries: u32, tolerance: u64, policy: TrendPolicy) -> TrendAnalyzer {
        TrendAnalyzer::new(
            &LeakConfig::new()
                .with_times(times)
                .with_retries(retries)
                .with_tolerance(tolerance)
                .with_trend_policy(policy),
        )
    }

    #[test]
    fn test_pass_when_flat() {
        let mut trend = analyzer(10, 3, 0, TrendPolicy::AboveTolerance);
        assert_eq!(trend.record(&heap(100), &heap(100)), RoundDecision::Pass);
        assert_eq!(trend.records().len(), 1);
    }

    #[test]
    fn test_shrinking_memory_passes() {
        let mut trend = analyzer(10, 3, 0, TrendPolicy::AboveTolerance);
        assert_eq!(trend.record(&heap(100), &heap(40)), RoundDecision::Pass);
        assert_eq!(trend.last().unwrap().delta(Metric::Heap), Some(-60));
    }

    #[test]
    fn test_growth_continues_then_fails_on_last_round() {
        let base = heap(0);
        let mut trend = analyzer(50, 3, 0, TrendPolicy::AboveTolerance);
        assert_eq!(trend.record(&base, &heap(800)), RoundDecision::Continue);
        assert_eq!(trend.record(&base, &heap(1600)), RoundDecision::Continue);
        assert_eq!(
            trend.record(&base, &heap(2400)),
            RoundDecision::Fail(vec![Metric::Heap])
        );

        let cumulative: Vec<u32> = trend.records().iter().map(|r| r.cumulative_calls).collect();
        assert_eq!(cumulative, vec![50, 100, 150]);
        assert!(trend.records().iter().all(|r| r.avg_per_call(Metric::Heap) == Some(16)));
    }

    #[test]
    fn test_growth_within_tolerance_passes() {
        let mut trend = analyzer(50, 3, 1000, TrendPolicy::AboveTolerance);
        assert_eq!(trend.record(&heap(0), &heap(800)), RoundDecision::Pass);
    }

    #[test]
    fn test_transient_growth_passes_once_reclaimed() {
        let base = heap(0);
        let mut trend = analyzer(10, 5, 0, TrendPolicy::AboveTolerance);
        assert_eq!(trend.record(&base, &heap(4096)), RoundDecision::Continue);
        assert_eq!(trend.record(&base, &heap(0)), RoundDecision::Pass);
    }

    #[test]
    fn test_plateau_fails_under_default_policy() {
        let base = heap(0);
        let mut trend = analyzer(10, 2, 0, TrendPolicy::AboveTolerance);
        assert_eq!(trend.record(&base, &heap(4096)), RoundDecision::Continue);
        assert_eq!(
            trend.record(&base, &heap(4096)),
            RoundDecision::Fail(vec![Metric::Heap])
        );
    }

    #[test]
    fn test_plateau_passes_when_growth_required() {
        let base = heap(0);
        let mut trend = analyzer(10, 2, 0, TrendPolicy::RequireGrowth);
        assert_eq!(trend.record(&base, &heap(4096)), RoundDecision::Continue);
        assert_eq!(trend.record(&base, &heap(4096)), RoundDecision::Pass);
    }

    #[test]
    fn test_growth_required_still_fails_on_growth() {
        let base = heap(0);
        let mut trend = analyzer(10, 2, 0, TrendPolicy::RequireGrowth);
        assert_eq!(trend.record(&base, &heap(100)), RoundDecision::Continue);
        assert_eq!(
            trend.record(&base, &heap(200)),
            RoundDecision::Fail(vec![Metric::Heap])
        );
    }

    #[test]
    fn test_fail_lists_only_metrics_above_tolerance() {
        let base = Snapshot::empty();
        let mut after = Snapshot::empty();
        after.heap_used = 100;
        after.rss = 10;
        after.vms = 5000;

        let tolerance = Tolerance::per_metric([("rss", 64), ("vms", 8192)]).unwrap();
        let mut trend = TrendAnalyzer::new(
            &LeakConfig::new()
                .with_times(1)
                .with_retries(1)
                .with_tolerance(tolerance),
        );
        assert_eq!(
            trend.record(&base, &after),
            RoundDecision::Fail(vec![Metric::Heap])
        );
    }
}

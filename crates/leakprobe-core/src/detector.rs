//! Detection run orchestration.
//!
//! A run goes through fixed phases:
//!
//! 1. validate the configuration and resolve the checkers, before any call;
//! 2. warm-up calls, so one-time initialization is not mistaken for a leak;
//! 3. one checked call diffed by every resource checker;
//! 4. trim, baseline, then escalating memory rounds until memory stops
//!    growing or the rounds run out.
//!
//! Findings from every phase are aggregated into a single
//! [`LeakError::Leaked`].

use std::io::Write;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::checker::{LeakFinding, ResolvedCheckers, ResourceChecker};
use crate::config::LeakConfig;
use crate::error::LeakError;
use crate::provider::SnapshotProvider;
use crate::report::{Leak, LeakReport, MemoryLeak, RunRecord, Verdict};
use crate::snapshot::Snapshot;
use crate::trend::{RoundDecision, TrendAnalyzer};

/// Interval between re-captures while waiting for threads to exit.
const GRACE_POLL: Duration = Duration::from_millis(10);

type Target<'t> = dyn FnMut() -> Result<(), LeakError> + 't;

enum MemoryOutcome {
    Stable(Vec<RunRecord>),
    Leaking(MemoryLeak),
}

/// Runs a target repeatedly against a [`SnapshotProvider`] and decides
/// whether it leaks.
pub struct LeakDetector<P: SnapshotProvider> {
    provider: P,
    config: LeakConfig,
    trim_callback: Option<Box<dyn FnMut()>>,
}

impl<P: SnapshotProvider> LeakDetector<P> {
    pub fn new(provider: P, config: LeakConfig) -> Self {
        Self {
            provider,
            config,
            trim_callback: None,
        }
    }

    /// Extra cleanup run after warm-up and before every memory measurement,
    /// e.g. dropping application caches.
    pub fn with_trim_callback(mut self, callback: impl FnMut() + 'static) -> Self {
        self.trim_callback = Some(Box::new(callback));
        self
    }

    pub fn config(&self) -> &LeakConfig {
        &self.config
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn provider_mut(&mut self) -> &mut P {
        &mut self.provider
    }

    pub fn into_provider(self) -> P {
        self.provider
    }

    /// Checks `target` for leaks.
    ///
    /// A panic in the target propagates unchanged.
    pub fn execute<F>(&mut self, mut target: F) -> Result<Verdict, LeakError>
    where
        F: FnMut(),
    {
        self.run(&mut || {
            target();
            Ok(())
        })
    }

    /// Checks a target that is expected to fail on every call, such as an
    /// error path. The first call that succeeds aborts the run with
    /// [`LeakError::UnexpectedSuccess`].
    pub fn execute_expecting_err<F, T, E>(&mut self, mut target: F) -> Result<Verdict, LeakError>
    where
        F: FnMut() -> Result<T, E>,
    {
        let mut call = 0u64;
        self.run(&mut || {
            call += 1;
            match target() {
                Ok(_) => Err(LeakError::UnexpectedSuccess { call }),
                Err(_) => Ok(()),
            }
        })
    }

    fn run(&mut self, target: &mut Target<'_>) -> Result<Verdict, LeakError> {
        self.config.validate()?;
        let resolved = self.config.checkers.resolve(&self.provider.capabilities());
        debug!(
            memory = resolved.memory,
            resources = ?resolved.resources,
            times = self.config.times,
            retries = self.config.retries,
            "Starting leak detection"
        );

        if self.config.warmup_times > 0 {
            debug!(calls = self.config.warmup_times, "Warming up");
            for _ in 0..self.config.warmup_times {
                target()?;
            }
            self.trim();
        }

        let mut leaks: Vec<Leak> = Vec::new();
        if !resolved.resources.is_empty() {
            leaks.extend(self.check_resources(&resolved, target)?.into_iter().map(Leak::from));
        }

        let mut records = Vec::new();
        if resolved.memory {
            match self.check_memory(target)? {
                MemoryOutcome::Stable(r) => records = r,
                MemoryOutcome::Leaking(leak) => leaks.push(Leak::Memory(leak)),
            }
        }

        if !leaks.is_empty() {
            return Err(LeakError::Leaked(LeakReport { leaks }));
        }
        Ok(Verdict {
            resources_checked: resolved.resources,
            records,
        })
    }

    /// Single checked call shared by every resource checker.
    fn check_resources(
        &mut self,
        resolved: &ResolvedCheckers,
        target: &mut Target<'_>,
    ) -> Result<Vec<LeakFinding>, LeakError> {
        let mut checkers: Vec<ResourceChecker> = resolved
            .resources
            .iter()
            .map(|c| ResourceChecker::new(*c))
            .collect();

        if resolved.needs_collection() {
            self.provider.force_collection();
        }
        let before = self.provider.capture()?;
        for checker in &mut checkers {
            checker.capture_before(&before);
        }

        target()?;

        if resolved.needs_collection() {
            self.provider.force_collection();
        }
        let after = self.settle(resolved, &before)?;

        let mut findings = Vec::new();
        for checker in &mut checkers {
            checker.capture_after(&after);
            let reclaimed = checker.reclaimed();
            if reclaimed > 0 {
                warn!(
                    "{} {}(s) were closed after calling the target",
                    reclaimed,
                    checker.category().label()
                );
            }
            match checker.diff_and_classify() {
                Some(finding) => {
                    debug!(category = %checker.category(), ids = finding.leaked_ids.len(), "Leak found");
                    findings.push(finding);
                }
                None => debug!(category = %checker.category(), "No leak"),
            }
        }
        Ok(findings)
    }

    /// Captures the after-snapshot, re-capturing while new threads are
    /// still alive until the grace period runs out.
    fn settle(&mut self, resolved: &ResolvedCheckers, before: &Snapshot) -> Result<Snapshot, LeakError> {
        let mut after = self.provider.capture()?;
        if !resolved.needs_grace_period() {
            return Ok(after);
        }

        let deadline = Instant::now() + self.config.thread_grace();
        let threads_alive = |after: &Snapshot| {
            resolved
                .resources
                .iter()
                .any(|c| c.is_thread() && c.has_grown(before, after))
        };
        while threads_alive(&after) && Instant::now() < deadline {
            thread::sleep(GRACE_POLL);
            after = self.provider.capture()?;
        }
        Ok(after)
    }

    fn check_memory(&mut self, target: &mut Target<'_>) -> Result<MemoryOutcome, LeakError> {
        self.trim();
        let baseline = self.provider.capture()?;
        let mut trend = TrendAnalyzer::new(&self.config);
        let mut reported_growth = false;

        loop {
            for _ in 0..trend.calls_per_round() {
                target()?;
            }
            self.trim();
            let snapshot = self.provider.capture()?;
            let decision = trend.record(&baseline, &snapshot);

            if let Some(record) = trend.last() {
                if record.grown().next().is_some() {
                    reported_growth = true;
                    self.report(1, &record.format_line());
                } else {
                    self.report(2, &record.format_line());
                }
            }

            match decision {
                RoundDecision::Continue => continue,
                RoundDecision::Pass => {
                    if reported_growth && trend.records().len() > 1 {
                        self.report(1, "Memory stabilized (no further growth detected)");
                    }
                    return Ok(MemoryOutcome::Stable(trend.into_records()));
                }
                RoundDecision::Fail(leaking) => {
                    return Ok(MemoryOutcome::Leaking(MemoryLeak {
                        retries: self.config.retries,
                        leaking,
                        records: trend.into_records(),
                    }));
                }
            }
        }
    }

    /// Returns as much free memory as possible before a measurement.
    fn trim(&mut self) {
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();
        if let Some(callback) = self.trim_callback.as_mut() {
            callback();
        }
        self.provider.release_free_memory();
    }

    fn report(&self, level: u8, line: &str) {
        if self.config.verbosity >= level {
            info!("{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::checker::{CheckerConfig, ResourceCategory};
    use crate::collector::SimulatedProcess;
    use crate::config::{Tolerance, TrendPolicy};
    use crate::snapshot::{IdSet, Metric, ResourceId};

    fn config() -> LeakConfig {
        LeakConfig::new()
            .with_times(20)
            .with_retries(3)
            .with_warmup_times(2)
            .with_verbosity(0)
            .with_thread_grace(Duration::from_millis(50))
    }

    fn only(names: &[&str]) -> CheckerConfig {
        CheckerConfig::only(names.iter().copied()).unwrap()
    }

    #[test]
    fn test_clean_target_passes_in_first_round() {
        let sim = SimulatedProcess::new();
        let target = sim.clone();
        let mut detector = LeakDetector::new(sim, config());

        let verdict = detector
            .execute(|| {
                let fd = target.open_fd();
                target.allocate(64);
                target.free(64);
                target.close_fd(fd);
            })
            .unwrap();

        assert_eq!(verdict.records.len(), 1);
        assert!(verdict.records[0].grown().next().is_none());
        assert!(verdict.resources_checked.contains(&ResourceCategory::FileDescriptor));
    }

    #[test]
    fn test_memory_leak_reports_every_round() {
        let sim = SimulatedProcess::new();
        let target = sim.clone();
        let mut detector = LeakDetector::new(
            sim,
            config()
                .with_times(50)
                .with_retries(5)
                .with_checkers(only(&["memory"])),
        );

        let err = detector.execute(|| target.allocate(16)).unwrap_err();
        let leak = err.report().and_then(|r| r.memory()).unwrap();

        assert_eq!(leak.retries, 5);
        assert!(leak.leaking.contains(&Metric::Heap));
        let heap: Vec<i64> = leak.records.iter().filter_map(|r| r.delta(Metric::Heap)).collect();
        assert_eq!(heap, vec![800, 1600, 2400, 3200, 4000]);
        let calls: Vec<u32> = leak.records.iter().map(|r| r.cumulative_calls).collect();
        assert_eq!(calls, vec![50, 100, 150, 200, 250]);
        assert!(leak.records.iter().all(|r| r.avg_per_call(Metric::Heap) == Some(16)));
    }

    #[test]
    fn test_warmup_growth_is_not_a_leak() {
        let sim = SimulatedProcess::new();
        let target = sim.clone();
        let calls = Rc::new(Cell::new(0u32));
        let counter = calls.clone();
        let mut detector = LeakDetector::new(sim, config().with_checkers(only(&["memory"])));

        let verdict = detector
            .execute(|| {
                counter.set(counter.get() + 1);
                if counter.get() == 1 {
                    target.allocate(1 << 20);
                }
            })
            .unwrap();
        assert_eq!(verdict.records.len(), 1);
        assert_eq!(calls.get(), 2 + 20);
    }

    #[test]
    fn test_tolerance_absorbs_noise() {
        let sim = SimulatedProcess::new();
        let target = sim.clone();
        let mut detector = LeakDetector::new(
            sim,
            config()
                .with_warmup_times(0)
                .with_retries(2)
                .with_tolerance(Tolerance::per_metric([("rss", 4096)]).unwrap())
                .with_checkers(only(&["memory"])),
        );

        let grown = Rc::new(Cell::new(false));
        let flag = grown.clone();
        detector
            .execute(|| {
                if !flag.get() {
                    flag.set(true);
                    target.grow_rss(4096);
                }
            })
            .unwrap();
        assert!(grown.get());
    }

    #[test]
    fn test_plateau_passes_only_when_growth_required() {
        fn plateau(policy: TrendPolicy) -> Result<Verdict, LeakError> {
            let sim = SimulatedProcess::new();
            let target = sim.clone();
            let calls = Rc::new(Cell::new(0u32));
            let mut detector = LeakDetector::new(
                sim,
                config()
                    .with_warmup_times(0)
                    .with_retries(3)
                    .with_trend_policy(policy)
                    .with_checkers(only(&["memory"])),
            );
            // Grows during the first round only.
            detector.execute(move || {
                calls.set(calls.get() + 1);
                if calls.get() <= 20 {
                    target.allocate(8);
                }
            })
        }

        let err = plateau(TrendPolicy::AboveTolerance).unwrap_err();
        assert!(err.report().and_then(|r| r.memory()).is_some());

        let verdict = plateau(TrendPolicy::RequireGrowth).unwrap();
        assert_eq!(verdict.records.len(), 2);
    }

    #[test]
    fn test_fd_leak_is_single_shot() {
        for times in [1, 50] {
            let sim = SimulatedProcess::new();
            let target = sim.clone();
            let mut detector = LeakDetector::new(
                sim,
                config()
                    .with_warmup_times(0)
                    .with_times(times)
                    .with_checkers(only(&["fds"])),
            );

            let err = detector
                .execute(|| {
                    target.open_fd();
                })
                .unwrap_err();
            let finding = err.report().unwrap().finding(ResourceCategory::FileDescriptor).unwrap();
            assert_eq!(finding.leaked_ids, IdSet::from([ResourceId(3)]));
            assert_eq!(err.leaks().len(), 1);
            assert!(finding.detail.contains("1 unclosed file descriptor "));
        }
    }

    #[test]
    fn test_memory_only_ignores_fd_leak() {
        let sim = SimulatedProcess::new();
        let target = sim.clone();
        let mut detector = LeakDetector::new(sim, config().with_checkers(only(&["memory"])));
        let verdict = detector
            .execute(|| {
                target.open_fd();
            })
            .unwrap();
        assert!(verdict.resources_checked.is_empty());
    }

    #[test]
    fn test_closed_fd_is_not_a_leak() {
        let sim = SimulatedProcess::new();
        let target = sim.clone();
        let mut detector = LeakDetector::new(sim, config().with_checkers(only(&["fds"])));
        let verdict = detector
            .execute(|| {
                let fd = target.open_fd();
                target.close_fd(fd);
            })
            .unwrap();
        assert_eq!(verdict.resources_checked, vec![ResourceCategory::FileDescriptor]);
        assert!(verdict.records.is_empty());
    }

    #[test]
    fn test_preexisting_fd_closed_by_target_is_not_a_leak() {
        let sim = SimulatedProcess::new();
        let first = sim.open_fd();
        let target = sim.clone();
        let mut detector = LeakDetector::new(
            sim,
            config().with_warmup_times(0).with_checkers(only(&["fds"])),
        );
        detector.execute(|| target.close_fd(first)).unwrap();
    }

    #[test]
    fn test_handle_leak_on_windows() {
        let sim = SimulatedProcess::windows();
        let target = sim.clone();
        let mut detector = LeakDetector::new(sim, config().with_checkers(only(&["handles", "fds"])));

        let err = detector
            .execute(|| {
                target.open_handle();
            })
            .unwrap_err();
        assert_eq!(err.leaks().len(), 1);
        assert!(matches!(err.leaks()[0], Leak::Handle(_)));
    }

    #[test]
    fn test_native_thread_left_running_is_reported() {
        let sim = SimulatedProcess::new();
        let target = sim.clone();
        let mut detector = LeakDetector::new(sim, config().with_checkers(only(&["native_threads"])));

        let err = detector
            .execute(|| {
                target.start_native_thread();
            })
            .unwrap_err();
        let finding = err.report().unwrap().finding(ResourceCategory::NativeThread).unwrap();
        assert_eq!(finding.leaked_ids.len(), 1);
    }

    #[test]
    fn test_joined_native_thread_passes() {
        let sim = SimulatedProcess::new();
        let target = sim.clone();
        let mut detector = LeakDetector::new(sim, config().with_checkers(only(&["native_threads"])));
        detector
            .execute(|| {
                let tid = target.start_native_thread();
                target.join_native_thread(tid);
            })
            .unwrap();
    }

    #[test]
    fn test_thread_exiting_within_grace_period_passes() {
        let sim = SimulatedProcess::new();
        let target = sim.clone();
        let mut detector = LeakDetector::new(
            sim,
            config()
                .with_thread_grace(Duration::from_secs(5))
                .with_checkers(only(&["threads", "native_threads"])),
        );
        detector
            .execute(|| {
                target.start_native_thread_exiting_after(Some(2));
                target.start_managed_thread_exiting_after(Some(3));
            })
            .unwrap();
    }

    #[test]
    fn test_managed_thread_left_running_is_reported() {
        let sim = SimulatedProcess::new();
        let target = sim.clone();
        let mut detector = LeakDetector::new(sim, config().with_checkers(only(&["threads", "native_threads"])));

        let err = detector
            .execute(|| {
                target.start_managed_thread();
            })
            .unwrap_err();
        assert_eq!(err.leaks().len(), 1);
        assert!(matches!(err.leaks()[0], Leak::ManagedThread(_)));
    }

    #[test]
    fn test_uncollectable_garbage() {
        let sim = SimulatedProcess::new();
        let target = sim.clone();
        let observer = sim.clone();
        let mut detector = LeakDetector::new(sim, config().with_checkers(only(&["gc_garbage"])));

        let err = detector
            .execute(|| {
                target.create_cycle();
            })
            .unwrap_err();
        assert!(matches!(err.leaks()[0], Leak::UncollectableGarbage(_)));
        assert!(err.to_string().contains("1 unclosed uncollectable object "));
        assert_eq!(observer.collections(), 2);
    }

    #[test]
    fn test_gc_checker_needs_a_collector() {
        let sim = SimulatedProcess::new().without_cycle_collector();
        let target = sim.clone();
        let mut detector = LeakDetector::new(sim, config().with_checkers(only(&["gc_garbage"])));
        let verdict = detector
            .execute(|| {
                target.create_cycle();
            })
            .unwrap();
        assert!(verdict.resources_checked.is_empty());
    }

    #[test]
    fn test_leaks_are_aggregated() {
        let sim = SimulatedProcess::new();
        let target = sim.clone();
        let mut detector = LeakDetector::new(sim, config());

        let err = detector
            .execute(|| {
                target.open_fd();
                target.allocate(1024);
            })
            .unwrap_err();
        let report = err.report().unwrap();
        assert_eq!(report.leaks.len(), 2);
        assert!(matches!(report.leaks[0], Leak::Descriptor(_)));
        assert!(report.memory().is_some());
        assert!(err.to_string().starts_with("2 leaks detected"));
    }

    #[test]
    fn test_invalid_config_makes_no_calls() {
        let sim = SimulatedProcess::new();
        let observer = sim.clone();
        let calls = Rc::new(Cell::new(0u32));
        let counter = calls.clone();
        let mut detector = LeakDetector::new(sim, config().with_times(0));

        let err = detector.execute(|| counter.set(counter.get() + 1)).unwrap_err();
        assert!(matches!(err, LeakError::InvalidConfig(_)));
        assert_eq!(calls.get(), 0);
        assert_eq!(observer.captures(), 0);
    }

    #[test]
    fn test_metrics_failure_is_not_masked() {
        let sim = SimulatedProcess::new();
        sim.fail_after_captures(1);
        let target = sim.clone();
        let mut detector = LeakDetector::new(sim, config());

        let err = detector
            .execute(|| {
                target.open_fd();
            })
            .unwrap_err();
        assert!(matches!(err, LeakError::MetricsUnavailable(_)));
        assert!(err.leaks().is_empty());
    }

    #[test]
    fn test_expected_error_target() {
        let sim = SimulatedProcess::new();
        let mut detector = LeakDetector::new(sim, config());
        detector
            .execute_expecting_err(|| "x".parse::<u32>())
            .unwrap();
    }

    #[test]
    fn test_unexpected_success_aborts() {
        let sim = SimulatedProcess::new();
        let mut detector = LeakDetector::new(sim, config());
        let calls = Rc::new(Cell::new(0u64));
        let counter = calls.clone();

        let err = detector
            .execute_expecting_err(|| {
                counter.set(counter.get() + 1);
                if counter.get() == 3 { Ok(()) } else { Err("failed") }
            })
            .unwrap_err();
        assert!(matches!(err, LeakError::UnexpectedSuccess { call: 3 }));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_trim_callback_runs_before_measurements() {
        let sim = SimulatedProcess::new();
        let observer = sim.clone();
        let trims = Rc::new(Cell::new(0u32));
        let counter = trims.clone();
        let mut detector = LeakDetector::new(sim, config().with_checkers(only(&["memory"])))
            .with_trim_callback(move || counter.set(counter.get() + 1));

        let verdict = detector.execute(|| {}).unwrap();
        // After warm-up, before the baseline, after the single round.
        assert_eq!(verdict.records.len(), 1);
        assert_eq!(trims.get(), 3);
        assert_eq!(observer.trims(), 3);
    }

    #[test]
    fn test_trim_callback_can_release_caches() {
        let sim = SimulatedProcess::new();
        let target = sim.clone();
        let cache = sim.clone();
        let cached = Rc::new(Cell::new(0u64));
        let pending = cached.clone();
        let mut detector = LeakDetector::new(sim, config().with_checkers(only(&["memory"])))
            .with_trim_callback(move || {
                cache.free(pending.replace(0));
            });

        let c = cached.clone();
        detector
            .execute(|| {
                target.allocate(32);
                c.set(c.get() + 32);
            })
            .unwrap();
    }
}

//! Detection parameters.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::checker::{CheckerConfig, CheckerNames};
use crate::error::LeakError;
use crate::snapshot::Metric;

/// Calls per round.
pub const DEFAULT_TIMES: u32 = 200;
/// Maximum number of rounds.
pub const DEFAULT_RETRIES: u32 = 10;
/// Calls before the baseline is taken.
pub const DEFAULT_WARMUP_TIMES: u32 = 10;
pub const DEFAULT_VERBOSITY: u8 = 1;
/// How long spawned threads get to exit after the single checked call.
pub const DEFAULT_THREAD_GRACE: Duration = Duration::from_millis(500);

/// Largest growth treated as noise rather than a leak.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Tolerance {
    /// Same limit for every metric.
    Uniform(u64),
    /// Per-metric limits; metrics not listed get zero tolerance.
    PerMetric(BTreeMap<Metric, u64>),
}

impl Default for Tolerance {
    fn default() -> Self {
        Tolerance::Uniform(0)
    }
}

impl Tolerance {
    /// Builds a per-metric tolerance from `(name, limit)` pairs.
    pub fn per_metric<I, S>(pairs: I) -> Result<Self, LeakError>
    where
        I: IntoIterator<Item = (S, u64)>,
        S: AsRef<str>,
    {
        let mut limits = BTreeMap::new();
        for (name, limit) in pairs {
            let metric = name.as_ref().parse::<Metric>().map_err(|key| {
                LeakError::InvalidConfig(format!("invalid tolerance key '{}'", key))
            })?;
            limits.insert(metric, limit);
        }
        Ok(Tolerance::PerMetric(limits))
    }

    pub fn for_metric(&self, metric: Metric) -> u64 {
        match self {
            Tolerance::Uniform(limit) => *limit,
            Tolerance::PerMetric(limits) => limits.get(&metric).copied().unwrap_or(0),
        }
    }

    /// Whether `delta` counts as noise for `metric`.
    pub fn allows(&self, metric: Metric, delta: i64) -> bool {
        delta <= 0 || (delta as u64) <= self.for_metric(metric)
    }
}

impl From<u64> for Tolerance {
    fn from(limit: u64) -> Self {
        Tolerance::Uniform(limit)
    }
}

/// How the final decision treats a metric that is above tolerance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendPolicy {
    /// Above tolerance is out of bounds, whatever the trend.
    #[default]
    AboveTolerance,
    /// Above tolerance is still in bounds when the delta did not grow
    /// since the previous round, i.e. memory stabilized.
    RequireGrowth,
}

fn invalid_json(e: serde_json::Error) -> LeakError {
    LeakError::InvalidConfig(format!("cannot parse config: {}", e))
}

/// Parameters of one detection run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeakConfig {
    /// Calls per round; round `r` has run `times * r` calls in total.
    pub times: u32,
    /// Maximum number of rounds before declaring a leak.
    pub retries: u32,
    /// Calls made before the baseline, to absorb one-time initialization.
    pub warmup_times: u32,
    pub tolerance: Tolerance,
    /// 0 = silent, 1 = report growing rounds, 2 = report everything.
    pub verbosity: u8,
    pub checkers: CheckerConfig,
    pub trend_policy: TrendPolicy,
    /// Milliseconds spawned threads get to finish after the checked call.
    pub thread_grace_ms: u64,
}

impl Default for LeakConfig {
    fn default() -> Self {
        Self {
            times: DEFAULT_TIMES,
            retries: DEFAULT_RETRIES,
            warmup_times: DEFAULT_WARMUP_TIMES,
            tolerance: Tolerance::default(),
            verbosity: DEFAULT_VERBOSITY,
            checkers: CheckerConfig::default(),
            trend_policy: TrendPolicy::default(),
            thread_grace_ms: DEFAULT_THREAD_GRACE.as_millis() as u64,
        }
    }
}

impl LeakConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON configuration; missing fields take their defaults.
    ///
    /// Checker names are resolved separately so an unknown name fails with
    /// [`LeakError::UnknownChecker`], as it does through
    /// [`CheckerConfig::only`].
    pub fn from_json(json: &str) -> Result<Self, LeakError> {
        let mut value: serde_json::Value = serde_json::from_str(json).map_err(invalid_json)?;
        let checkers = match value.as_object_mut().and_then(|o| o.remove("checkers")) {
            Some(raw) => {
                let names: CheckerNames = serde_json::from_value(raw).map_err(invalid_json)?;
                Some(CheckerConfig::try_from(names)?)
            }
            None => None,
        };

        let mut config: LeakConfig = serde_json::from_value(value).map_err(invalid_json)?;
        if let Some(checkers) = checkers {
            config.checkers = checkers;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_times(mut self, times: u32) -> Self {
        self.times = times;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_warmup_times(mut self, warmup_times: u32) -> Self {
        self.warmup_times = warmup_times;
        self
    }

    pub fn with_tolerance(mut self, tolerance: impl Into<Tolerance>) -> Self {
        self.tolerance = tolerance.into();
        self
    }

    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn with_checkers(mut self, checkers: CheckerConfig) -> Self {
        self.checkers = checkers;
        self
    }

    pub fn with_trend_policy(mut self, policy: TrendPolicy) -> Self {
        self.trend_policy = policy;
        self
    }

    pub fn with_thread_grace(mut self, grace: Duration) -> Self {
        self.thread_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn thread_grace(&self) -> Duration {
        Duration::from_millis(self.thread_grace_ms)
    }

    /// Rejects parameters that make the run meaningless.
    pub fn validate(&self) -> Result<(), LeakError> {
        if self.times < 1 {
            return Err(LeakError::InvalidConfig(format!(
                "times must be >= 1 (got {})",
                self.times
            )));
        }
        if self.retries < 1 {
            return Err(LeakError::InvalidConfig(format!(
                "retries must be >= 1 (got {})",
                self.retries
            )));
        }
        if self.times.checked_mul(self.retries).is_none() {
            return Err(LeakError::InvalidConfig(format!(
                "times * retries overflows ({} * {})",
                self.times, self.retries
            )));
        }
        Ok(())
    }
}

//! Error taxonomy of a detection run.
//!
//! Configuration errors surface before the target is ever called.
//! Measurement errors abort the run and are never reported as leaks.
//! Confirmed leaks from one run are aggregated into a single
//! [`LeakReport`].

use crate::provider::ProviderError;
use crate::report::{Leak, LeakReport};

#[derive(Debug, thiserror::Error)]
pub enum LeakError {
    /// Invalid run parameters.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A checker name that does not exist.
    #[error("unknown checker {0:?}")]
    UnknownChecker(String),

    /// The snapshot provider failed; the run is aborted, not retried.
    #[error("metrics unavailable: {0}")]
    MetricsUnavailable(#[from] ProviderError),

    /// A target expected to fail on every call returned successfully.
    #[error("target did not fail on call {call}")]
    UnexpectedSuccess { call: u64 },

    /// One or more leaks were confirmed.
    #[error("{0}")]
    Leaked(LeakReport),
}

impl LeakError {
    /// Confirmed leaks, empty for every other kind of error.
    pub fn leaks(&self) -> &[Leak] {
        match self {
            LeakError::Leaked(report) => &report.leaks,
            _ => &[],
        }
    }

    pub fn report(&self) -> Option<&LeakReport> {
        match self {
            LeakError::Leaked(report) => Some(report),
            _ => None,
        }
    }
}

//! Checker selection.
//!
//! A [`CheckerConfig`] names which checks to run; [`CheckerConfig::resolve`]
//! turns it into the concrete ordered set for a given provider, dropping
//! checks the platform or runtime cannot support.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ResourceCategory;
use crate::error::LeakError;
use crate::snapshot::Capabilities;

/// Selectable checks, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckerKind {
    Fds,
    Handles,
    Threads,
    NativeThreads,
    GcGarbage,
    /// Escalating memory-trend analysis.
    Memory,
}

impl CheckerKind {
    pub const ALL: [CheckerKind; 6] = [
        CheckerKind::Fds,
        CheckerKind::Handles,
        CheckerKind::Threads,
        CheckerKind::NativeThreads,
        CheckerKind::GcGarbage,
        CheckerKind::Memory,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CheckerKind::Fds => "fds",
            CheckerKind::Handles => "handles",
            CheckerKind::Threads => "threads",
            CheckerKind::NativeThreads => "native_threads",
            CheckerKind::GcGarbage => "gc_garbage",
            CheckerKind::Memory => "memory",
        }
    }

    /// Resource category diffed by this check; `None` for memory.
    pub fn category(self) -> Option<ResourceCategory> {
        match self {
            CheckerKind::Fds => Some(ResourceCategory::FileDescriptor),
            CheckerKind::Handles => Some(ResourceCategory::Handle),
            CheckerKind::Threads => Some(ResourceCategory::ManagedThread),
            CheckerKind::NativeThreads => Some(ResourceCategory::NativeThread),
            CheckerKind::GcGarbage => Some(ResourceCategory::UncollectableObject),
            CheckerKind::Memory => None,
        }
    }

    /// Whether the provider described by `caps` can support this check.
    pub fn is_applicable(self, caps: &Capabilities) -> bool {
        match self {
            CheckerKind::Fds => caps.platform.is_posix(),
            CheckerKind::Handles => !caps.platform.is_posix(),
            CheckerKind::Threads => caps.managed_threads,
            CheckerKind::GcGarbage => caps.cycle_collector,
            CheckerKind::NativeThreads | CheckerKind::Memory => true,
        }
    }
}

impl fmt::Display for CheckerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CheckerKind {
    type Err = LeakError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CheckerKind::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| LeakError::UnknownChecker(s.to_string()))
    }
}

/// Which checks to run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "CheckerNames")]
pub enum CheckerConfig {
    /// Every applicable check.
    #[default]
    All,
    /// Only the named checks.
    Only(BTreeSet<CheckerKind>),
    /// Everything but the named checks.
    Exclude(BTreeSet<CheckerKind>),
}

/// Checker selection as written in a config file, names not yet checked.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckerNames {
    All,
    Only(Vec<String>),
    Exclude(Vec<String>),
}

impl TryFrom<CheckerNames> for CheckerConfig {
    type Error = LeakError;

    fn try_from(names: CheckerNames) -> Result<Self, Self::Error> {
        match names {
            CheckerNames::All => Ok(CheckerConfig::All),
            CheckerNames::Only(names) => CheckerConfig::only(names),
            CheckerNames::Exclude(names) => CheckerConfig::exclude(names),
        }
    }
}

fn parse_names<I, S>(names: I) -> Result<BTreeSet<CheckerKind>, LeakError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names.into_iter().map(|n| n.as_ref().parse()).collect()
}

impl CheckerConfig {
    /// Selects only the named checks. Fails on the first unknown name.
    pub fn only<I, S>(names: I) -> Result<Self, LeakError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(CheckerConfig::Only(parse_names(names)?))
    }

    /// Selects every check except the named ones. Fails on the first
    /// unknown name.
    pub fn exclude<I, S>(names: I) -> Result<Self, LeakError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(CheckerConfig::Exclude(parse_names(names)?))
    }

    /// Whether the configuration selects `kind`, regardless of platform.
    pub fn is_selected(&self, kind: CheckerKind) -> bool {
        match self {
            CheckerConfig::All => true,
            CheckerConfig::Only(kinds) => kinds.contains(&kind),
            CheckerConfig::Exclude(kinds) => !kinds.contains(&kind),
        }
    }

    /// Resolves the selection against what the provider can observe.
    /// Inapplicable checks are dropped silently.
    pub fn resolve(&self, caps: &Capabilities) -> ResolvedCheckers {
        let enabled: Vec<CheckerKind> = CheckerKind::ALL
            .into_iter()
            .filter(|k| self.is_selected(*k) && k.is_applicable(caps))
            .collect();

        ResolvedCheckers {
            memory: enabled.contains(&CheckerKind::Memory),
            resources: enabled.iter().filter_map(|k| k.category()).collect(),
        }
    }
}

/// Concrete checks for one detection run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCheckers {
    /// Run the memory-trend analysis.
    pub memory: bool,
    /// Resource checkers, in execution order. May be empty.
    pub resources: Vec<ResourceCategory>,
}

impl ResolvedCheckers {
    pub fn needs_grace_period(&self) -> bool {
        self.resources.iter().any(|c| c.is_thread())
    }

    pub fn needs_collection(&self) -> bool {
        self.resources.iter().any(|c| c.needs_collection())
    }
}

//! Transaction manager configuration.

use crate::error::CoreError;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Concurrency-control policy used by every transaction of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StrategyKind {
    /// No conflict detection.
    None,
    /// Takes a tid at begin, nothing else.
    TidOnly,
    /// Fails the vote on any overlap.
    Simple,
    /// Merges overlapping writes field by field.
    #[default]
    Resolve,
    /// `Resolve` with tid and backend transaction deferred to the store phase.
    ResolveReadCommitted,
    /// Per-object locks taken on first touch.
    Lock,
    /// Trusts backend serial verification; no vote check.
    Serializable,
    /// `Resolve` with the backend transaction deferred to the store phase.
    Transactionless,
}

impl StrategyKind {
    /// Every policy, in declaration order.
    pub const ALL: [StrategyKind; 8] = [
        StrategyKind::None,
        StrategyKind::TidOnly,
        StrategyKind::Simple,
        StrategyKind::Resolve,
        StrategyKind::ResolveReadCommitted,
        StrategyKind::Lock,
        StrategyKind::Serializable,
        StrategyKind::Transactionless,
    ];

    /// Configuration name of the policy.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::None => "none",
            StrategyKind::TidOnly => "tid-only",
            StrategyKind::Simple => "simple",
            StrategyKind::Resolve => "resolve",
            StrategyKind::ResolveReadCommitted => "resolve-readcommitted",
            StrategyKind::Lock => "lock",
            StrategyKind::Serializable => "serializable",
            StrategyKind::Transactionless => "transactionless",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CoreError::UnknownStrategy(s.to_string()))
    }
}

/// Configuration for a [`TransactionManager`](crate::TransactionManager).
#[derive(Debug, Clone)]
pub struct Config {
    /// Database id, used as the cache key prefix.
    pub db_id: String,

    /// Concurrency-control policy.
    pub strategy: StrategyKind,

    /// Attempts made by [`TransactionManager::run`](crate::TransactionManager::run).
    pub max_retries: u32,

    /// How long the lock strategy waits for an object lock.
    pub lock_timeout: Duration,

    /// Whether transactions reject writes.
    pub read_only: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_id: "db".to_string(),
            strategy: StrategyKind::default(),
            max_retries: 3,
            lock_timeout: Duration::from_secs(3),
            read_only: false,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the database id.
    #[must_use]
    pub fn db_id(mut self, id: impl Into<String>) -> Self {
        self.db_id = id.into();
        self
    }

    /// Sets the strategy.
    #[must_use]
    pub const fn strategy(mut self, kind: StrategyKind) -> Self {
        self.strategy = kind;
        self
    }

    /// Sets the attempt limit of `run`.
    #[must_use]
    pub const fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    /// Sets the lock wait limit.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Makes transactions read-only.
    #[must_use]
    pub const fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }
}

//! Configuration structures for archive assembly

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use tarstitch_formats::{PartLimits, SplitStrategy};

use crate::error::{StoreError, StoreResult};
use crate::retry::RetryPolicy;

/// Upper bound on assembly workers
pub const MAX_THREADS: usize = 1024;

/// Whether sources are re-checked against the layout before copying
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftCheck {
    /// Trust the listing
    Off,
    /// Compare size and etag of every source before its bytes are used
    #[default]
    Strict,
}

impl FromStr for DriftCheck {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "strict" => Ok(Self::Strict),
            other => Err(StoreError::InvalidConfig(format!(
                "unknown drift check mode {other:?} (expected off or strict)"
            ))),
        }
    }
}

impl fmt::Display for DriftCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Off => "off",
            Self::Strict => "strict",
        })
    }
}

/// Parse a split strategy name
pub fn parse_split_strategy(s: &str) -> StoreResult<SplitStrategy> {
    match s.to_ascii_lowercase().as_str() {
        "midpoint" => Ok(SplitStrategy::Midpoint),
        "minimum" => Ok(SplitStrategy::Minimum),
        other => Err(StoreError::InvalidConfig(format!(
            "unknown split strategy {other:?} (expected midpoint or minimum)"
        ))),
    }
}

/// Settings for archive assembly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssemblyConfig {
    /// Concurrent part workers
    pub threads: usize,

    /// Multipart limits of the destination store
    pub part_limits: PartLimits,

    /// Part count used for large server-side copies
    pub split_strategy: SplitStrategy,

    /// Source verification before copying
    pub drift_check: DriftCheck,

    /// Retry policy for transient store failures
    pub retry_policy: RetryPolicy,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            threads: 16,
            part_limits: PartLimits::S3,
            split_strategy: SplitStrategy::Midpoint,
            drift_check: DriftCheck::Strict,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl AssemblyConfig {
    /// Create configuration from environment variables
    ///
    /// Unset or unparsable numeric values fall back to defaults; unknown
    /// mode names are errors.
    pub fn from_env() -> StoreResult<Self> {
        let defaults = PartLimits::S3;
        let config = Self {
            threads: std::env::var("TARSTITCH_THREADS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(16),
            part_limits: PartLimits {
                min_part_size: std::env::var("TARSTITCH_MIN_PART_SIZE")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.min_part_size),
                max_part_size: std::env::var("TARSTITCH_MAX_PART_SIZE")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.max_part_size),
                max_part_count: std::env::var("TARSTITCH_MAX_PART_COUNT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.max_part_count),
            },
            split_strategy: match std::env::var("TARSTITCH_SPLIT_STRATEGY") {
                Ok(value) => parse_split_strategy(&value)?,
                Err(_) => SplitStrategy::default(),
            },
            drift_check: match std::env::var("TARSTITCH_DRIFT_CHECK") {
                Ok(value) => value.parse()?,
                Err(_) => DriftCheck::default(),
            },
            retry_policy: RetryPolicy::from_env()?,
        };
        Ok(config)
    }

    /// Set the worker count
    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Set the multipart limits
    #[must_use]
    pub fn with_part_limits(mut self, part_limits: PartLimits) -> Self {
        self.part_limits = part_limits;
        self
    }

    /// Set the split strategy
    #[must_use]
    pub fn with_split_strategy(mut self, split_strategy: SplitStrategy) -> Self {
        self.split_strategy = split_strategy;
        self
    }

    /// Set the drift check mode
    #[must_use]
    pub fn with_drift_check(mut self, drift_check: DriftCheck) -> Self {
        self.drift_check = drift_check;
        self
    }

    /// Set the retry policy
    #[must_use]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Check every value before any store call is made
    pub fn validate(&self) -> StoreResult<()> {
        if self.threads == 0 || self.threads > MAX_THREADS {
            return Err(StoreError::InvalidConfig(format!(
                "threads must be between 1 and {MAX_THREADS}, got {}",
                self.threads
            )));
        }
        self.retry_policy.validate()?;
        self.part_limits.validate()?;
        Ok(())
    }
}

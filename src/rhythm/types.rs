// Rhythm Types
//
// Rhythm classes, their per-type execution metrics, and the clock the
// scheduler reads wall time from.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{HypnosError, Result};
use crate::resilience::degradation::{Capability, Dependency};

/// Named class of scheduled work, ordered by increasing interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RhythmType {
    Continuous,
    ShortTerm,
    LongTerm,
    DeepSleep,
    RemSleep,
    Homeostasis,
}

impl RhythmType {
    pub const ALL: [RhythmType; 6] = [
        RhythmType::Continuous,
        RhythmType::ShortTerm,
        RhythmType::LongTerm,
        RhythmType::DeepSleep,
        RhythmType::RemSleep,
        RhythmType::Homeostasis,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RhythmType::Continuous => "continuous",
            RhythmType::ShortTerm => "short_term",
            RhythmType::LongTerm => "long_term",
            RhythmType::DeepSleep => "deep_sleep",
            RhythmType::RemSleep => "rem_sleep",
            RhythmType::Homeostasis => "homeostasis",
        }
    }

    /// Dependency whose circuit breaker guards this rhythm's cycles
    pub fn primary_dependency(self) -> Dependency {
        match self {
            RhythmType::Continuous => Dependency::SourceDatabase,
            RhythmType::RemSleep => Dependency::LlmService,
            _ => Dependency::StorageEngine,
        }
    }

    /// Capability that must be enabled for this rhythm to run
    pub fn capability(self) -> Capability {
        match self {
            RhythmType::Continuous => Capability::WorkingMemoryIngestion,
            RhythmType::ShortTerm | RhythmType::LongTerm | RhythmType::Homeostasis => {
                Capability::Consolidation
            }
            RhythmType::DeepSleep => Capability::DeepConsolidation,
            RhythmType::RemSleep => Capability::RemSleep,
        }
    }

    /// Dead-letter operation name for deferred cycles of this rhythm
    pub fn operation(self) -> String {
        format!("{}{}", Self::OPERATION_PREFIX, self.as_str())
    }

    pub const OPERATION_PREFIX: &'static str = "rhythm.";

    /// Inverse of [`RhythmType::operation`]
    pub fn from_operation(operation: &str) -> Option<Self> {
        operation
            .strip_prefix(Self::OPERATION_PREFIX)
            .and_then(|name| name.parse().ok())
    }
}

impl std::fmt::Display for RhythmType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RhythmType {
    type Err = HypnosError;

    fn from_str(s: &str) -> Result<Self> {
        RhythmType::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| HypnosError::Validation(format!("Unknown rhythm type: {}", s)))
    }
}

/// Execution statistics for one rhythm, kept for the process lifetime
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleMetrics {
    /// Attempts made, successful or not
    pub count: u64,

    /// Attempts that raised or reported failure
    pub failures: u64,

    /// Cumulative mean duration across all attempts
    #[serde(with = "crate::config::serde_duration_millis")]
    pub avg_duration: Duration,

    /// Last successful run
    pub last_run: Option<DateTime<Local>>,
}

impl CycleMetrics {
    /// Fold one attempt into the metrics. `last_run` only moves on success.
    pub fn record(&mut self, started_at: DateTime<Local>, duration: Duration, success: bool) {
        self.count += 1;
        if !success {
            self.failures += 1;
        } else {
            self.last_run = Some(started_at);
        }

        let n = self.count as f64;
        let avg = self.avg_duration.as_secs_f64();
        let updated = avg + (duration.as_secs_f64() - avg) / n;
        self.avg_duration = Duration::from_secs_f64(updated.max(0.0));
    }

    pub fn failure_rate(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.failures as f64 / self.count as f64
        }
    }
}

/// Source of wall-clock time for scheduling decisions
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

/// Clock backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

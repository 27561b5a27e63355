//! Circadian phase detection
//!
//! Maps a wall-clock hour onto one of five phases. The ranges partition the
//! day exactly:
//!
//! | Phase          | Hours      |
//! |----------------|------------|
//! | `WakeActive`   | 06..=21    |
//! | `WakeQuiet`    | 22         |
//! | `LightSleep`   | 23, 00, 01 |
//! | `DeepSleep`    | 02, 03     |
//! | `RemDominant`  | 04, 05     |

use serde::{Deserialize, Serialize};

/// Wall-clock bucket gating which rhythm cycles may run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircadianPhase {
    WakeActive,
    WakeQuiet,
    LightSleep,
    DeepSleep,
    RemDominant,
}

impl CircadianPhase {
    pub const ALL: [CircadianPhase; 5] = [
        CircadianPhase::WakeActive,
        CircadianPhase::WakeQuiet,
        CircadianPhase::LightSleep,
        CircadianPhase::DeepSleep,
        CircadianPhase::RemDominant,
    ];

    /// Phase for an hour of the day. Hours past 23 wrap modulo 24.
    pub fn from_hour(hour: u32) -> Self {
        match hour % 24 {
            6..=21 => CircadianPhase::WakeActive,
            22 => CircadianPhase::WakeQuiet,
            23 | 0 | 1 => CircadianPhase::LightSleep,
            2 | 3 => CircadianPhase::DeepSleep,
            _ => CircadianPhase::RemDominant,
        }
    }

    pub fn is_awake(self) -> bool {
        matches!(self, CircadianPhase::WakeActive | CircadianPhase::WakeQuiet)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CircadianPhase::WakeActive => "wake_active",
            CircadianPhase::WakeQuiet => "wake_quiet",
            CircadianPhase::LightSleep => "light_sleep",
            CircadianPhase::DeepSleep => "deep_sleep",
            CircadianPhase::RemDominant => "rem_dominant",
        }
    }
}

impl std::fmt::Display for CircadianPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase for an hour of the day
pub fn phase(hour: u32) -> CircadianPhase {
    CircadianPhase::from_hour(hour)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_boundaries() {
        assert_eq!(phase(5), CircadianPhase::RemDominant);
        assert_eq!(phase(6), CircadianPhase::WakeActive);
        assert_eq!(phase(21), CircadianPhase::WakeActive);
        assert_eq!(phase(22), CircadianPhase::WakeQuiet);
        assert_eq!(phase(23), CircadianPhase::LightSleep);
        assert_eq!(phase(0), CircadianPhase::LightSleep);
        assert_eq!(phase(1), CircadianPhase::LightSleep);
        assert_eq!(phase(2), CircadianPhase::DeepSleep);
        assert_eq!(phase(3), CircadianPhase::DeepSleep);
        assert_eq!(phase(4), CircadianPhase::RemDominant);
    }

    #[test]
    fn test_partition_covers_day() {
        let mut counts = std::collections::HashMap::new();
        for hour in 0..24 {
            *counts.entry(phase(hour)).or_insert(0) += 1;
        }

        assert_eq!(counts.len(), CircadianPhase::ALL.len());
        assert_eq!(counts.values().sum::<i32>(), 24);
        assert_eq!(counts[&CircadianPhase::WakeActive], 16);
        assert_eq!(counts[&CircadianPhase::WakeQuiet], 1);
        assert_eq!(counts[&CircadianPhase::LightSleep], 3);
        assert_eq!(counts[&CircadianPhase::DeepSleep], 2);
        assert_eq!(counts[&CircadianPhase::RemDominant], 2);
    }

    proptest! {
        #[test]
        fn prop_hour_wraps(hour in 0u32..24, days in 0u32..10) {
            prop_assert_eq!(phase(hour), phase(hour + days * 24));
        }
    }
}

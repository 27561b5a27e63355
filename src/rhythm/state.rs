// Scheduler State
//
// Last successful run per rhythm, persisted as JSON so a timer-driven
// `tick` invocation sees the timing left by the previous one.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

use super::scheduler::RhythmScheduler;
use super::types::RhythmType;
use crate::error::{HypnosError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub last_runs: BTreeMap<RhythmType, DateTime<Local>>,
}

impl SchedulerState {
    /// Read state from `path`; a missing file is an empty state
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No scheduler state yet");
            return Ok(Self::default());
        }
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(|e| {
            HypnosError::DataCorruption(format!("Failed to parse scheduler state: {}", e))
        })
    }

    /// Read state, treating an unreadable file as empty
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable scheduler state");
            Self::default()
        })
    }

    /// Write via a temporary file and rename so a crash never leaves a
    /// truncated state file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Snapshot the scheduler's last runs
    pub fn capture(scheduler: &RhythmScheduler) -> Self {
        let last_runs = RhythmType::ALL
            .into_iter()
            .filter_map(|r| scheduler.last_run(r).map(|at| (r, at)))
            .collect();
        Self { last_runs }
    }

    /// Seed a scheduler with these last runs
    pub fn restore(&self, scheduler: &RhythmScheduler) {
        for (rhythm, at) in &self.last_runs {
            scheduler.restore_last_run(*rhythm, *at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = SchedulerState::load(&dir.path().join("state.json")).unwrap();
        assert!(state.last_runs.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state.json");

        let mut state = SchedulerState::default();
        let at = Local::now();
        state.last_runs.insert(RhythmType::LongTerm, at);
        state.save(&path).unwrap();

        let loaded = SchedulerState::load(&path).unwrap();
        assert_eq!(loaded.last_runs.get(&RhythmType::LongTerm), Some(&at));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(SchedulerState::load(&path).is_err());
        assert!(SchedulerState::load_or_default(&path).last_runs.is_empty());
    }
}

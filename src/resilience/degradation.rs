//! Graceful degradation policy
//!
//! A fixed compatibility matrix from "dependency X is down" to the
//! capabilities that must stop. Dependencies are an enum so an unknown name
//! fails when it is parsed, never silently at lookup time.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

use crate::error::{HypnosError, Result};

/// External dependency guarded by its own circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dependency {
    /// Analytical storage engine holding consolidated data ("duckdb")
    StorageEngine,
    /// LLM / embedding service ("ollama")
    LlmService,
    /// Upstream operational database ("postgres")
    SourceDatabase,
}

impl Dependency {
    pub const ALL: [Dependency; 3] = [
        Dependency::StorageEngine,
        Dependency::LlmService,
        Dependency::SourceDatabase,
    ];

    /// Canonical breaker name
    pub fn name(self) -> &'static str {
        match self {
            Dependency::StorageEngine => "duckdb",
            Dependency::LlmService => "ollama",
            Dependency::SourceDatabase => "postgres",
        }
    }
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Dependency {
    type Err = HypnosError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "duckdb" | "storage" | "storage_engine" => Ok(Dependency::StorageEngine),
            "ollama" | "llm" | "embedding" | "llm_service" => Ok(Dependency::LlmService),
            "postgres" | "source" | "source_database" => Ok(Dependency::SourceDatabase),
            other => Err(HypnosError::UnknownDependency(other.to_string())),
        }
    }
}

/// Unit of work that can be switched off while a dependency is down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    WorkingMemoryIngestion,
    Consolidation,
    DeepConsolidation,
    RemSleep,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::WorkingMemoryIngestion,
        Capability::Consolidation,
        Capability::DeepConsolidation,
        Capability::RemSleep,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::WorkingMemoryIngestion => "working_memory_ingestion",
            Capability::Consolidation => "consolidation",
            Capability::DeepConsolidation => "deep_consolidation",
            Capability::RemSleep => "rem_sleep",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capabilities a single failed dependency switches off
pub fn disabled_by(dependency: Dependency) -> &'static [Capability] {
    match dependency {
        Dependency::StorageEngine => &[Capability::Consolidation, Capability::DeepConsolidation],
        Dependency::LlmService => &[Capability::RemSleep],
        Dependency::SourceDatabase => &[Capability::WorkingMemoryIngestion],
    }
}

/// Enabled/disabled view over every capability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    disabled: BTreeSet<Capability>,
}

impl Default for CapabilitySet {
    fn default() -> Self {
        Self::all_enabled()
    }
}

impl CapabilitySet {
    pub fn all_enabled() -> Self {
        Self {
            disabled: BTreeSet::new(),
        }
    }

    /// Capabilities left when every listed dependency is down
    pub fn degraded_by<I>(failed: I) -> Self
    where
        I: IntoIterator<Item = Dependency>,
    {
        let disabled = failed
            .into_iter()
            .flat_map(|dep| disabled_by(dep).iter().copied())
            .collect();
        Self { disabled }
    }

    pub fn is_enabled(&self, capability: Capability) -> bool {
        !self.disabled.contains(&capability)
    }

    pub fn disabled(&self) -> impl Iterator<Item = Capability> + '_ {
        self.disabled.iter().copied()
    }

    pub fn enabled(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL
            .into_iter()
            .filter(move |c| !self.disabled.contains(c))
    }

    pub fn is_degraded(&self) -> bool {
        !self.disabled.is_empty()
    }
}

/// Capability map for one failed dependency, by name.
///
/// Unknown names are rejected with [`HypnosError::UnknownDependency`].
pub fn degradation_policy(dependency_name: &str) -> Result<CapabilitySet> {
    let dependency: Dependency = dependency_name.parse()?;
    Ok(CapabilitySet::degraded_by([dependency]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_outage_disables_rem_only() {
        let caps = degradation_policy("ollama").unwrap();
        assert!(!caps.is_enabled(Capability::RemSleep));
        assert!(caps.is_enabled(Capability::Consolidation));
        assert!(caps.is_enabled(Capability::DeepConsolidation));
        assert!(caps.is_enabled(Capability::WorkingMemoryIngestion));
    }

    #[test]
    fn test_storage_outage_keeps_ingestion() {
        let caps = degradation_policy("duckdb").unwrap();
        assert!(!caps.is_enabled(Capability::Consolidation));
        assert!(!caps.is_enabled(Capability::DeepConsolidation));
        assert!(caps.is_enabled(Capability::WorkingMemoryIngestion));
        assert!(caps.is_enabled(Capability::RemSleep));
    }

    #[test]
    fn test_source_outage_keeps_consolidation() {
        let caps = degradation_policy("postgres").unwrap();
        assert!(!caps.is_enabled(Capability::WorkingMemoryIngestion));
        assert!(caps.is_enabled(Capability::Consolidation));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err = degradation_policy("redis").unwrap_err();
        assert!(matches!(err, HypnosError::UnknownDependency(_)));
    }

    #[test]
    fn test_combined_outages() {
        let caps =
            CapabilitySet::degraded_by([Dependency::LlmService, Dependency::SourceDatabase]);
        let enabled: Vec<_> = caps.enabled().collect();
        assert_eq!(
            enabled,
            vec![Capability::Consolidation, Capability::DeepConsolidation]
        );
        assert!(caps.is_degraded());
        assert!(!CapabilitySet::all_enabled().is_degraded());
    }
}

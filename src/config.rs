// Hypnos Configuration
//
// Defines configuration for rhythm scheduling, circuit breakers, retries,
// the dead-letter store, the embedding cache and batch processing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{HypnosError, Result};
use crate::resilience::degradation::Dependency;
use crate::rhythm::types::RhythmType;

/// Environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "HYPNOS_CONFIG";

/// Main configuration, injected once at the composition root
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HypnosConfig {
    pub scheduler: SchedulerConfig,
    pub breakers: BreakersConfig,
    pub retry: RetryConfig,
    pub dead_letter: DeadLetterConfig,
    pub cache: CacheConfig,
    pub batch: BatchConfig,
    pub resources: ResourceConfig,
    pub processor: ProcessorConfig,
}

/// Rhythm cadences and loop timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Loop tick interval
    #[serde(with = "serde_duration_millis")]
    pub tick_interval: Duration,

    /// Upper bound on one processor call
    #[serde(with = "serde_duration")]
    pub cycle_timeout: Duration,

    /// Bound on joining the loop worker during stop
    #[serde(with = "serde_duration")]
    pub stop_timeout: Duration,

    #[serde(with = "serde_duration")]
    pub continuous_interval: Duration,

    #[serde(with = "serde_duration")]
    pub short_term_interval: Duration,

    #[serde(with = "serde_duration")]
    pub long_term_interval: Duration,

    /// Spacing from the last LONG_TERM run (and the last REM run)
    #[serde(with = "serde_duration")]
    pub rem_interval: Duration,

    #[serde(with = "serde_duration")]
    pub homeostasis_interval: Duration,

    /// Day homeostasis runs on (0 = Sunday)
    pub homeostasis_weekday: u32,

    /// Hour homeostasis runs at
    pub homeostasis_hour: u32,

    /// Replay deferred cycles from the dead-letter queue each tick
    pub replay_deferred: bool,

    /// Last-run timestamps persisted between invocations; defaults under the
    /// user's data directory
    pub state_path: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            cycle_timeout: Duration::from_secs(1800), // 30 minutes
            stop_timeout: Duration::from_secs(10),
            continuous_interval: Duration::from_secs(300), // 5 minutes
            short_term_interval: Duration::from_secs(1200), // 20 minutes
            long_term_interval: Duration::from_secs(5400), // 90 minutes
            rem_interval: Duration::from_secs(5400),       // 90 minutes
            homeostasis_interval: Duration::from_secs(604800), // 7 days
            homeostasis_weekday: 0,
            homeostasis_hour: 3,
            replay_deferred: true,
            state_path: None,
        }
    }
}

impl SchedulerConfig {
    pub fn resolved_state_path(&self) -> PathBuf {
        self.state_path
            .clone()
            .unwrap_or_else(|| data_dir().join("scheduler_state.json"))
    }

    /// Minimum spacing between runs; `None` for calendar-gated rhythms
    pub fn interval_for(&self, rhythm: RhythmType) -> Option<Duration> {
        match rhythm {
            RhythmType::Continuous => Some(self.continuous_interval),
            RhythmType::ShortTerm => Some(self.short_term_interval),
            RhythmType::LongTerm => Some(self.long_term_interval),
            RhythmType::DeepSleep => None,
            RhythmType::RemSleep => Some(self.rem_interval),
            RhythmType::Homeostasis => Some(self.homeostasis_interval),
        }
    }
}

/// Thresholds for one circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,

    #[serde(with = "serde_duration")]
    pub timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Default breaker thresholds plus per-dependency overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakersConfig {
    pub default: BreakerConfig,
    pub overrides: BTreeMap<Dependency, BreakerConfig>,
}

impl BreakersConfig {
    pub fn for_dependency(&self, dependency: Dependency) -> BreakerConfig {
        self.overrides
            .get(&dependency)
            .copied()
            .unwrap_or(self.default)
    }
}

/// Local retry with exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,

    #[serde(with = "serde_duration_millis")]
    pub base_delay: Duration,

    pub multiplier: f64,

    #[serde(with = "serde_duration_millis")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Durable dead-letter store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    pub enabled: bool,

    /// SQLite file; defaults under the user's data directory
    pub path: Option<PathBuf>,

    #[serde(with = "serde_duration")]
    pub retry_delay: Duration,

    pub backoff_multiplier: f64,

    pub max_retries: u32,

    /// Restrict the database file to owner read/write on Unix
    pub restrict_permissions: bool,

    pub pool_size: usize,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            retry_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            max_retries: 5,
            restrict_permissions: true,
            pool_size: 4,
        }
    }
}

impl DeadLetterConfig {
    pub fn resolved_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| data_dir().join("dead_letters.db"))
    }
}

/// Embedding cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(with = "serde_duration")]
    pub ttl: Duration,

    /// Capacity of the in-process LRU
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(604800), // 7 days
            max_entries: 10_000,
        }
    }
}

/// Batch embedding generation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub model: String,

    pub max_concurrency: usize,

    #[serde(with = "serde_duration")]
    pub call_timeout: Duration,

    pub embedding_dimension: usize,

    pub min_magnitude: f32,

    pub max_magnitude: f32,

    /// Texts longer than this many characters are truncated before embedding
    pub max_text_chars: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            model: "nomic-embed-text".to_string(),
            max_concurrency: 10,
            call_timeout: Duration::from_secs(30),
            embedding_dimension: 768,
            min_magnitude: 0.01,
            max_magnitude: 1000.0,
            max_text_chars: 8192,
        }
    }
}

/// Resource sampling thresholds (percentages)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub enabled: bool,

    /// Filesystem whose free space is sampled; defaults to the data directory
    pub disk_path: Option<PathBuf>,

    pub memory_critical_pct: f64,

    pub disk_critical_pct: f64,

    pub cpu_critical_pct: f64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            disk_path: None,
            memory_critical_pct: 90.0,
            disk_critical_pct: 95.0,
            cpu_critical_pct: 95.0,
        }
    }
}

/// External transformation runner invoked per cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Executable, e.g. "dbt"
    pub command: String,

    /// Arguments placed before the selector
    pub args: Vec<String>,

    /// Flag introducing the selector
    pub selector_flag: String,

    /// Selector per rhythm; rhythms without one run with no selector
    pub selectors: BTreeMap<RhythmType, String>,

    pub working_dir: Option<PathBuf>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        let selectors = RhythmType::ALL
            .into_iter()
            .map(|r| (r, format!("tag:{}", r.as_str())))
            .collect();
        Self {
            command: "dbt".to_string(),
            args: vec!["run".to_string()],
            selector_flag: "--select".to_string(),
            selectors,
            working_dir: None,
        }
    }
}

// Custom serde module for Duration (serialize/deserialize as seconds)
pub mod serde_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Custom serde module for Duration (serialize/deserialize as milliseconds)
pub mod serde_duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Data directory using the XDG_DATA_HOME standard
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hypnos")
}

/// Config path from an explicit argument, then HYPNOS_CONFIG, then the default
pub fn resolve_config_path(cli_path: Option<PathBuf>) -> PathBuf {
    cli_path
        .or_else(|| {
            std::env::var(CONFIG_ENV_VAR)
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
        })
        .unwrap_or_else(|| data_dir().join("hypnos.toml"))
}

impl HypnosConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load from file when it exists, otherwise defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: HypnosConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let toml_str =
            toml::to_string_pretty(self).map_err(|e| HypnosError::Config(e.to_string()))?;
        std::fs::write(path, toml_str)?;
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if s.tick_interval.is_zero() {
            return invalid("scheduler: tick_interval must be positive");
        }
        if s.cycle_timeout.is_zero() {
            return invalid("scheduler: cycle_timeout must be positive");
        }
        for rhythm in RhythmType::ALL {
            if let Some(interval) = s.interval_for(rhythm) {
                if interval.is_zero() {
                    return invalid(&format!("scheduler: {} interval must be positive", rhythm));
                }
            }
        }
        if s.homeostasis_weekday > 6 {
            return invalid("scheduler: homeostasis_weekday must be between 0 and 6");
        }
        if s.homeostasis_hour > 23 {
            return invalid("scheduler: homeostasis_hour must be between 0 and 23");
        }

        let breakers = std::iter::once(&self.breakers.default).chain(self.breakers.overrides.values());
        for breaker in breakers {
            if breaker.failure_threshold == 0 {
                return invalid("breakers: failure_threshold must be at least 1");
            }
            if breaker.timeout.is_zero() {
                return invalid("breakers: timeout must be positive");
            }
        }

        if self.retry.multiplier < 1.0 {
            return invalid("retry: multiplier must be at least 1.0");
        }
        if self.retry.max_delay < self.retry.base_delay {
            return invalid("retry: max_delay must not be below base_delay");
        }

        if self.dead_letter.backoff_multiplier < 1.0 {
            return invalid("dead_letter: backoff_multiplier must be at least 1.0");
        }
        if self.dead_letter.pool_size == 0 {
            return invalid("dead_letter: pool_size must be at least 1");
        }

        if self.cache.max_entries == 0 {
            return invalid("cache: max_entries must be at least 1");
        }

        let b = &self.batch;
        if b.max_concurrency == 0 {
            return invalid("batch: max_concurrency must be at least 1");
        }
        if b.embedding_dimension == 0 {
            return invalid("batch: embedding_dimension must be at least 1");
        }
        if !(b.min_magnitude >= 0.0 && b.min_magnitude < b.max_magnitude) {
            return invalid("batch: magnitude band must satisfy 0 <= min < max");
        }
        if b.max_text_chars == 0 {
            return invalid("batch: max_text_chars must be at least 1");
        }
        if b.call_timeout.is_zero() {
            return invalid("batch: call_timeout must be positive");
        }

        let r = &self.resources;
        for pct in [r.memory_critical_pct, r.disk_critical_pct, r.cpu_critical_pct] {
            if !(0.0..=100.0).contains(&pct) {
                return invalid("resources: thresholds must be between 0 and 100");
            }
        }

        if self.processor.command.trim().is_empty() {
            return invalid("processor: command must not be empty");
        }

        Ok(())
    }
}

fn invalid(message: &str) -> Result<()> {
    Err(HypnosError::Config(message.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = HypnosConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_cadences() {
        let s = SchedulerConfig::default();
        assert_eq!(s.interval_for(RhythmType::Continuous), Some(Duration::from_secs(300)));
        assert_eq!(s.interval_for(RhythmType::ShortTerm), Some(Duration::from_secs(1200)));
        assert_eq!(s.interval_for(RhythmType::LongTerm), Some(Duration::from_secs(5400)));
        assert_eq!(s.interval_for(RhythmType::DeepSleep), None);
        assert_eq!(s.homeostasis_weekday, 0);
        assert_eq!(s.homeostasis_hour, 3);
    }

    #[test]
    fn test_validate_zero_threshold() {
        let mut config = HypnosConfig::default();
        config.breakers.default.failure_threshold = 0;

        let result = config.validate();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("failure_threshold must be at least 1"));
    }

    #[test]
    fn test_validate_inverted_magnitude_band() {
        let mut config = HypnosConfig::default();
        config.batch.min_magnitude = 10.0;
        config.batch.max_magnitude = 1.0;

        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("magnitude band"));
    }

    #[test]
    fn test_validate_homeostasis_hour() {
        let mut config = HypnosConfig::default();
        config.scheduler.homeostasis_hour = 24;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_with_overrides() {
        let toml_str = r#"
            [scheduler]
            tick_interval = 500
            short_term_interval = 600

            [breakers.default]
            failure_threshold = 3
            timeout = 30

            [breakers.overrides.llm_service]
            failure_threshold = 2
            timeout = 120

            [batch]
            max_concurrency = 4
        "#;

        let config = HypnosConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.scheduler.tick_interval, Duration::from_millis(500));
        assert_eq!(config.scheduler.short_term_interval, Duration::from_secs(600));
        assert_eq!(
            config.scheduler.long_term_interval,
            Duration::from_secs(5400)
        );
        assert_eq!(
            config.breakers.for_dependency(Dependency::LlmService).failure_threshold,
            2
        );
        assert_eq!(
            config.breakers.for_dependency(Dependency::StorageEngine).failure_threshold,
            3
        );
        assert_eq!(config.batch.max_concurrency, 4);
    }

    #[test]
    fn test_unknown_dependency_override_rejected() {
        let toml_str = r#"
            [breakers.overrides.redis]
            failure_threshold = 2
            timeout = 10
        "#;
        assert!(HypnosConfig::from_toml(toml_str).is_err());
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = HypnosConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized = HypnosConfig::from_toml(&toml_str).unwrap();

        assert_eq!(
            config.scheduler.rem_interval,
            deserialized.scheduler.rem_interval
        );
        assert_eq!(
            config.processor.selectors.get(&RhythmType::RemSleep),
            deserialized.processor.selectors.get(&RhythmType::RemSleep)
        );
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hypnos.toml");

        let mut config = HypnosConfig::default();
        config.dead_letter.max_retries = 9;
        config.to_file(&path).unwrap();

        let loaded = HypnosConfig::from_file(&path).unwrap();
        assert_eq!(loaded.dead_letter.max_retries, 9);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = HypnosConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.batch.max_concurrency, 10);
    }
}

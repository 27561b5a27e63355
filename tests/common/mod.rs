//! Common test utilities and helpers

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone};
use hypnos_core::{
    config::{DeadLetterConfig, ResourceConfig},
    resilience::{monitor::ResourceUsage, ResourceMonitor, ResourceSampler},
    Clock, DeadLetterQueue, HypnosConfig, HypnosError, LlmClient, Processor, ResilienceLayer,
    Result, RhythmScheduler, RhythmType,
};
use hypnos_core::services::llm::Generation;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Clock pinned to a settable instant
pub struct FixedClock(Mutex<DateTime<Local>>);

impl FixedClock {
    pub fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> Arc<Self> {
        Arc::new(Self(Mutex::new(local(y, m, d, h, min))))
    }

    pub fn set(&self, at: DateTime<Local>) {
        *self.0.lock().unwrap() = at;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Local> {
        *self.0.lock().unwrap()
    }
}

pub fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Local> {
    Local.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
}

/// Sampler reporting fixed utilization
pub struct FixedSampler(pub ResourceUsage);

impl ResourceSampler for FixedSampler {
    fn sample(&self) -> Result<ResourceUsage> {
        Ok(self.0)
    }
}

pub fn quiet_usage() -> ResourceUsage {
    ResourceUsage {
        memory_pct: Some(20.0),
        disk_pct: Some(20.0),
        cpu_pct: Some(5.0),
    }
}

/// Processor that records calls and fails while `failing` is set
#[derive(Default)]
pub struct ScriptedProcessor {
    pub calls: Mutex<Vec<RhythmType>>,
    pub failing: AtomicBool,
}

impl ScriptedProcessor {
    pub fn failing() -> Arc<Self> {
        let processor = Self::default();
        processor.failing.store(true, Ordering::SeqCst);
        Arc::new(processor)
    }

    pub fn calls(&self) -> Vec<RhythmType> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Processor for ScriptedProcessor {
    async fn run(&self, rhythm: RhythmType) -> Result<bool> {
        self.calls.lock().unwrap().push(rhythm);
        if self.failing.load(Ordering::SeqCst) {
            Err(HypnosError::Processor("storage engine refused connection".into()))
        } else {
            Ok(true)
        }
    }
}

/// Embedder producing a deterministic unit-ish vector per text, after
/// refusing the first `refusals` embed calls
pub struct FakeEmbedder {
    pub dimension: usize,
    pub calls: AtomicUsize,
    pub refusals: AtomicUsize,
}

impl FakeEmbedder {
    pub fn new(dimension: usize) -> Arc<Self> {
        Self::refusing(dimension, 0)
    }

    pub fn refusing(dimension: usize, refusals: usize) -> Arc<Self> {
        Arc::new(Self {
            dimension,
            calls: AtomicUsize::new(0),
            refusals: AtomicUsize::new(refusals),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for FakeEmbedder {
    async fn generate(&self, prompt: &str, _model: &str, _timeout: Duration) -> Result<Generation> {
        Ok(Generation {
            content: prompt.to_uppercase(),
            tokens_used: 1,
            ..Default::default()
        })
    }

    async fn embed(&self, text: &str, _model: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(HypnosError::connection("llm_service", "connection refused"));
        }
        let seed = text.len() as f32;
        Ok((0..self.dimension).map(|i| 0.1 + (seed + i as f32) * 0.01).collect())
    }
}

/// Config with fast retries and a dead-letter store inside `dir`
pub fn test_config(dir: &TempDir) -> HypnosConfig {
    let mut config = HypnosConfig::default();
    config.retry.max_retries = 0;
    config.retry.base_delay = Duration::from_millis(1);
    config.dead_letter = DeadLetterConfig {
        path: Some(dir.path().join("dead_letters.db")),
        retry_delay: Duration::ZERO,
        ..DeadLetterConfig::default()
    };
    config.scheduler.state_path = Some(dir.path().join("scheduler_state.json"));
    config.batch.embedding_dimension = 8;
    config
}

/// Resilience layer over a fresh temporary dead-letter store
pub async fn create_test_layer(config: &HypnosConfig) -> Arc<ResilienceLayer> {
    let queue = DeadLetterQueue::open(&config.dead_letter)
        .await
        .expect("Failed to open test dead-letter queue");
    let monitor = ResourceMonitor::with_sampler(
        ResourceConfig::default(),
        Box::new(FixedSampler(quiet_usage())),
    );
    Arc::new(ResilienceLayer::new(config, Some(Arc::new(queue)), monitor))
}

pub fn create_test_scheduler(
    config: &HypnosConfig,
    resilience: Arc<ResilienceLayer>,
    processor: Arc<dyn Processor>,
    clock: Arc<dyn Clock>,
) -> RhythmScheduler {
    RhythmScheduler::new(config.scheduler.clone(), resilience, processor, clock)
}

//! Hypnos - Circadian Orchestration for Memory Pipelines
//!
//! Drives a data pipeline on biologically-inspired cadences (minutes to
//! weeks) and keeps it running while downstream dependencies are slow, flaky
//! or down:
//! - Circadian-phase-aware rhythm scheduling
//! - Circuit breakers, bounded retry and a durable dead-letter queue
//! - Fixed dependency/capability degradation matrix
//! - Resource monitoring and payload sanitization
//! - Cached, bounded-concurrency batch embedding
//!
//! # Architecture
//!
//! - **Rhythm**: phase detection, eligibility rules, the tick loop
//! - **Resilience**: failure primitives and their composition
//! - **Batch**: embedding cache, validation and concurrency control
//! - **Services**: LLM/embedding client seam
//!
//! # Example
//!
//! ```ignore
//! use hypnos_core::{HypnosConfig, ResilienceLayer, RhythmScheduler, SystemClock};
//! use hypnos_core::rhythm::CommandProcessor;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = HypnosConfig::from_file("hypnos.toml".as_ref())?;
//!     let resilience = Arc::new(ResilienceLayer::from_config(&config).await?);
//!     let scheduler = RhythmScheduler::new(
//!         config.scheduler.clone(),
//!         resilience,
//!         Arc::new(CommandProcessor::new(config.processor.clone())),
//!         Arc::new(SystemClock),
//!     );
//!
//!     // One pass, e.g. from a systemd timer
//!     let report = scheduler.tick().await;
//!     println!("{:?}", report.executed);
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod config;
pub mod error;
pub mod health;
pub mod resilience;
pub mod rhythm;
pub mod services;

// Re-export commonly used types
pub use batch::{BatchProcessor, EmbeddingCache, EmbeddingRequest, EmbeddingResult};
pub use config::HypnosConfig;
pub use error::{ErrorKind, HypnosError, Result};
pub use resilience::{
    degradation_policy, Capability, CapabilitySet, CircuitBreaker, DeadLetterQueue, Dependency,
    ResilienceLayer,
};
pub use rhythm::{
    phase, CircadianPhase, Clock, Processor, RhythmScheduler, RhythmType, SystemClock,
};
pub use services::{GuardedLlmClient, LlmClient};

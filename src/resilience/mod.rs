// Resilience Module - failure handling shared by the scheduler and batch work
//
// Components:
// - circuit_breaker: per-dependency call gate
// - retry: bounded exponential backoff
// - dead_letter: durable parking for operations that exhausted retries
// - degradation: fixed dependency -> capability matrix
// - monitor: resource sampling for pre-emptive degradation
// - sanitizer: redaction and log-injection escaping
//
// ResilienceLayer composes them and applies the propagation policy: transient
// errors retry locally then dead-letter, structural errors are counted and
// surfaced without retry, security errors force the affected circuit open.

pub mod circuit_breaker;
pub mod dead_letter;
pub mod degradation;
pub mod monitor;
pub mod retry;
pub mod sanitizer;

pub use circuit_breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
pub use dead_letter::{DeadLetterCounts, DeadLetterEntry, DeadLetterQueue, DeadLetterStatus};
pub use degradation::{degradation_policy, Capability, CapabilitySet, Dependency};
pub use monitor::{ResourceMonitor, ResourcePressure, ResourceSampler, ResourceSnapshot};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use sanitizer::SecuritySanitizer;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::config::HypnosConfig;
use crate::error::{ErrorKind, HypnosError, Result};

/// What a dead-letter replay handler did with one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Operation now succeeded (or was superseded)
    Succeeded,
    /// Attempted and failed again
    Failed,
    /// Not attempted this round; entry left untouched
    Deferred,
}

/// Tally of one replay pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub dead: usize,
    pub deferred: usize,
}

/// Observability view over breakers, backlog and error counts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub breakers: Vec<BreakerSnapshot>,
    pub capabilities: CapabilitySet,
    pub error_counts: BTreeMap<ErrorKind, u64>,
    pub dead_letters: Option<DeadLetterCounts>,
    pub resources: Option<ResourceSnapshot>,
}

struct Breakers {
    storage: Arc<CircuitBreaker>,
    llm: Arc<CircuitBreaker>,
    source: Arc<CircuitBreaker>,
}

/// Composition of breakers, retry, dead-letter queue, degradation,
/// resource monitoring and sanitization
pub struct ResilienceLayer {
    breakers: Breakers,
    retry: RetryPolicy,
    dead_letters: Option<Arc<DeadLetterQueue>>,
    monitor: ResourceMonitor,
    sanitizer: SecuritySanitizer,
    error_counts: Mutex<BTreeMap<ErrorKind, u64>>,
}

impl ResilienceLayer {
    pub fn new(
        config: &HypnosConfig,
        dead_letters: Option<Arc<DeadLetterQueue>>,
        monitor: ResourceMonitor,
    ) -> Self {
        let breaker = |dep: Dependency| {
            Arc::new(CircuitBreaker::from_config(
                dep.name(),
                &config.breakers.for_dependency(dep),
            ))
        };

        Self {
            breakers: Breakers {
                storage: breaker(Dependency::StorageEngine),
                llm: breaker(Dependency::LlmService),
                source: breaker(Dependency::SourceDatabase),
            },
            retry: RetryPolicy::from(&config.retry),
            dead_letters,
            monitor,
            sanitizer: SecuritySanitizer::new(),
            error_counts: Mutex::new(BTreeMap::new()),
        }
    }

    /// Build from configuration, opening the dead-letter store when enabled
    pub async fn from_config(config: &HypnosConfig) -> Result<Self> {
        let dead_letters = if config.dead_letter.enabled {
            Some(Arc::new(DeadLetterQueue::open(&config.dead_letter).await?))
        } else {
            None
        };
        let monitor = ResourceMonitor::new(config.resources.clone());
        Ok(Self::new(config, dead_letters, monitor))
    }

    pub fn breaker(&self, dependency: Dependency) -> &Arc<CircuitBreaker> {
        match dependency {
            Dependency::StorageEngine => &self.breakers.storage,
            Dependency::LlmService => &self.breakers.llm,
            Dependency::SourceDatabase => &self.breakers.source,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn dead_letters(&self) -> Option<&Arc<DeadLetterQueue>> {
        self.dead_letters.as_ref()
    }

    pub fn sanitizer(&self) -> &SecuritySanitizer {
        &self.sanitizer
    }

    pub fn monitor(&self) -> &ResourceMonitor {
        &self.monitor
    }

    /// Run `op` through the dependency's breaker with local retries, each
    /// attempt bounded by `timeout`
    pub async fn guard<T, F, Fut>(
        &self,
        dependency: Dependency,
        timeout: Option<Duration>,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker: &CircuitBreaker = self.breaker(dependency);
        let result = retry_with_backoff(&self.retry, HypnosError::is_transient, move || {
            let attempt = op();
            breaker.call(move || bounded(timeout, attempt))
        })
        .await;

        if let Err(e) = &result {
            self.record_error(dependency, e);
        }
        result
    }

    /// [`guard`](Self::guard), dead-lettering the operation if it still fails
    /// with a transient error
    pub async fn call_or_defer<T, F, Fut>(
        &self,
        dependency: Dependency,
        operation: &str,
        payload: &serde_json::Value,
        timeout: Option<Duration>,
        op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.guard(dependency, timeout, op).await {
            Ok(value) => Ok(value),
            Err(e) => {
                if let Err(dlq_err) = self.defer(operation, payload, &e).await {
                    error!(
                        operation,
                        error = %self.sanitizer.sanitize_text(&dlq_err.to_string()),
                        "Failed to dead-letter operation"
                    );
                }
                Err(e)
            }
        }
    }

    /// Park a transiently failed operation; returns the message id, or `None`
    /// when the error is structural or no queue is configured
    pub async fn defer(
        &self,
        operation: &str,
        payload: &serde_json::Value,
        error: &HypnosError,
    ) -> Result<Option<String>> {
        if !error.is_transient() {
            return Ok(None);
        }
        let Some(queue) = &self.dead_letters else {
            debug!(operation, "No dead-letter queue configured, dropping deferral");
            return Ok(None);
        };

        let id = queue.enqueue(operation, payload, error).await?;
        warn!(operation, message_id = %id, "Operation deferred to dead-letter queue");
        Ok(Some(id))
    }

    /// Count the error, contain security failures, and log it sanitized
    pub fn record_error(&self, dependency: Dependency, error: &HypnosError) {
        if error.is_circuit_open() {
            debug!(dependency = %dependency, "Call short-circuited");
            return;
        }

        let kind = error.kind();
        {
            let mut counts = self.error_counts.lock().unwrap_or_else(|e| e.into_inner());
            *counts.entry(kind).or_insert(0) += 1;
        }

        if kind == ErrorKind::Security {
            self.breaker(dependency).force_open();
        }

        warn!(
            dependency = %dependency,
            kind = %kind,
            error = %self.sanitizer.sanitize_text(&error.to_string()),
            "Guarded call failed"
        );
    }

    /// Count a structural error that never reached a dependency
    pub fn record_item_error(&self, error: &HypnosError) {
        let mut counts = self.error_counts.lock().unwrap_or_else(|e| e.into_inner());
        *counts.entry(error.kind()).or_insert(0) += 1;
    }

    pub fn error_counts(&self) -> BTreeMap<ErrorKind, u64> {
        self.error_counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Dependencies whose breakers are currently short-circuiting
    pub fn failed_dependencies(&self) -> Vec<Dependency> {
        Dependency::ALL
            .into_iter()
            .filter(|dep| self.breaker(*dep).is_open())
            .collect()
    }

    /// Capabilities given open breakers and the supplied resource sample
    pub fn capabilities_with(&self, resources: Option<&ResourceSnapshot>) -> CapabilitySet {
        let mut failed = self.failed_dependencies();
        if let Some(snapshot) = resources {
            failed.extend(snapshot.pressured_dependencies());
        }
        CapabilitySet::degraded_by(failed)
    }

    /// Capabilities given open breakers and a fresh resource sample
    pub fn capabilities(&self) -> CapabilitySet {
        let snapshot = self.monitor.snapshot();
        self.capabilities_with(snapshot.as_ref())
    }

    /// Re-attempt due dead letters, oldest first
    pub async fn replay_dead_letters<F, Fut>(
        &self,
        operation_prefix: Option<&str>,
        limit: u32,
        mut handler: F,
    ) -> Result<ReplayReport>
    where
        F: FnMut(DeadLetterEntry) -> Fut,
        Fut: Future<Output = ReplayOutcome>,
    {
        let mut report = ReplayReport::default();
        let Some(queue) = &self.dead_letters else {
            return Ok(report);
        };

        let candidates = queue
            .get_retry_candidates_at(chrono::Utc::now(), operation_prefix, limit)
            .await?;

        for entry in candidates {
            let id = entry.message_id.clone();
            match handler(entry).await {
                ReplayOutcome::Succeeded => {
                    report.attempted += 1;
                    queue.mark_retry_success(&id).await?;
                    report.succeeded += 1;
                }
                ReplayOutcome::Failed => {
                    report.attempted += 1;
                    report.failed += 1;
                    if queue.mark_retry_failure(&id).await? == DeadLetterStatus::Dead {
                        report.dead += 1;
                    }
                }
                ReplayOutcome::Deferred => report.deferred += 1,
            }
        }

        if report.attempted > 0 {
            debug!(?report, "Dead-letter replay pass finished");
        }
        Ok(report)
    }

    /// Breaker states, capabilities, error counts, backlog and resources
    pub async fn get_error_summary(&self) -> ErrorSummary {
        let resources = self.monitor.snapshot();
        let dead_letters = match &self.dead_letters {
            Some(queue) => match queue.counts().await {
                Ok(counts) => Some(counts),
                Err(e) => {
                    warn!(error = %e, "Could not read dead-letter counts");
                    None
                }
            },
            None => None,
        };

        ErrorSummary {
            breakers: Dependency::ALL
                .into_iter()
                .map(|dep| self.breaker(dep).snapshot())
                .collect(),
            capabilities: self.capabilities_with(resources.as_ref()),
            error_counts: self.error_counts(),
            dead_letters,
            resources,
        }
    }
}

async fn bounded<T, Fut>(timeout: Option<Duration>, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| HypnosError::Timeout(limit))?,
        None => fut.await,
    }
}

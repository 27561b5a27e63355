//! Bounded-concurrency batch embedding
//!
//! Pipeline per batch:
//! 1. One cache round trip for every valid request
//! 2. Misses embedded concurrently, at most `max_concurrency` in flight,
//!    each behind the LLM service breaker and its own timeout, retried
//!    with backoff on transient failures
//! 3. Vectors validated for dimension, finiteness and magnitude
//! 4. One cache round trip writing back the good vectors
//!
//! A failing item yields an error result for that item only; results always
//! line up 1:1 with the requests. Items that still fail transiently after
//! their retries are parked in the dead-letter queue as `embed.request`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::cache::{cache_key, EmbeddingCache};
use super::truncate::smart_truncate;
use super::validation::{validate_vector, VectorBounds};
use crate::config::BatchConfig;
use crate::error::{ErrorKind, HypnosError, Result};
use crate::resilience::{retry_with_backoff, CircuitBreaker, Dependency, ResilienceLayer, RetryPolicy};
use crate::services::llm::LlmClient;

/// Dead-letter operation name for embeddings that exhausted their retries
pub const EMBED_OPERATION: &str = "embed.request";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    pub id: String,
    pub text: String,

    /// Overrides the configured model
    pub model: Option<String>,

    /// Higher values are dispatched first
    #[serde(default)]
    pub priority: i32,
}

impl EmbeddingRequest {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            model: None,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResult {
    pub id: String,
    pub vector: Option<Vec<f32>>,

    #[serde(with = "crate::config::serde_duration_millis")]
    pub latency: Duration,

    pub cache_hit: bool,
    pub error: Option<String>,
}

impl EmbeddingResult {
    fn failed(id: &str, error: String, latency: Duration) -> Self {
        Self {
            id: id.to_string(),
            vector: None,
            latency,
            cache_hit: false,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.vector.is_some() && self.error.is_none()
    }
}

/// Request after input checks, ready for cache lookup
struct Prepared {
    index: usize,
    text: String,
    model: String,
    key: String,
    priority: i32,
}

pub struct BatchProcessor {
    config: BatchConfig,
    client: Arc<dyn LlmClient>,
    cache: Arc<EmbeddingCache>,
    resilience: Arc<ResilienceLayer>,
    limiter: Arc<Semaphore>,
}

impl BatchProcessor {
    pub fn new(
        config: BatchConfig,
        client: Arc<dyn LlmClient>,
        cache: Arc<EmbeddingCache>,
        resilience: Arc<ResilienceLayer>,
    ) -> Self {
        let limiter = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            config,
            client,
            cache,
            resilience,
            limiter,
        }
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    /// Embed every request; never fails as a whole
    pub async fn generate_batch(&self, requests: Vec<EmbeddingRequest>) -> Vec<EmbeddingResult> {
        let started = Instant::now();
        let mut results: Vec<Option<EmbeddingResult>> = vec![None; requests.len()];
        let mut prepared = Vec::with_capacity(requests.len());

        for (index, request) in requests.iter().enumerate() {
            if request.text.trim().is_empty() {
                let err = HypnosError::Validation("empty text".to_string());
                self.resilience.record_item_error(&err);
                results[index] = Some(EmbeddingResult::failed(
                    &request.id,
                    err.to_string(),
                    Duration::ZERO,
                ));
                continue;
            }
            let model = request
                .model
                .clone()
                .unwrap_or_else(|| self.config.model.clone());
            let text = smart_truncate(&request.text, self.config.max_text_chars);
            let key = cache_key(&model, &text);
            prepared.push(Prepared {
                index,
                text,
                model,
                key,
                priority: request.priority,
            });
        }

        // Cache lookup, one round trip
        let keys: Vec<String> = prepared.iter().map(|p| p.key.clone()).collect();
        let cached = self.cache.get_batch(&keys).await;
        let lookup_latency = started.elapsed();

        let mut misses = Vec::new();
        let mut hits = 0;
        for (item, hit) in prepared.into_iter().zip(cached) {
            match hit {
                Some(vector) => {
                    hits += 1;
                    results[item.index] = Some(EmbeddingResult {
                        id: requests[item.index].id.clone(),
                        vector: Some(vector),
                        latency: lookup_latency,
                        cache_hit: true,
                        error: None,
                    });
                }
                None => misses.push(item),
            }
        }

        // Highest priority acquires permits first
        misses.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut tasks = JoinSet::new();
        let breaker = Arc::clone(self.resilience.breaker(Dependency::LlmService));
        let bounds = VectorBounds::from(&self.config);
        let policy = *self.resilience.retry_policy();
        for item in misses {
            let permit = match Arc::clone(&self.limiter).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let client = Arc::clone(&self.client);
            let breaker = Arc::clone(&breaker);
            let timeout = self.config.call_timeout;

            tasks.spawn(async move {
                let _permit = permit;
                let call_started = Instant::now();
                let outcome = embed_one(&client, &breaker, &policy, &item, timeout, &bounds).await;
                (item.index, item.key, item.model, outcome, call_started.elapsed())
            });
        }

        let mut fresh = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let Ok((index, key, model, outcome, latency)) = joined else {
                continue;
            };
            let id = &requests[index].id;
            match outcome {
                Ok(vector) => {
                    fresh.push((key, vector.clone()));
                    results[index] = Some(EmbeddingResult {
                        id: id.clone(),
                        vector: Some(vector),
                        latency,
                        cache_hit: false,
                        error: None,
                    });
                }
                Err(e) => {
                    match e.kind() {
                        ErrorKind::Validation | ErrorKind::DataCorruption => {
                            self.resilience.record_item_error(&e)
                        }
                        _ => self.resilience.record_error(Dependency::LlmService, &e),
                    }
                    let message = self.resilience.sanitizer().sanitize_text(&e.to_string());
                    debug!(id = %id, error = %message, "Embedding failed");
                    let payload = serde_json::json!({ "id": id, "model": model });
                    if let Err(defer_err) =
                        self.resilience.defer(EMBED_OPERATION, &payload, &e).await
                    {
                        warn!(
                            id = %id,
                            error = %self.resilience.sanitizer().sanitize_text(&defer_err.to_string()),
                            "Could not defer failed embedding"
                        );
                    }
                    results[index] = Some(EmbeddingResult::failed(id, message, latency));
                }
            }
        }

        // Write back, one round trip
        self.cache.set_batch(&fresh).await;

        let results: Vec<EmbeddingResult> = results
            .into_iter()
            .enumerate()
            .map(|(index, result)| {
                result.unwrap_or_else(|| {
                    EmbeddingResult::failed(
                        &requests[index].id,
                        "embedding task aborted".to_string(),
                        started.elapsed(),
                    )
                })
            })
            .collect();

        let failed = results.iter().filter(|r| !r.is_ok()).count();
        info!(
            requested = results.len(),
            cache_hits = hits,
            computed = fresh.len(),
            failed,
            duration_ms = started.elapsed().as_millis() as u64,
            "Embedding batch finished"
        );
        results
    }
}

async fn embed_one(
    client: &Arc<dyn LlmClient>,
    breaker: &CircuitBreaker,
    policy: &RetryPolicy,
    item: &Prepared,
    timeout: Duration,
    bounds: &VectorBounds,
) -> Result<Vec<f32>> {
    let vector = retry_with_backoff(policy, HypnosError::is_transient, move || {
        breaker.call(move || async move {
            tokio::time::timeout(timeout, client.embed(&item.text, &item.model))
                .await
                .map_err(|_| HypnosError::Timeout(timeout))?
        })
    })
    .await?;
    validate_vector(&vector, bounds)?;
    Ok(vector)
}

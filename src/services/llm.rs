//! LLM / embedding client seam
//!
//! The wire protocol lives outside this crate. Callers implement
//! [`LlmClient`] for their backend and wrap it in [`GuardedLlmClient`] so every
//! call goes through the LLM service's circuit breaker.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{HypnosError, Result};
use crate::resilience::{CircuitBreaker, SecuritySanitizer};

/// Outcome of a text generation request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub content: String,
    pub tokens_used: u32,
    pub latency_ms: u64,
    pub error: Option<String>,
}

/// Client for an LLM / embedding backend
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate text for a prompt
    async fn generate(&self, prompt: &str, model: &str, timeout: Duration) -> Result<Generation>;

    /// Embed one text; the vector length is the model's fixed dimension
    async fn embed(&self, text: &str, model: &str) -> Result<Vec<f32>>;
}

/// [`LlmClient`] whose calls all pass through one circuit breaker
pub struct GuardedLlmClient {
    inner: Arc<dyn LlmClient>,
    breaker: Arc<CircuitBreaker>,
    sanitizer: SecuritySanitizer,
}

impl GuardedLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            inner,
            breaker,
            sanitizer: SecuritySanitizer::new(),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

#[async_trait]
impl LlmClient for GuardedLlmClient {
    /// Never fails: errors are reported in [`Generation::error`]
    async fn generate(&self, prompt: &str, model: &str, timeout: Duration) -> Result<Generation> {
        let started = Instant::now();
        let result = self
            .breaker
            .call(|| async {
                tokio::time::timeout(timeout, self.inner.generate(prompt, model, timeout))
                    .await
                    .map_err(|_| HypnosError::Timeout(timeout))?
            })
            .await;

        match result {
            Ok(generation) => {
                debug!(
                    model,
                    tokens = generation.tokens_used,
                    latency_ms = generation.latency_ms,
                    "Generation complete"
                );
                Ok(generation)
            }
            Err(e) => {
                let message = self.sanitizer.sanitize_text(&e.to_string());
                warn!(model, error = %message, "Generation failed");
                Ok(Generation {
                    content: String::new(),
                    tokens_used: 0,
                    latency_ms: started.elapsed().as_millis() as u64,
                    error: Some(message),
                })
            }
        }
    }

    async fn embed(&self, text: &str, model: &str) -> Result<Vec<f32>> {
        self.breaker.call(|| self.inner.embed(text, model)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct DownClient {
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmClient for DownClient {
        async fn generate(&self, _prompt: &str, _model: &str, _timeout: Duration) -> Result<Generation> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(HypnosError::connection("ollama", "connection refused"))
        }

        async fn embed(&self, _text: &str, _model: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(HypnosError::connection("ollama", "connection refused"))
        }
    }

    #[tokio::test]
    async fn test_generate_reports_error_instead_of_failing() {
        let inner = Arc::new(DownClient {
            calls: AtomicU32::new(0),
        });
        let breaker = Arc::new(CircuitBreaker::new("ollama", 5, Duration::from_secs(60)));
        let client = GuardedLlmClient::new(inner, breaker);

        let generation = client
            .generate("summarize", "llama3", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(generation.content.is_empty());
        assert!(generation.error.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_embed_short_circuits_when_open() {
        let inner = Arc::new(DownClient {
            calls: AtomicU32::new(0),
        });
        let breaker = Arc::new(CircuitBreaker::new("ollama", 1, Duration::from_secs(60)));
        let client = GuardedLlmClient::new(inner.clone(), breaker);

        assert!(client.embed("a", "m").await.is_err());
        let err = client.embed("b", "m").await.unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }
}

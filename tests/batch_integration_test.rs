//! Batch embedding through cache, limiter and breaker

mod common;

use common::{create_test_layer, test_config, FakeEmbedder};
use hypnos_core::batch::{smart_truncate, EMBED_OPERATION};
use hypnos_core::{
    BatchProcessor, Dependency, EmbeddingCache, EmbeddingRequest, GuardedLlmClient, HypnosConfig,
    LlmClient, ResilienceLayer,
};
use std::sync::Arc;
use std::time::Duration;

fn processor(
    config: &HypnosConfig,
    embedder: Arc<FakeEmbedder>,
    resilience: Arc<ResilienceLayer>,
) -> BatchProcessor {
    let cache = Arc::new(EmbeddingCache::in_memory(
        &config.cache,
        config.batch.embedding_dimension,
    ));
    BatchProcessor::new(config.batch.clone(), embedder, cache, resilience)
}

#[tokio::test]
async fn test_empty_text_fails_alone() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let resilience = create_test_layer(&config).await;
    let embedder = FakeEmbedder::new(config.batch.embedding_dimension);
    let batch = processor(&config, embedder.clone(), resilience);

    let results = batch
        .generate_batch(vec![
            EmbeddingRequest::new("a", "first note"),
            EmbeddingRequest::new("b", "   "),
            EmbeddingRequest::new("c", "third note, a bit longer"),
        ])
        .await;

    let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert!(results[0].is_ok());
    assert!(results[2].is_ok());
    assert!(results[1].vector.is_none());
    assert!(results[1].error.as_deref().unwrap().contains("empty text"));
    assert_eq!(embedder.calls(), 2);
}

#[tokio::test]
async fn test_second_batch_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let resilience = create_test_layer(&config).await;
    let embedder = FakeEmbedder::new(config.batch.embedding_dimension);
    let batch = processor(&config, embedder.clone(), resilience);

    let requests = || {
        vec![
            EmbeddingRequest::new("x", "sleep consolidates memory"),
            EmbeddingRequest::new("y", "rem replays the day").with_priority(5),
        ]
    };

    let first = batch.generate_batch(requests()).await;
    assert!(first.iter().all(|r| r.is_ok() && !r.cache_hit));

    let second = batch.generate_batch(requests()).await;
    assert!(second.iter().all(|r| r.is_ok() && r.cache_hit));
    assert_eq!(second[0].vector, first[0].vector);
    assert_eq!(embedder.calls(), 2);
}

#[tokio::test]
async fn test_truncated_text_shares_cache_entry() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.batch.max_text_chars = 20;
    let resilience = create_test_layer(&config).await;
    let embedder = FakeEmbedder::new(config.batch.embedding_dimension);
    let batch = processor(&config, embedder.clone(), resilience);

    let long = "a".repeat(30);
    let truncated = smart_truncate(&long, 20);
    assert_eq!(truncated.chars().count(), 20);

    batch
        .generate_batch(vec![EmbeddingRequest::new("long", long)])
        .await;
    let results = batch
        .generate_batch(vec![EmbeddingRequest::new("short", truncated)])
        .await;

    assert!(results[0].cache_hit);
    assert_eq!(embedder.calls(), 1);
}

#[tokio::test]
async fn test_open_llm_breaker_fails_misses_but_serves_hits() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let resilience = create_test_layer(&config).await;
    let embedder = FakeEmbedder::new(config.batch.embedding_dimension);
    let batch = processor(&config, embedder.clone(), Arc::clone(&resilience));

    batch
        .generate_batch(vec![EmbeddingRequest::new("warm", "already cached")])
        .await;
    resilience.breaker(Dependency::LlmService).force_open();

    let results = batch
        .generate_batch(vec![
            EmbeddingRequest::new("warm", "already cached"),
            EmbeddingRequest::new("cold", "never seen before"),
        ])
        .await;

    assert!(results[0].is_ok() && results[0].cache_hit);
    assert!(!results[1].is_ok());
    assert_eq!(embedder.calls(), 1);
}

#[tokio::test]
async fn test_guarded_client_reports_outage_in_generation() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let resilience = create_test_layer(&config).await;
    let breaker = Arc::clone(resilience.breaker(Dependency::LlmService));
    let client = GuardedLlmClient::new(FakeEmbedder::new(4), Arc::clone(&breaker));

    let ok = client
        .generate("summarize", "llama3", Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(ok.content, "SUMMARIZE");
    assert!(ok.error.is_none());

    breaker.force_open();
    let down = client
        .generate("summarize", "llama3", Duration::from_secs(1))
        .await
        .unwrap();
    assert!(down.content.is_empty());
    assert!(down.error.is_some());
}

#[tokio::test]
async fn test_transient_refusal_recovers_on_retry() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.retry.max_retries = 2;
    let resilience = create_test_layer(&config).await;
    let embedder = FakeEmbedder::refusing(config.batch.embedding_dimension, 1);
    let batch = processor(&config, embedder.clone(), Arc::clone(&resilience));

    let results = batch
        .generate_batch(vec![EmbeddingRequest::new("n1", "hippocampal replay")])
        .await;

    assert!(results[0].is_ok());
    assert_eq!(embedder.calls(), 2);
    let counts = resilience.dead_letters().unwrap().counts().await.unwrap();
    assert_eq!(counts.pending, 0);
}

#[tokio::test]
async fn test_exhausted_retries_park_request_in_dead_letters() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.retry.max_retries = 1;
    let resilience = create_test_layer(&config).await;
    let embedder = FakeEmbedder::refusing(config.batch.embedding_dimension, usize::MAX);
    let batch = processor(&config, embedder.clone(), Arc::clone(&resilience));

    let results = batch
        .generate_batch(vec![
            EmbeddingRequest::new("n2", "slow wave sleep").with_model("mxbai-embed-large"),
        ])
        .await;

    assert!(!results[0].is_ok());
    assert!(results[0].error.is_some());
    assert_eq!(embedder.calls(), 2);

    let parked = resilience
        .dead_letters()
        .unwrap()
        .get_retry_candidates()
        .await
        .unwrap();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].operation, EMBED_OPERATION);
    assert_eq!(parked[0].payload["id"], "n2");
    assert_eq!(parked[0].payload["model"], "mxbai-embed-large");
}

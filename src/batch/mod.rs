//! Batch embedding generation with caching and bounded concurrency

pub mod cache;
pub mod processor;
pub mod truncate;
pub mod validation;

pub use cache::{cache_key, CacheBackend, CacheEntry, EmbeddingCache, InMemoryCacheBackend};
pub use processor::{BatchProcessor, EmbeddingRequest, EmbeddingResult, EMBED_OPERATION};
pub use truncate::smart_truncate;
pub use validation::{validate_vector, VectorBounds};

//! Circuit breaker
//!
//! CLOSED invokes the wrapped call and counts failures. At
//! `failure_threshold` consecutive failures the breaker opens for `timeout`;
//! calls made while open are rejected with [`HypnosError::CircuitOpen`]
//! without invoking anything. Once the timeout passes a single HALF_OPEN trial
//! is let through: success closes the breaker, failure reopens it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BreakerConfig;
use crate::error::{HypnosError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of a breaker for status reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub open_until: Option<DateTime<Utc>>,
    pub total_rejections: u64,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    open_until: Option<Instant>,
    trial_in_flight: bool,
    total_rejections: u64,
}

/// Thread-safe circuit breaker for one named dependency
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            timeout,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                open_until: None,
                trial_in_flight: false,
                total_rejections: 0,
            }),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &BreakerConfig) -> Self {
        Self::new(name, config.failure_threshold, config.timeout)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` through the breaker
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let trial = self.acquire()?;
        let mut pending = TrialGuard {
            breaker: self,
            armed: trial,
        };
        let result = f().await;
        pending.armed = false;

        match result {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(e)
            }
        }
    }

    /// Admit or reject a call, moving OPEN to HALF_OPEN once the timeout
    /// passes. Returns whether the admitted call is the HALF_OPEN trial.
    fn acquire(&self) -> Result<bool> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(false),
            BreakerState::Open => {
                let expired = inner.open_until.map_or(true, |until| Instant::now() >= until);
                if expired {
                    debug!(breaker = %self.name, "Circuit half-open, admitting trial call");
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_in_flight = true;
                    Ok(true)
                } else {
                    inner.total_rejections += 1;
                    Err(HypnosError::CircuitOpen(self.name.clone()))
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    inner.total_rejections += 1;
                    Err(HypnosError::CircuitOpen(self.name.clone()))
                } else {
                    inner.trial_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    /// Trial future dropped before completing; let the next call try again
    fn abandon_trial(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen && inner.trial_in_flight {
            debug!(breaker = %self.name, "Trial call abandoned, releasing half-open slot");
            inner.trial_in_flight = false;
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        if inner.state != BreakerState::Closed {
            info!(breaker = %self.name, "Circuit closed after successful trial");
        }
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.open_until = None;
        inner.trial_in_flight = false;
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.trial_in_flight = false;

        let reopen = inner.state == BreakerState::HalfOpen
            || inner.failure_count >= self.failure_threshold;
        if reopen {
            if inner.state != BreakerState::Open {
                warn!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    timeout_secs = self.timeout.as_secs(),
                    "Circuit opened"
                );
            }
            inner.state = BreakerState::Open;
            inner.open_until = Some(Instant::now() + self.timeout);
        }
    }

    /// Open immediately regardless of the failure count
    pub fn force_open(&self) {
        let mut inner = self.lock();
        warn!(breaker = %self.name, "Circuit forced open");
        inner.state = BreakerState::Open;
        inner.failure_count = inner.failure_count.max(self.failure_threshold);
        inner.open_until = Some(Instant::now() + self.timeout);
        inner.trial_in_flight = false;
    }

    /// Operator reset back to CLOSED
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.open_until = None;
        inner.trial_in_flight = false;
    }

    /// Current state, reporting an expired OPEN as HALF_OPEN without mutating
    pub fn state(&self) -> BreakerState {
        let inner = self.lock();
        match (inner.state, inner.open_until) {
            (BreakerState::Open, Some(until)) if Instant::now() >= until => BreakerState::HalfOpen,
            (state, _) => state,
        }
    }

    /// Whether calls are currently being short-circuited
    pub fn is_open(&self) -> bool {
        self.state() == BreakerState::Open
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        let now = Instant::now();
        let open_until = inner.open_until.filter(|until| *until > now).map(|until| {
            let remaining = until.saturating_duration_since(now);
            Utc::now() + chrono::Duration::from_std(remaining).unwrap_or_default()
        });
        let state = match (inner.state, inner.open_until) {
            (BreakerState::Open, Some(until)) if now >= until => BreakerState::HalfOpen,
            (state, _) => state,
        };

        BreakerSnapshot {
            name: self.name.clone(),
            state,
            failure_count: inner.failure_count,
            open_until,
            total_rejections: inner.total_rejections,
        }
    }
}

/// Releases the HALF_OPEN trial slot if the call is cancelled mid-flight
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.abandon_trial();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn failing(calls: &AtomicUsize) -> Result<()> {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(HypnosError::connection("duckdb", "refused"))
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new("duckdb", 2, Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        assert!(breaker.call(|| failing(&calls)).await.is_err());
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.call(|| failing(&calls)).await.is_err());
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let err = breaker.call(|| failing(&calls)).await.unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes() {
        let breaker = CircuitBreaker::new("ollama", 1, Duration::from_secs(30));
        let calls = AtomicUsize::new(0);

        assert!(breaker.call(|| failing(&calls)).await.is_err());
        assert!(breaker.is_open());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        let value = breaker.call(|| async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("postgres", 3, Duration::from_secs(10));
        breaker.force_open();
        let calls = AtomicUsize::new(0);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(breaker.call(|| failing(&calls)).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.state(), BreakerState::Open);

        let snapshot = breaker.snapshot();
        assert!(snapshot.open_until.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_does_not_wedge() {
        let breaker = CircuitBreaker::new("ollama", 1, Duration::from_secs(10));
        breaker.force_open();
        tokio::time::advance(Duration::from_secs(11)).await;

        let hung = tokio::time::timeout(
            Duration::from_secs(1),
            breaker.call(|| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }),
        )
        .await;
        assert!(hung.is_err());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        let calls = AtomicUsize::new(0);
        breaker
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_success_resets_count() {
        let breaker = CircuitBreaker::new("duckdb", 3, Duration::from_secs(10));
        let calls = AtomicUsize::new(0);

        let _ = breaker.call(|| failing(&calls)).await;
        let _ = breaker.call(|| failing(&calls)).await;
        assert_eq!(breaker.failure_count(), 2);

        breaker.call(|| async { Ok(()) }).await.unwrap();
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_rejections_counted() {
        let breaker = CircuitBreaker::new("duckdb", 1, Duration::from_secs(60));
        breaker.force_open();
        let _ = breaker.call(|| async { Ok(()) }).await;
        let _ = breaker.call(|| async { Ok(()) }).await;
        assert_eq!(breaker.snapshot().total_rejections, 2);

        breaker.reset();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}

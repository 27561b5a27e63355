// Rhythm Scheduler
//
// Decides when each rhythm may run from its cadence and the circadian phase,
// executes due cycles one after another through the resilience layer, and
// replays cycles that were deferred to the dead-letter queue.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Local, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::phase::CircadianPhase;
use super::types::{Clock, CycleMetrics, RhythmType};
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::resilience::{CapabilitySet, ReplayOutcome, ReplayReport, ResilienceLayer};

/// Runs the work behind one rhythm cycle
#[async_trait]
pub trait Processor: Send + Sync {
    /// `Ok(false)` reports a completed but unsuccessful run
    async fn run(&self, rhythm: RhythmType) -> Result<bool>;
}

/// Result of one executed cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleOutcome {
    pub rhythm: RhythmType,
    pub success: bool,
}

/// What one tick did
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickReport {
    pub phase: CircadianPhase,

    /// Cycles executed this tick, in execution order
    pub executed: Vec<CycleOutcome>,

    /// Due rhythms skipped because their capability is degraded
    pub degraded: Vec<RhythmType>,

    pub replay: ReplayReport,
}

/// Per-rhythm view for health endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RhythmStatus {
    pub rhythm: RhythmType,
    pub last_run: Option<DateTime<Local>>,
    pub should_run: bool,
    pub metrics: CycleMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub phase: CircadianPhase,
    pub running: bool,
    pub rhythms: Vec<RhythmStatus>,
}

struct Worker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Circadian rhythm scheduler
pub struct RhythmScheduler {
    config: SchedulerConfig,
    resilience: Arc<ResilienceLayer>,
    processor: Arc<dyn Processor>,
    clock: Arc<dyn Clock>,
    metrics: Mutex<BTreeMap<RhythmType, CycleMetrics>>,
    in_flight: BTreeMap<RhythmType, tokio::sync::Mutex<()>>,
    running: AtomicBool,
    worker: Mutex<Option<Worker>>,
}

impl RhythmScheduler {
    pub fn new(
        config: SchedulerConfig,
        resilience: Arc<ResilienceLayer>,
        processor: Arc<dyn Processor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let metrics = RhythmType::ALL
            .into_iter()
            .map(|r| (r, CycleMetrics::default()))
            .collect();
        let in_flight = RhythmType::ALL
            .into_iter()
            .map(|r| (r, tokio::sync::Mutex::new(())))
            .collect();

        Self {
            config,
            resilience,
            processor,
            clock,
            metrics: Mutex::new(metrics),
            in_flight,
            running: AtomicBool::new(false),
            worker: Mutex::new(None),
        }
    }

    pub fn resilience(&self) -> &Arc<ResilienceLayer> {
        &self.resilience
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn lock_metrics(&self) -> MutexGuard<'_, BTreeMap<RhythmType, CycleMetrics>> {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn metrics(&self, rhythm: RhythmType) -> CycleMetrics {
        self.lock_metrics().get(&rhythm).cloned().unwrap_or_default()
    }

    pub fn last_run(&self, rhythm: RhythmType) -> Option<DateTime<Local>> {
        self.lock_metrics().get(&rhythm).and_then(|m| m.last_run)
    }

    /// Seed the last successful run, e.g. from persisted state after restart
    pub fn restore_last_run(&self, rhythm: RhythmType, at: DateTime<Local>) {
        self.lock_metrics().entry(rhythm).or_default().last_run = Some(at);
    }

    pub fn current_phase(&self) -> CircadianPhase {
        CircadianPhase::from_hour(self.clock.now().hour())
    }

    pub fn should_run(&self, rhythm: RhythmType) -> bool {
        self.should_run_at(rhythm, self.clock.now())
    }

    /// Eligibility of `rhythm` at `now`; reads timing state only
    pub fn should_run_at(&self, rhythm: RhythmType, now: DateTime<Local>) -> bool {
        if !self.phase_permits(rhythm, now) {
            return false;
        }

        let cadence_elapsed = |r: RhythmType| -> bool {
            self.config
                .interval_for(r)
                .map_or(true, |interval| elapsed_since(self.last_run(r), now, interval))
        };

        match rhythm {
            RhythmType::Continuous | RhythmType::ShortTerm | RhythmType::LongTerm => {
                cadence_elapsed(rhythm)
            }
            RhythmType::DeepSleep => self
                .last_run(rhythm)
                .map_or(true, |last| last.date_naive() != now.date_naive()),
            RhythmType::RemSleep => {
                elapsed_since(self.last_run(RhythmType::LongTerm), now, self.config.rem_interval)
                    && cadence_elapsed(rhythm)
            }
            RhythmType::Homeostasis => {
                cadence_elapsed(rhythm)
                    && now.weekday().num_days_from_sunday() == self.config.homeostasis_weekday
                    && now.hour() == self.config.homeostasis_hour
            }
        }
    }

    /// Circadian phase gate alone, without cadence
    pub fn phase_permits(&self, rhythm: RhythmType, now: DateTime<Local>) -> bool {
        let phase = CircadianPhase::from_hour(now.hour());
        match rhythm {
            RhythmType::Continuous => phase == CircadianPhase::WakeActive,
            RhythmType::DeepSleep => phase == CircadianPhase::DeepSleep,
            RhythmType::RemSleep => phase == CircadianPhase::RemDominant,
            RhythmType::ShortTerm | RhythmType::LongTerm | RhythmType::Homeostasis => true,
        }
    }

    /// Execute one cycle now, regardless of eligibility.
    ///
    /// Returns `false` on failure, or when a cycle of the same rhythm is
    /// already in flight. A transient failure is deferred to the dead-letter
    /// queue.
    pub async fn execute(&self, rhythm: RhythmType) -> bool {
        self.run_cycle(rhythm, true).await
    }

    async fn run_cycle(&self, rhythm: RhythmType, defer_on_failure: bool) -> bool {
        let Some(lock) = self.in_flight.get(&rhythm) else {
            return false;
        };
        let Ok(_guard) = lock.try_lock() else {
            debug!(rhythm = %rhythm, "Cycle already in flight, skipping");
            return false;
        };

        let started_at = self.clock.now();
        let phase = CircadianPhase::from_hour(started_at.hour());
        let started = tokio::time::Instant::now();
        info!(rhythm = %rhythm, phase = %phase, "Starting cycle");

        let result = self
            .resilience
            .guard(
                rhythm.primary_dependency(),
                Some(self.config.cycle_timeout),
                || self.processor.run(rhythm),
            )
            .await;
        let duration = started.elapsed();

        let success = match result {
            Ok(true) => {
                info!(
                    rhythm = %rhythm,
                    duration_ms = duration.as_millis() as u64,
                    "Cycle completed"
                );
                true
            }
            Ok(false) => {
                warn!(
                    rhythm = %rhythm,
                    duration_ms = duration.as_millis() as u64,
                    "Cycle reported failure"
                );
                false
            }
            Err(e) => {
                // Already logged sanitized by the resilience layer
                if defer_on_failure {
                    let payload = serde_json::json!({
                        "rhythm": rhythm.as_str(),
                        "phase": phase.as_str(),
                        "scheduled_at": started_at.to_rfc3339(),
                    });
                    if let Err(dlq_err) =
                        self.resilience.defer(&rhythm.operation(), &payload, &e).await
                    {
                        warn!(
                            rhythm = %rhythm,
                            error = %self.resilience.sanitizer().sanitize_text(&dlq_err.to_string()),
                            "Could not defer failed cycle"
                        );
                    }
                }
                false
            }
        };

        self.lock_metrics()
            .entry(rhythm)
            .or_default()
            .record(started_at, duration, success);
        success
    }

    /// One scheduling pass: replay deferred cycles, snapshot what is due,
    /// then execute due rhythms in order
    pub async fn tick(&self) -> TickReport {
        let now = self.clock.now();
        let phase = CircadianPhase::from_hour(now.hour());
        let capabilities = self.resilience.capabilities();

        let replay = if self.config.replay_deferred {
            self.replay_deferred_cycles(&capabilities).await
        } else {
            ReplayReport::default()
        };

        let due: Vec<RhythmType> = RhythmType::ALL
            .into_iter()
            .filter(|r| self.should_run_at(*r, now))
            .collect();

        let mut report = TickReport {
            phase,
            executed: Vec::new(),
            degraded: Vec::new(),
            replay,
        };

        for rhythm in due {
            if !capabilities.is_enabled(rhythm.capability()) {
                debug!(
                    rhythm = %rhythm,
                    capability = %rhythm.capability(),
                    "Capability degraded, skipping rhythm"
                );
                report.degraded.push(rhythm);
                continue;
            }
            let success = self.execute(rhythm).await;
            report.executed.push(CycleOutcome { rhythm, success });
        }

        report
    }

    /// Re-attempt cycles parked in the dead-letter queue.
    ///
    /// An entry superseded by a later successful run is settled without
    /// re-executing; otherwise the cycle reruns only when its capability is
    /// up and its phase gate is open.
    pub async fn replay_deferred_cycles(&self, capabilities: &CapabilitySet) -> ReplayReport {
        let result = self
            .resilience
            .replay_dead_letters(Some(RhythmType::OPERATION_PREFIX), 100, |entry| async move {
                let Some(rhythm) = RhythmType::from_operation(&entry.operation) else {
                    return ReplayOutcome::Deferred;
                };

                let superseded = self
                    .last_run(rhythm)
                    .is_some_and(|last| last.with_timezone(&Utc) > entry.enqueued_at);
                if superseded {
                    debug!(rhythm = %rhythm, message_id = %entry.message_id, "Deferred cycle superseded");
                    return ReplayOutcome::Succeeded;
                }

                if !capabilities.is_enabled(rhythm.capability())
                    || !self.phase_permits(rhythm, self.clock.now())
                {
                    return ReplayOutcome::Deferred;
                }

                info!(rhythm = %rhythm, attempt = entry.retry_count + 1, "Replaying deferred cycle");
                if self.run_cycle(rhythm, false).await {
                    ReplayOutcome::Succeeded
                } else {
                    ReplayOutcome::Failed
                }
            })
            .await;

        match result {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Dead-letter replay failed, continuing");
                ReplayReport::default()
            }
        }
    }

    /// Spawn the background loop; no-op when already running
    pub fn start(self: &Arc<Self>) -> bool {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.is_some() {
            debug!("Scheduler already running");
            return false;
        }

        let token = CancellationToken::new();
        let scheduler = Arc::clone(self);
        let cancel = token.clone();
        let handle = tokio::spawn(async move { scheduler.run_loop(cancel).await });

        *worker = Some(Worker { token, handle });
        self.running.store(true, Ordering::SeqCst);
        info!(
            tick_ms = self.config.tick_interval.as_millis() as u64,
            "Rhythm scheduler started"
        );
        true
    }

    async fn run_loop(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // Cancellation is only observed between ticks
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let report = self.tick().await;
            if !report.executed.is_empty() || !report.degraded.is_empty() {
                debug!(
                    phase = %report.phase,
                    executed = report.executed.len(),
                    degraded = report.degraded.len(),
                    "Tick finished"
                );
            }
        }
    }

    /// Cancel the loop and join it, bounded by the stop timeout; no-op when
    /// not running
    pub async fn stop(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(Worker { token, mut handle }) = worker else {
            return;
        };

        token.cancel();
        match tokio::time::timeout(self.config.stop_timeout, &mut handle).await {
            Ok(Ok(())) => info!("Rhythm scheduler stopped"),
            Ok(Err(e)) => warn!(error = %e, "Scheduler worker ended abnormally"),
            Err(_) => {
                warn!(
                    timeout_secs = self.config.stop_timeout.as_secs(),
                    "Scheduler worker did not stop in time, aborting"
                );
                handle.abort();
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Phase, loop state and per-rhythm timing; read-only
    pub fn get_status(&self) -> SchedulerStatus {
        let now = self.clock.now();
        let metrics = self.lock_metrics().clone();

        let rhythms = RhythmType::ALL
            .into_iter()
            .map(|rhythm| {
                let m = metrics.get(&rhythm).cloned().unwrap_or_default();
                RhythmStatus {
                    rhythm,
                    last_run: m.last_run,
                    should_run: self.should_run_at(rhythm, now),
                    metrics: m,
                }
            })
            .collect();

        SchedulerStatus {
            phase: CircadianPhase::from_hour(now.hour()),
            running: self.is_running(),
            rhythms,
        }
    }
}

/// True when `last` is unset or at least `interval` before `now`
fn elapsed_since(last: Option<DateTime<Local>>, now: DateTime<Local>, interval: Duration) -> bool {
    match last {
        None => true,
        Some(last) => (now - last)
            .to_std()
            .map(|elapsed| elapsed >= interval)
            .unwrap_or(false),
    }
}

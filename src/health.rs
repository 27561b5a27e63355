//! Health check system for hypnos
//!
//! Aggregates the scheduler status and the resilience error summary into
//! pass/warn/fail checks:
//! - Circuit breaker states
//! - Capability degradation
//! - Dead-letter backlog
//! - Resource pressure
//! - Rhythm failure rates
//! - Security incidents

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::error::ErrorKind;
use crate::resilience::{BreakerState, ErrorSummary, ResourcePressure};
use crate::rhythm::{RhythmScheduler, SchedulerStatus};

/// Pending dead letters above this count are reported as a warning
const PENDING_BACKLOG_WARN: u64 = 100;

/// Failure rate above which a rhythm is flagged, once it has enough runs
const RHYTHM_FAILURE_RATE_WARN: f64 = 0.5;
const RHYTHM_MIN_RUNS: u64 = 3;

/// Health check status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

/// Individual health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CheckResult {
    pub fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Pass, message)
    }

    pub fn warn(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Warn, message)
    }

    pub fn fail(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Fail, message)
    }

    fn new(name: impl Into<String>, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Overall health check summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSummary {
    pub status: CheckStatus,
    pub checks: Vec<CheckResult>,
    pub summary: HealthStats,
    pub scheduler: SchedulerStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStats {
    pub total_checks: usize,
    pub passed: usize,
    pub warnings: usize,
    pub errors: usize,
}

/// Run all health checks
pub async fn run_health_checks(scheduler: &RhythmScheduler) -> HealthSummary {
    info!("Running hypnos health checks");

    let status = scheduler.get_status();
    let errors = scheduler.resilience().get_error_summary().await;

    let mut checks = vec![
        check_breakers(&errors),
        check_capabilities(&errors),
        check_dead_letters(&errors),
        check_resources(&errors),
        check_security(&errors),
    ];
    checks.extend(check_rhythms(&status));

    let passed = checks
        .iter()
        .filter(|c| c.status == CheckStatus::Pass)
        .count();
    let warnings = checks
        .iter()
        .filter(|c| c.status == CheckStatus::Warn)
        .count();
    let failures = checks
        .iter()
        .filter(|c| c.status == CheckStatus::Fail)
        .count();

    let overall_status = if failures > 0 {
        CheckStatus::Fail
    } else if warnings > 0 {
        CheckStatus::Warn
    } else {
        CheckStatus::Pass
    };

    HealthSummary {
        status: overall_status,
        checks,
        summary: HealthStats {
            total_checks: passed + warnings + failures,
            passed,
            warnings,
            errors: failures,
        },
        scheduler: status,
    }
}

fn check_breakers(errors: &ErrorSummary) -> CheckResult {
    let open: Vec<&str> = errors
        .breakers
        .iter()
        .filter(|b| b.state == BreakerState::Open)
        .map(|b| b.name.as_str())
        .collect();
    let half_open: Vec<&str> = errors
        .breakers
        .iter()
        .filter(|b| b.state == BreakerState::HalfOpen)
        .map(|b| b.name.as_str())
        .collect();
    let details = json!(errors.breakers);

    if !open.is_empty() {
        CheckResult::fail("circuit_breakers", format!("Open: {}", open.join(", ")))
            .with_details(details)
    } else if !half_open.is_empty() {
        CheckResult::warn(
            "circuit_breakers",
            format!("Awaiting trial call: {}", half_open.join(", ")),
        )
        .with_details(details)
    } else {
        CheckResult::pass("circuit_breakers", "All circuits closed").with_details(details)
    }
}

fn check_capabilities(errors: &ErrorSummary) -> CheckResult {
    let disabled: Vec<String> = errors
        .capabilities
        .disabled()
        .map(|c| c.to_string())
        .collect();
    if disabled.is_empty() {
        CheckResult::pass("capabilities", "All capabilities enabled")
    } else {
        CheckResult::warn(
            "capabilities",
            format!("Degraded: {}", disabled.join(", ")),
        )
    }
}

fn check_dead_letters(errors: &ErrorSummary) -> CheckResult {
    let Some(counts) = &errors.dead_letters else {
        return CheckResult::warn("dead_letters", "Dead-letter queue unavailable or disabled");
    };
    let details = json!(counts);

    if counts.dead > 0 {
        CheckResult::fail(
            "dead_letters",
            format!("{} operations exhausted their retries", counts.dead),
        )
        .with_details(details)
    } else if counts.pending > PENDING_BACKLOG_WARN {
        CheckResult::warn(
            "dead_letters",
            format!("{} operations awaiting retry", counts.pending),
        )
        .with_details(details)
    } else {
        CheckResult::pass(
            "dead_letters",
            format!("{} pending, none dead", counts.pending),
        )
        .with_details(details)
    }
}

fn check_resources(errors: &ErrorSummary) -> CheckResult {
    let Some(snapshot) = &errors.resources else {
        debug!("No resource sample available");
        return CheckResult::warn("resources", "Resource sampling unavailable");
    };
    let details = json!(snapshot.usage);

    match snapshot.worst() {
        ResourcePressure::Critical => {
            CheckResult::fail("resources", "Resource usage critical").with_details(details)
        }
        ResourcePressure::High => {
            CheckResult::warn("resources", "Resource usage high").with_details(details)
        }
        _ => CheckResult::pass("resources", "Resource usage normal").with_details(details),
    }
}

fn check_security(errors: &ErrorSummary) -> CheckResult {
    match errors.error_counts.get(&ErrorKind::Security) {
        Some(&n) if n > 0 => CheckResult::fail(
            "security",
            format!("{} security errors contained since start", n),
        ),
        _ => CheckResult::pass("security", "No security errors"),
    }
}

fn check_rhythms(status: &SchedulerStatus) -> Vec<CheckResult> {
    status
        .rhythms
        .iter()
        .map(|r| {
            let name = format!("rhythm_{}", r.rhythm);
            let details = json!(r.metrics);
            if r.metrics.count >= RHYTHM_MIN_RUNS
                && r.metrics.failure_rate() > RHYTHM_FAILURE_RATE_WARN
            {
                CheckResult::warn(
                    name,
                    format!(
                        "{} of {} cycles failed",
                        r.metrics.failures, r.metrics.count
                    ),
                )
                .with_details(details)
            } else {
                CheckResult::pass(name, format!("{} cycles run", r.metrics.count))
                    .with_details(details)
            }
        })
        .collect()
}

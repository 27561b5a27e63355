//! Durable dead-letter queue on SQLite
//!
//! Operations that kept failing after local retries are parked here for a
//! delayed re-attempt. Every statement is parameterized. Entries move
//! PENDING -> SUCCESS on a successful replay, or PENDING -> DEAD once the
//! retry budget is exceeded; DEAD entries stay for operator review.

use chrono::{DateTime, Utc};
use deadpool_sqlite::{Config, Pool, Runtime};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::DeadLetterConfig;
use crate::error::{HypnosError, Result};
use crate::resilience::sanitizer::SecuritySanitizer;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS dead_letters (
        message_id      TEXT PRIMARY KEY,
        operation       TEXT NOT NULL,
        payload         TEXT NOT NULL,
        error_type      TEXT NOT NULL,
        error_message   TEXT NOT NULL,
        enqueued_at     INTEGER NOT NULL,
        next_retry_at   INTEGER NOT NULL,
        retry_count     INTEGER NOT NULL DEFAULT 0,
        status          TEXT NOT NULL,
        last_attempt_at INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_dead_letters_due
        ON dead_letters (status, next_retry_at, enqueued_at);
";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadLetterStatus {
    Pending,
    Success,
    Dead,
}

impl DeadLetterStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeadLetterStatus::Pending => "PENDING",
            DeadLetterStatus::Success => "SUCCESS",
            DeadLetterStatus::Dead => "DEAD",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(DeadLetterStatus::Pending),
            "SUCCESS" => Ok(DeadLetterStatus::Success),
            "DEAD" => Ok(DeadLetterStatus::Dead),
            other => Err(HypnosError::DataCorruption(format!(
                "Unknown dead-letter status: {}",
                other
            ))),
        }
    }
}

/// One parked operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub message_id: String,
    pub operation: String,
    pub payload: serde_json::Value,
    pub error_type: String,
    pub error_message: String,
    pub enqueued_at: DateTime<Utc>,
    pub next_retry_at: DateTime<Utc>,
    pub retry_count: u32,
    pub status: DeadLetterStatus,
}

impl DeadLetterEntry {
    /// Retry-eligible iff PENDING and due
    pub fn is_retry_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == DeadLetterStatus::Pending && self.next_retry_at <= now
    }
}

/// Backlog sizes by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterCounts {
    pub pending: u64,
    pub success: u64,
    pub dead: u64,
}

/// Dead-letter queue backed by a pooled SQLite file
pub struct DeadLetterQueue {
    pool: Pool,
    path: PathBuf,
    retry_delay: Duration,
    backoff_multiplier: f64,
    max_retries: u32,
    sanitizer: SecuritySanitizer,
}

impl DeadLetterQueue {
    /// Open (creating if needed) the queue described by `config`
    pub async fn open(config: &DeadLetterConfig) -> Result<Self> {
        let path = config.resolved_path();
        info!("Opening dead-letter queue at: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut pool_config = Config::new(path.clone());
        pool_config.pool = Some(deadpool_sqlite::PoolConfig::new(config.pool_size.max(1)));
        let pool = pool_config.create_pool(Runtime::Tokio1).map_err(|e| {
            HypnosError::Database(format!("Failed to create connection pool: {}", e))
        })?;

        let queue = Self {
            pool,
            path,
            retry_delay: config.retry_delay,
            backoff_multiplier: config.backoff_multiplier,
            max_retries: config.max_retries,
            sanitizer: SecuritySanitizer::new(),
        };

        queue
            .interact(|conn| {
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                    row.get::<_, String>(0)
                })?;
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;

        if config.restrict_permissions {
            restrict_permissions(&queue.path)?;
            for suffix in ["-wal", "-shm"] {
                let mut sidecar = queue.path.clone().into_os_string();
                sidecar.push(suffix);
                restrict_permissions(Path::new(&sidecar))?;
            }
        }

        debug!("Dead-letter schema ready");
        Ok(queue)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn interact<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.pool.get().await.map_err(|e| {
            HypnosError::Database(format!("Failed to get connection from pool: {}", e))
        })?;

        conn.interact(move |conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            f(conn)
        })
        .await
        .map_err(|e| HypnosError::Database(format!("Pool interaction failed: {}", e)))?
    }

    /// Park a failed operation; returns its message id
    pub async fn enqueue(
        &self,
        operation: &str,
        payload: &serde_json::Value,
        error: &HypnosError,
    ) -> Result<String> {
        self.enqueue_raw(operation, payload, error.type_name(), &error.to_string())
            .await
    }

    /// Park a failed operation with an explicit error type and message
    pub async fn enqueue_raw(
        &self,
        operation: &str,
        payload: &serde_json::Value,
        error_type: &str,
        error_message: &str,
    ) -> Result<String> {
        let message_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let next_retry_at = now + to_chrono(self.retry_delay);

        let payload = serde_json::to_string(&self.sanitizer.sanitize_value(payload))?;
        let error_message = self.sanitizer.sanitize_text(error_message);
        let operation = operation.to_string();
        let error_type = error_type.to_string();
        let id = message_id.clone();

        self.interact(move |conn| {
            conn.execute(
                "INSERT INTO dead_letters
                    (message_id, operation, payload, error_type, error_message,
                     enqueued_at, next_retry_at, retry_count, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)",
                params![
                    id,
                    operation,
                    payload,
                    error_type,
                    error_message,
                    now.timestamp_millis(),
                    next_retry_at.timestamp_millis(),
                    DeadLetterStatus::Pending.as_str(),
                ],
            )?;
            Ok(())
        })
        .await?;

        debug!(message_id = %message_id, "Dead letter enqueued");
        Ok(message_id)
    }

    /// Due PENDING entries, oldest first
    pub async fn get_retry_candidates(&self) -> Result<Vec<DeadLetterEntry>> {
        self.get_retry_candidates_at(Utc::now(), None, u32::MAX).await
    }

    /// Due PENDING entries as of `now`, optionally restricted to operations
    /// starting with `operation_prefix`, oldest first
    pub async fn get_retry_candidates_at(
        &self,
        now: DateTime<Utc>,
        operation_prefix: Option<&str>,
        limit: u32,
    ) -> Result<Vec<DeadLetterEntry>> {
        let pattern = operation_prefix.map(|p| format!("{}%", escape_like(p)));
        let limit = i64::from(limit);

        self.interact(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT message_id, operation, payload, error_type, error_message,
                        enqueued_at, next_retry_at, retry_count, status
                 FROM dead_letters
                 WHERE status = ?1
                   AND next_retry_at <= ?2
                   AND (?3 IS NULL OR operation LIKE ?3 ESCAPE '\\')
                 ORDER BY enqueued_at ASC, rowid ASC
                 LIMIT ?4",
            )?;
            let rows = stmt.query_map(
                params![
                    DeadLetterStatus::Pending.as_str(),
                    now.timestamp_millis(),
                    pattern,
                    limit
                ],
                RawEntry::from_row,
            )?;

            let mut entries = Vec::new();
            for row in rows {
                entries.push(row?.into_entry()?);
            }
            Ok(entries)
        })
        .await
    }

    /// Entries that exhausted their retries, oldest first
    pub async fn get_dead_entries(&self, limit: u32) -> Result<Vec<DeadLetterEntry>> {
        let limit = i64::from(limit);
        self.interact(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT message_id, operation, payload, error_type, error_message,
                        enqueued_at, next_retry_at, retry_count, status
                 FROM dead_letters
                 WHERE status = ?1
                 ORDER BY enqueued_at ASC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(
                params![DeadLetterStatus::Dead.as_str(), limit],
                RawEntry::from_row,
            )?;

            let mut entries = Vec::new();
            for row in rows {
                entries.push(row?.into_entry()?);
            }
            Ok(entries)
        })
        .await
    }

    /// Fetch one entry by id
    pub async fn get(&self, message_id: &str) -> Result<Option<DeadLetterEntry>> {
        let id = message_id.to_string();
        self.interact(move |conn| {
            let raw = conn
                .query_row(
                    "SELECT message_id, operation, payload, error_type, error_message,
                            enqueued_at, next_retry_at, retry_count, status
                     FROM dead_letters WHERE message_id = ?1",
                    params![id],
                    RawEntry::from_row,
                )
                .optional()?;
            raw.map(RawEntry::into_entry).transpose()
        })
        .await
    }

    /// Mark a replayed entry as done
    pub async fn mark_retry_success(&self, message_id: &str) -> Result<()> {
        let id = message_id.to_string();
        let now = Utc::now().timestamp_millis();
        let updated = self
            .interact(move |conn| {
                Ok(conn.execute(
                    "UPDATE dead_letters
                     SET status = ?1, last_attempt_at = ?2
                     WHERE message_id = ?3 AND status = ?4",
                    params![
                        DeadLetterStatus::Success.as_str(),
                        now,
                        id,
                        DeadLetterStatus::Pending.as_str()
                    ],
                )?)
            })
            .await?;

        if updated == 0 {
            return Err(HypnosError::Validation(format!(
                "No pending dead letter with id {}",
                message_id
            )));
        }
        debug!(message_id = %message_id, "Dead letter replayed successfully");
        Ok(())
    }

    /// Record a failed replay: bump the count, back off, and go DEAD once the
    /// retry budget is exceeded. Returns the resulting status.
    pub async fn mark_retry_failure(&self, message_id: &str) -> Result<DeadLetterStatus> {
        let id = message_id.to_string();
        let now = Utc::now();
        let retry_delay = self.retry_delay;
        let multiplier = self.backoff_multiplier;
        let max_retries = self.max_retries;

        let status = self
            .interact(move |conn| {
                let tx = conn.transaction()?;
                let current: Option<(u32, String)> = tx
                    .query_row(
                        "SELECT retry_count, status FROM dead_letters WHERE message_id = ?1",
                        params![id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;

                let (retry_count, status) = current.ok_or_else(|| {
                    HypnosError::Validation(format!("No dead letter with id {}", id))
                })?;
                if DeadLetterStatus::parse(&status)? != DeadLetterStatus::Pending {
                    return Err(HypnosError::Validation(format!(
                        "Dead letter {} is not pending",
                        id
                    )));
                }

                let retry_count = retry_count + 1;
                let new_status = if retry_count > max_retries {
                    DeadLetterStatus::Dead
                } else {
                    DeadLetterStatus::Pending
                };
                // First failure waits retry_delay, each later one multiplies it
                let delay = backoff(retry_delay, multiplier, retry_count - 1);
                let next_retry_at = now + to_chrono(delay);

                tx.execute(
                    "UPDATE dead_letters
                     SET retry_count = ?1, next_retry_at = ?2, status = ?3, last_attempt_at = ?4
                     WHERE message_id = ?5",
                    params![
                        retry_count,
                        next_retry_at.timestamp_millis(),
                        new_status.as_str(),
                        now.timestamp_millis(),
                        id
                    ],
                )?;
                tx.commit()?;
                Ok(new_status)
            })
            .await?;

        if status == DeadLetterStatus::Dead {
            warn!(message_id = %message_id, "Dead letter exhausted its retries");
        }
        Ok(status)
    }

    /// Backlog sizes by status
    pub async fn counts(&self) -> Result<DeadLetterCounts> {
        self.interact(|conn| {
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM dead_letters GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;

            let mut counts = DeadLetterCounts::default();
            for row in rows {
                let (status, n) = row?;
                let n = n.max(0) as u64;
                match DeadLetterStatus::parse(&status)? {
                    DeadLetterStatus::Pending => counts.pending = n,
                    DeadLetterStatus::Success => counts.success = n,
                    DeadLetterStatus::Dead => counts.dead = n,
                }
            }
            Ok(counts)
        })
        .await
    }

    /// Delete SUCCESS entries enqueued before `before`; DEAD entries are kept
    pub async fn purge_completed(&self, before: DateTime<Utc>) -> Result<usize> {
        let cutoff = before.timestamp_millis();
        let removed = self
            .interact(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM dead_letters WHERE status = ?1 AND enqueued_at < ?2",
                    params![DeadLetterStatus::Success.as_str(), cutoff],
                )?)
            })
            .await?;
        debug!(removed, "Purged completed dead letters");
        Ok(removed)
    }

    /// Purge SUCCESS entries older than `days` days before `now`
    pub async fn purge_older_than(&self, now: DateTime<Utc>, days: i64) -> Result<usize> {
        self.purge_completed(purge_cutoff(now, days)?).await
    }
}

/// `now` minus `days` days, rejecting negative or unrepresentable windows
pub fn purge_cutoff(now: DateTime<Utc>, days: i64) -> Result<DateTime<Utc>> {
    if days < 0 {
        return Err(HypnosError::Validation(format!(
            "purge window must not be negative, got {} days",
            days
        )));
    }
    chrono::Duration::try_days(days)
        .and_then(|window| now.checked_sub_signed(window))
        .ok_or_else(|| {
            HypnosError::Validation(format!("purge window of {} days is out of range", days))
        })
}

/// Row as stored, before timestamp and JSON decoding
struct RawEntry {
    message_id: String,
    operation: String,
    payload: String,
    error_type: String,
    error_message: String,
    enqueued_at: i64,
    next_retry_at: i64,
    retry_count: u32,
    status: String,
}

impl RawEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            message_id: row.get(0)?,
            operation: row.get(1)?,
            payload: row.get(2)?,
            error_type: row.get(3)?,
            error_message: row.get(4)?,
            enqueued_at: row.get(5)?,
            next_retry_at: row.get(6)?,
            retry_count: row.get(7)?,
            status: row.get(8)?,
        })
    }

    fn into_entry(self) -> Result<DeadLetterEntry> {
        Ok(DeadLetterEntry {
            payload: serde_json::from_str(&self.payload)
                .map_err(|e| HypnosError::DataCorruption(format!("Bad payload: {}", e)))?,
            enqueued_at: from_millis(self.enqueued_at)?,
            next_retry_at: from_millis(self.next_retry_at)?,
            status: DeadLetterStatus::parse(&self.status)?,
            message_id: self.message_id,
            operation: self.operation,
            error_type: self.error_type,
            error_message: self.error_message,
            retry_count: self.retry_count,
        })
    }
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| HypnosError::DataCorruption(format!("Bad timestamp: {}", millis)))
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// `retry_delay * multiplier^retry_count`
fn backoff(retry_delay: Duration, multiplier: f64, retry_count: u32) -> Duration {
    let secs = retry_delay.as_secs_f64() * multiplier.powi(retry_count as i32);
    if secs.is_finite() && secs < 3.0e9 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::from_secs(3_000_000_000)
    }
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if path.exists() {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

//! Error types for the Hypnos orchestration system
//!
//! This module provides structured error definitions using thiserror, plus the
//! failure taxonomy that drives retry, dead-lettering and containment.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Failure taxonomy used to decide how an error propagates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Dependency unreachable or refusing connections (transient)
    ConnectionFailure,
    /// Call exceeded its deadline (transient)
    Timeout,
    /// Data read back in an impossible state (never retried)
    DataCorruption,
    /// Input rejected before or after a call (never retried)
    Validation,
    /// Credential or injection problem (contained immediately)
    Security,
    /// Memory, disk or quota exhausted
    ResourceExhaustion,
}

impl ErrorKind {
    /// Whether this kind is retried locally and dead-lettered when retries run out
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::ConnectionFailure | ErrorKind::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ConnectionFailure => "CONNECTION_FAILURE",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::DataCorruption => "DATA_CORRUPTION",
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::Security => "SECURITY",
            ErrorKind::ResourceExhaustion => "RESOURCE_EXHAUSTION",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for Hypnos operations
#[derive(Error, Debug)]
pub enum HypnosError {
    /// Dependency could not be reached
    #[error("Connection failure ({dependency}): {message}")]
    Connection { dependency: String, message: String },

    /// Operation exceeded its deadline
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Circuit breaker rejected the call without invoking it
    #[error("Circuit open for {0}")]
    CircuitOpen(String),

    /// Stored or received data is malformed
    #[error("Data corruption: {0}")]
    DataCorruption(String),

    /// Input failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Credential leak, injection attempt or auth rejection
    #[error("Security violation: {0}")]
    Security(String),

    /// Host resources exhausted
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Dead-letter database failure
    #[error("Database error: {0}")]
    Database(String),

    /// External processor failed
    #[error("Processor error: {0}")]
    Processor(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Dependency name not present in the degradation matrix
    #[error("Unknown dependency: {0}")]
    UnknownDependency(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HypnosError {
    /// Shorthand for a connection failure against a named dependency
    pub fn connection(dependency: impl Into<String>, message: impl Into<String>) -> Self {
        HypnosError::Connection {
            dependency: dependency.into(),
            message: message.into(),
        }
    }

    /// Map this error onto the failure taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            HypnosError::Connection { .. } => ErrorKind::ConnectionFailure,
            HypnosError::CircuitOpen(_) => ErrorKind::ConnectionFailure,
            HypnosError::Database(_) => ErrorKind::ConnectionFailure,
            HypnosError::Processor(_) => ErrorKind::ConnectionFailure,
            HypnosError::Io(_) => ErrorKind::ConnectionFailure,
            HypnosError::Timeout(_) => ErrorKind::Timeout,
            HypnosError::DataCorruption(_) => ErrorKind::DataCorruption,
            HypnosError::Serialization(_) => ErrorKind::DataCorruption,
            HypnosError::Validation(_) => ErrorKind::Validation,
            HypnosError::Config(_) => ErrorKind::Validation,
            HypnosError::UnknownDependency(_) => ErrorKind::Validation,
            HypnosError::Security(_) => ErrorKind::Security,
            HypnosError::ResourceExhausted(_) => ErrorKind::ResourceExhaustion,
        }
    }

    /// Whether a local retry may succeed.
    ///
    /// A circuit-open rejection is transient by kind but is never retried in
    /// place: the breaker decides when the next attempt happens.
    pub fn is_transient(&self) -> bool {
        !self.is_circuit_open() && self.kind().is_transient()
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, HypnosError::CircuitOpen(_))
    }

    /// Short type label persisted alongside dead letters
    pub fn type_name(&self) -> &'static str {
        match self {
            HypnosError::Connection { .. } => "Connection",
            HypnosError::Timeout(_) => "Timeout",
            HypnosError::CircuitOpen(_) => "CircuitOpen",
            HypnosError::DataCorruption(_) => "DataCorruption",
            HypnosError::Validation(_) => "Validation",
            HypnosError::Security(_) => "Security",
            HypnosError::ResourceExhausted(_) => "ResourceExhausted",
            HypnosError::Database(_) => "Database",
            HypnosError::Processor(_) => "Processor",
            HypnosError::Config(_) => "Config",
            HypnosError::UnknownDependency(_) => "UnknownDependency",
            HypnosError::Io(_) => "Io",
            HypnosError::Serialization(_) => "Serialization",
        }
    }
}

/// Result type alias for Hypnos operations
pub type Result<T> = std::result::Result<T, HypnosError>;

impl From<rusqlite::Error> for HypnosError {
    fn from(err: rusqlite::Error) -> Self {
        HypnosError::Database(err.to_string())
    }
}

impl From<toml::de::Error> for HypnosError {
    fn from(err: toml::de::Error) -> Self {
        HypnosError::Config(err.to_string())
    }
}

/// Convert anyhow::Error from collaborators into a processor failure
impl From<anyhow::Error> for HypnosError {
    fn from(err: anyhow::Error) -> Self {
        HypnosError::Processor(err.to_string())
    }
}

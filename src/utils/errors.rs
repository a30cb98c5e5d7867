// src/utils/errors.rs
//! Crate-wide error type
//!
//! Import resolution has its own typed error (`modules::ImportError`) so that a
//! boundary violation can never be confused with a missing module; it converts
//! into `EngineError::Import` at subsystem edges.

use crate::modules::ImportError;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Cache store (Redis-like) transport or command failure
    #[error("Cache store error: {0}")]
    CacheStore(String),

    /// Code origin (object storage) failure
    #[error("Origin storage error: {0}")]
    Origin(String),

    /// Module resolution failure
    #[error(transparent)]
    Import(#[from] ImportError),

    /// Worker process could not be started
    #[error("Process spawn failed: {0}")]
    ProcessSpawnFailed(String),

    /// Worker process misbehaved on the wire or exited
    #[error("Worker protocol error: {0}")]
    WorkerProtocol(String),

    /// No process became available in time
    #[error("Process pool exhausted")]
    PoolExhausted,

    /// Supervisor-side deadline elapsed
    #[error("Execution timed out")]
    ExecutionTimeout,

    /// Rejected process state transition
    #[error("Invalid transition for process {process_id}: {from} -> {to}")]
    InvalidTransition {
        process_id: String,
        from: String,
        to: String,
    },

    /// Relational store failure
    #[error("Storage failed: {0}")]
    StorageFailed(String),

    /// Requested record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Cron expression or timezone could not be parsed
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// JSON encode/decode failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// zstd failure
    #[error("Compression failed: {0}")]
    CompressionFailed(String),

    /// Interpreter failure outside of user code
    #[error("Script runtime error: {0}")]
    Script(String),

    /// Generic runtime error
    #[error("Runtime error: {0}")]
    RuntimeError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::StorageFailed(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<redis::RedisError> for EngineError {
    fn from(e: redis::RedisError) -> Self {
        EngineError::CacheStore(e.to_string())
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(e: config::ConfigError) -> Self {
        EngineError::ConfigError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_error_is_transparent() {
        let err: EngineError = ImportError::NotFound {
            name: "workflows.missing".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "No module named 'workflows.missing'");
    }

    #[test]
    fn test_transition_message() {
        let err = EngineError::InvalidTransition {
            process_id: "proc_1".to_string(),
            from: "KILLED".to_string(),
            to: "IDLE".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid transition for process proc_1: KILLED -> IDLE"
        );
    }
}

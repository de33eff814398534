use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure classes that drive the resilience policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network/timeout-like. Retried, counts toward the circuit breaker.
    Transient,
    /// The executor can never succeed for this input. Not retried.
    Permanent,
    /// Bad graph or bad input. Fatal, not retried.
    Validation,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Validation => "validation",
        }
    }
}

/// Error returned by an executor.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "class", content = "message", rename_all = "snake_case")]
pub enum ExecutorError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("invalid input: {0}")]
    Validation(String),
}

impl ExecutorError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ExecutorError::Transient(_) => ErrorClass::Transient,
            ExecutorError::Permanent(_) => ErrorClass::Permanent,
            ExecutorError::Validation(_) => ErrorClass::Validation,
        }
    }

    /// Only transient failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn message(&self) -> &str {
        match self {
            ExecutorError::Transient(m) | ExecutorError::Permanent(m) | ExecutorError::Validation(m) => m,
        }
    }
}

/// Errors from persistence adapters.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

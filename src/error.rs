//! Engine Error Types
//!
//! Every fallible engine call returns [`EngineResult`]. Callers map
//! [`EngineError::kind`] onto their own response semantics; authorization
//! denials are not errors (see [`crate::authz::Decision`]).

use std::fmt;
use thiserror::Error;

/// Engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    /// Input rejected before any backend call
    #[error("Validation error: {0}")]
    Validation(String),

    /// Name already taken or state changed underneath the caller
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Unknown collection, field, view, policy, role or record
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// Another schema mutation holds the lock for this collection
    #[error("Schema lock held: {0}")]
    LockContention(String),

    /// A physical DDL statement failed
    #[error("DDL failed ({statement}): {message}")]
    Ddl { statement: String, message: String },

    /// Backend driver error
    #[error("Backend error: {0}")]
    Backend(#[from] rusqlite::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catalog holds a value the engine cannot interpret
    #[error("Catalog corrupted: {0}")]
    Corrupt(String),
}

/// Coarse error classes for the transport layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    Backend,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::Conflict => write!(f, "conflict"),
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::Backend => write!(f, "backend"),
        }
    }
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        EngineError::Conflict(msg.into())
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::Conflict(_) | EngineError::LockContention(_) => ErrorKind::Conflict,
            EngineError::NotFound { .. } => ErrorKind::NotFound,
            EngineError::Ddl { .. }
            | EngineError::Backend(_)
            | EngineError::Json(_)
            | EngineError::Corrupt(_) => ErrorKind::Backend,
        }
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

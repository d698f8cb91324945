//! Error types for the evox-store crate.
//!
//! All storage operations return [`StoreError`] via [`StoreResult`].
//! Errors raised inside a backend are translated by the gateway into
//! [`StoreError::Backend`] with a [`FailureKind`] from a small fixed
//! vocabulary, so callers never need backend-specific handling.

use std::fmt;

use evox_kernel::{ErrorBody, KernelError};
use serde::Serialize;
use thiserror::Error;

use crate::backend::Operation;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Backend-independent failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    DuplicateKey,
    ForeignKeyViolation,
    ConnectionTimeout,
    Generic,
}

impl FailureKind {
    pub fn code(self) -> &'static str {
        match self {
            Self::DuplicateKey => "DUPLICATE_KEY",
            Self::ForeignKeyViolation => "FOREIGN_KEY_VIOLATION",
            Self::ConnectionTimeout => "CONNECTION_TIMEOUT",
            Self::Generic => "DATABASE_ERROR",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::DuplicateKey => "duplicate key",
            Self::ForeignKeyViolation => "foreign key violation",
            Self::ConnectionTimeout => "connection timeout",
            Self::Generic => "database error",
        };
        f.write_str(s)
    }
}

/// Errors that can occur in the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    // -- Routing / persistence faults surfaced to callers --------------------
    /// Every backend in the strategy's preference chain is unhealthy.
    #[error("no healthy backend for {operation} on `{model}` (intent {intent})")]
    NoHealthyBackend {
        model: String,
        operation: Operation,
        intent: String,
    },

    /// A backend call failed; translated into the fixed vocabulary.
    #[error("{kind} during {operation} on `{model}` via `{backend}` (intent {intent}): {message}")]
    Backend {
        kind: FailureKind,
        model: String,
        operation: Operation,
        intent: String,
        backend: String,
        constraint: Option<String>,
        message: String,
    },

    /// Intent resolution failed (e.g. unregistered custom intent).
    #[error(transparent)]
    Intent(#[from] KernelError),

    // -- Raised by backends ---------------------------------------------------
    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A schema migration failed.
    #[error("migration v{version} failed: {message}")]
    Migration { version: u32, message: String },

    /// An error reported verbatim by a backend driver.
    #[error("backend `{backend}` reported: {message}")]
    Driver { backend: String, message: String },

    /// The backend cannot serve requests right now.
    #[error("backend `{backend}` unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    /// A call did not finish within its time budget.
    #[error("{what} timed out after {after_ms} ms")]
    Timeout { what: String, after_ms: u64 },

    /// Payload sealing or opening failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// An invalid argument was provided to a store operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoHealthyBackend { .. } => "NO_HEALTHY_BACKEND",
            Self::Backend { kind, .. } => kind.code(),
            Self::Intent(err) => err.code(),
            Self::Timeout { .. } => "CONNECTION_TIMEOUT",
            Self::Unavailable { .. } => "BACKEND_UNAVAILABLE",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::Sqlite(_)
            | Self::Json(_)
            | Self::Migration { .. }
            | Self::Driver { .. }
            | Self::Crypto(_)
            | Self::TaskJoin(_) => "DATABASE_ERROR",
        }
    }

    /// Structured body for the framework boundary.
    ///
    /// Persistence faults map to 5xx statuses; the body carries the model,
    /// operation, intent and backend that were involved.
    pub fn to_body(&self) -> ErrorBody {
        if let Self::Intent(err) = self {
            return err.to_body();
        }

        let (status_code, details) = match self {
            Self::NoHealthyBackend {
                model,
                operation,
                intent,
            } => (
                503,
                serde_json::json!({
                    "model": model,
                    "operation": operation,
                    "intent": intent,
                }),
            ),
            Self::Backend {
                kind,
                model,
                operation,
                intent,
                backend,
                constraint,
                ..
            } => (
                if *kind == FailureKind::ConnectionTimeout {
                    504
                } else {
                    500
                },
                serde_json::json!({
                    "failure": kind,
                    "model": model,
                    "operation": operation,
                    "intent": intent,
                    "backend": backend,
                    "constraint": constraint,
                }),
            ),
            Self::InvalidArgument(_) => (400, serde_json::Value::Null),
            Self::Timeout { .. } => (504, serde_json::Value::Null),
            Self::Unavailable { backend, .. } => (503, serde_json::json!({ "backend": backend })),
            _ => (500, serde_json::Value::Null),
        };

        ErrorBody {
            status_code,
            code: self.code().to_string(),
            message: self.to_string(),
            details,
        }
    }
}

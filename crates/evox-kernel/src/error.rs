//! Kernel error types.
//!
//! All kernel subsystems surface errors through [`KernelError`], which is the
//! single error type returned by every fallible public API in this crate.
//! Admission rejection is deliberately *not* represented here: shedding load
//! is a normal outcome and is returned as [`crate::admission::Admission::Rejected`].

use serde::Serialize;
use uuid::Uuid;

/// Unified error type for the EVOX kernel.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    // -- Scheduler errors ---------------------------------------------------
    /// The referenced task does not exist in the scheduler.
    #[error("task not found: {task_id}")]
    TaskNotFound {
        /// The [`Uuid`] that was looked up.
        task_id: Uuid,
    },

    /// The scheduler has been shut down and will not accept new work.
    #[error("scheduler is shut down")]
    SchedulerShutdown,

    /// The scheduler was started twice.
    #[error("scheduler already started")]
    SchedulerAlreadyStarted,

    // -- Intent errors ------------------------------------------------------
    /// A custom intent was used before being registered.
    #[error("intent not registered: {name}")]
    IntentNotRegistered { name: String },

    // -- Configuration errors -----------------------------------------------
    /// A configuration value is outside its valid range.
    #[error("invalid configuration `{key}`: {reason}")]
    InvalidConfig { key: String, reason: String },

    // -- Generic ------------------------------------------------------------
    /// Catch-all for unexpected internal errors that don't fit a specific
    /// variant.  Prefer a typed variant whenever possible.
    #[error("internal kernel error: {0}")]
    Internal(String),
}

impl KernelError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::TaskNotFound { .. } => "TASK_NOT_FOUND",
            Self::SchedulerShutdown => "SCHEDULER_SHUTDOWN",
            Self::SchedulerAlreadyStarted => "SCHEDULER_ALREADY_STARTED",
            Self::IntentNotRegistered { .. } => "INTENT_NOT_REGISTERED",
            Self::InvalidConfig { .. } => "INVALID_CONFIGURATION",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Render the error as a boundary-safe body.
    pub fn to_body(&self) -> ErrorBody {
        let status_code = match self {
            Self::TaskNotFound { .. } => 404,
            Self::IntentNotRegistered { .. } | Self::InvalidConfig { .. } => 400,
            Self::SchedulerShutdown => 503,
            Self::SchedulerAlreadyStarted | Self::Internal(_) => 500,
        };
        ErrorBody {
            status_code,
            code: self.code().to_string(),
            message: self.to_string(),
            details: serde_json::Value::Null,
        }
    }
}

/// Structured error body handed to the framework boundary.
///
/// Contains only the error code, a human readable message and structured
/// details; never debug output or backtraces.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub status_code: u16,
    pub code: String,
    pub message: String,
    pub details: serde_json::Value,
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_carries_code_and_message() {
        let err = KernelError::IntentNotRegistered {
            name: "billing".into(),
        };
        let body = err.to_body();
        assert_eq!(body.status_code, 400);
        assert_eq!(body.code, "INTENT_NOT_REGISTERED");
        assert!(body.message.contains("billing"));
    }

    #[test]
    fn shutdown_maps_to_unavailable() {
        assert_eq!(KernelError::SchedulerShutdown.to_body().status_code, 503);
    }
}

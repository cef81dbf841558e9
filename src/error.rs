//! # Error types used by operations and services.
//!
//! Two error enums, one per entity family:
//!
//! - [`OpError`] — everything an [`AsyncOp`](crate::AsyncOp) can fail with,
//!   including the cooperative-cancel sentinel [`OpError::Stopped`].
//! - [`ServiceError`] — failures raised by a [`Service`](crate::Service) or
//!   reported to it through `notify_failed`.
//!
//! Both types are `Clone` (a failure cause is stored in the state machine
//! *and* handed to listeners and dependent entities) and provide `as_label()`
//! for logs/metrics.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by asynchronous operations.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpError {
    /// An API was called in a state that forbids it (e.g. `start` twice,
    /// `result` before completion). Surfaced synchronously to the caller.
    #[error("illegal operation state: {0}")]
    IllegalState(String),

    /// The attached scheduler refused to enqueue or start the operation.
    #[error("scheduler rejected operation: {reason}")]
    Rejected {
        /// Why the scheduler refused.
        reason: String,
    },

    /// Cooperative-cancellation sentinel returned by an operation body.
    ///
    /// This is **not an error** in the traditional sense: the framework maps
    /// it to the `Cancelled` terminal state and surfaces nothing to
    /// observers.
    #[error("operation stopped cooperatively")]
    Stopped,

    /// The operation exceeded a deadline.
    #[error("timed out after {timeout:?}")]
    Timeout {
        /// The deadline that was exceeded.
        timeout: Duration,
    },

    /// The operation body failed.
    #[error("operation failed: {reason}")]
    Failed {
        /// Root-cause description.
        reason: String,
    },
}

impl OpError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            OpError::IllegalState(_) => "op_illegal_state",
            OpError::Rejected { .. } => "op_rejected",
            OpError::Stopped => "op_stopped",
            OpError::Timeout { .. } => "op_timeout",
            OpError::Failed { .. } => "op_failed",
        }
    }

    /// `true` for the cooperative-cancellation sentinel.
    pub fn is_stopped(&self) -> bool {
        matches!(self, OpError::Stopped)
    }

    /// Wraps an arbitrary error as a body failure. Only the display form is
    /// kept, so callers see the root-cause message rather than wrapper noise.
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        OpError::Failed {
            reason: reason.to_string(),
        }
    }
}

/// Errors produced by services.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// An API was called in a state that forbids it (e.g. `start` while
    /// running). Surfaced synchronously to the caller.
    #[error("illegal service state: {0}")]
    IllegalState(String),

    /// A start/stop hook failed, or a runtime failure was reported through
    /// `notify_failed`. Recorded as the failure cause while the service is
    /// in the `Failed` state.
    #[error("service failed: {reason}")]
    Failed {
        /// Root-cause description.
        reason: String,
    },
}

impl ServiceError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            ServiceError::IllegalState(_) => "service_illegal_state",
            ServiceError::Failed { .. } => "service_failed",
        }
    }

    /// Wraps an arbitrary error as a service failure.
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        ServiceError::Failed {
            reason: reason.to_string(),
        }
    }
}

//! # Operation states.
//!
//! [`OpState`] is the public, observable state of an operation. [`OpPhase`]
//! is the fine-grained internal machine behind it; the numeric order of its
//! variants is load-bearing (transition guards compare phases, e.g.
//! "anything past `Running` can no longer be cancelled through the stop
//! hook"), so variants must not be reordered.

/// Public state of an [`AsyncOp`](crate::AsyncOp).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpState {
    /// Not started yet (also covers scheduling and the start prelude).
    NotStarted,
    /// The body is running.
    Running,
    /// Finished successfully; the result is available.
    Completed,
    /// Finished with an error; the failure cause is available.
    Failed,
    /// Finished by cancellation.
    Cancelled,
}

impl OpState {
    /// `true` for the three terminal states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OpState::Completed | OpState::Failed | OpState::Cancelled)
    }
}

/// Fine-grained internal state of an [`AsyncOp`](crate::AsyncOp).
///
/// The declaration order defines the phase ordering used by guards and
/// waits: everything from [`Completed`](OpPhase::Completed) on is past the
/// point of normal execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OpPhase {
    /// Created, `start` not called.
    NotStarted,
    /// `start` called, waiting for the scheduler's permit.
    Scheduling,
    /// Permitted; the start prelude is in flight, `Running` not signalled.
    Starting,
    /// The body is running.
    Running,
    /// Terminal: completed with a result.
    Completed,
    /// Terminal: failed with a cause.
    Failed,
    /// Cancellation requested, the stop hook is in flight.
    Cancelling,
    /// Terminal: cancelled.
    Cancelled,
    /// Cancelled before the permitted start could take effect.
    CancelPended,
    /// Cancellation deferred until a pending start notification lands.
    DelayedCancelling,
}

impl OpPhase {
    /// Maps the internal phase to the public state.
    pub fn public(&self) -> OpState {
        match self {
            OpPhase::NotStarted | OpPhase::Scheduling | OpPhase::Starting => OpState::NotStarted,
            OpPhase::Running => OpState::Running,
            OpPhase::Completed => OpState::Completed,
            OpPhase::Failed => OpState::Failed,
            OpPhase::Cancelling | OpPhase::Cancelled | OpPhase::DelayedCancelling => {
                OpState::Cancelled
            }
            OpPhase::CancelPended => OpState::NotStarted,
        }
    }

    /// `true` once the operation can no longer make progress: past
    /// `Running`, excluding the transient `Cancelling` phase.
    pub fn is_settled(&self) -> bool {
        *self > OpPhase::Running && *self != OpPhase::Cancelling
    }
}

//! # Service states.
//!
//! [`ServiceState`] is the public, observable state of a service.
//! [`ServicePhase`] is the fine-grained internal machine behind it; the
//! three transient phases (`Starting`, `Stopping`, `Failing`) only ever
//! resolve on the task executing the corresponding hook.

/// Public state of a [`Service`](crate::Service).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServiceState {
    /// Not running; may be (re)started.
    Stopped,
    /// Running.
    Running,
    /// Failed; the failure cause is recorded. May be restarted.
    Failed,
}

/// Fine-grained internal state of a [`Service`](crate::Service).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServicePhase {
    /// Not running.
    Stopped,
    /// The start hook is in flight.
    Starting,
    /// Running.
    Running,
    /// The stop hook is in flight.
    Stopping,
    /// The failure handler is in flight.
    Failing,
    /// Failed with a recorded cause.
    Failed,
}

impl ServicePhase {
    /// Maps the internal phase to the public state.
    pub fn public(&self) -> ServiceState {
        match self {
            ServicePhase::Stopped | ServicePhase::Starting => ServiceState::Stopped,
            ServicePhase::Running | ServicePhase::Stopping => ServiceState::Running,
            ServicePhase::Failing | ServicePhase::Failed => ServiceState::Failed,
        }
    }

    /// `true` for the transient phases resolved only by the hook-executing
    /// task.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ServicePhase::Starting | ServicePhase::Stopping | ServicePhase::Failing
        )
    }
}

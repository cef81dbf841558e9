//! # Future conditions over entity states.
//!
//! A condition pairs an entity with a predicate over its **public** state.
//! The predicate is evaluated once at construction; if it does not hold
//! yet, the condition tracks state transitions and becomes — and stays —
//! *done* the first time it holds. Deregistration is implicit: conditions
//! observe the entity through its phase channel and hold no listener slot.

use std::time::Duration;

use tokio::sync::watch;

use crate::op::{OpHandle, OpPhase, OpState};
use crate::service::{Service, ServicePhase, ServiceState};

/// Condition over a service's public state.
pub struct ServiceCondition {
    rx: watch::Receiver<ServicePhase>,
    predicate: Box<dyn Fn(ServiceState) -> bool + Send + Sync>,
    done: bool,
}

impl ServiceCondition {
    /// Creates a condition; the predicate is evaluated immediately.
    pub fn new(
        service: &Service,
        predicate: impl Fn(ServiceState) -> bool + Send + Sync + 'static,
    ) -> Self {
        let rx = service.watch_phase();
        let done = predicate(service.state());
        Self {
            rx,
            predicate: Box::new(predicate),
            done,
        }
    }

    /// Done once the service is `Running`.
    pub fn when_running(service: &Service) -> Self {
        Self::new(service, |s| s == ServiceState::Running)
    }

    /// Done once the service is `Stopped`.
    pub fn when_stopped(service: &Service) -> Self {
        Self::new(service, |s| s == ServiceState::Stopped)
    }

    /// Done once the service is `Stopped` or `Failed`.
    pub fn when_finished(service: &Service) -> Self {
        Self::new(service, |s| {
            matches!(s, ServiceState::Stopped | ServiceState::Failed)
        })
    }

    /// Re-evaluates without waiting; done-state is sticky.
    pub fn evaluate_now(&mut self) -> bool {
        if !self.done {
            self.done = (self.predicate)(self.rx.borrow().public());
        }
        self.done
    }

    /// Waits until the condition is done.
    pub async fn wait(&mut self) {
        if self.done {
            return;
        }
        let predicate = &self.predicate;
        if self.rx.wait_for(|p| predicate(p.public())).await.is_ok() {
            self.done = true;
        }
    }

    /// Bounded [`wait`](Self::wait); `false` on timeout.
    pub async fn wait_for(&mut self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok() && self.done
    }
}

/// Condition over an operation's public state.
pub struct OpCondition {
    rx: watch::Receiver<OpPhase>,
    predicate: Box<dyn Fn(OpState) -> bool + Send + Sync>,
    done: bool,
}

impl OpCondition {
    /// Creates a condition; the predicate is evaluated immediately.
    pub fn new(
        op: &dyn OpHandle,
        predicate: impl Fn(OpState) -> bool + Send + Sync + 'static,
    ) -> Self {
        let rx = op.watch_phase();
        let done = predicate(op.state());
        Self {
            rx,
            predicate: Box::new(predicate),
            done,
        }
    }

    /// Done once the operation is running (or already past it).
    pub fn when_started(op: &dyn OpHandle) -> Self {
        Self::new(op, |s| s != OpState::NotStarted)
    }

    /// Done once the operation reached a terminal state.
    pub fn when_finished(op: &dyn OpHandle) -> Self {
        Self::new(op, |s| s.is_terminal())
    }

    /// Re-evaluates without waiting; done-state is sticky.
    pub fn evaluate_now(&mut self) -> bool {
        if !self.done {
            self.done = (self.predicate)(self.rx.borrow().public());
        }
        self.done
    }

    /// Waits until the condition is done.
    pub async fn wait(&mut self) {
        if self.done {
            return;
        }
        let predicate = &self.predicate;
        if self.rx.wait_for(|p| predicate(p.public())).await.is_ok() {
            self.done = true;
        }
    }

    /// Bounded [`wait`](Self::wait); `false` on timeout.
    pub async fn wait_for(&mut self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok() && self.done
    }
}

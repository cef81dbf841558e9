//! # Operation schedulers.
//!
//! A scheduler arbitrates *when* submitted operations are permitted to run,
//! through the submit → permit-to-start handshake: `AsyncOp::start`
//! transitions to `Scheduling` and submits itself; the scheduler later
//! calls `permit_to_start` to let it proceed (or learns that it was
//! cancelled in the meantime and skips it).
//!
//! Three policies ship with the crate, with stable policy ids:
//!
//! | Policy | Id | Behavior on submit |
//! |---|---|---|
//! | [`NoWaitScheduler`] | `"nowait"` | permit immediately, track as running |
//! | [`QueuedScheduler`] | `"queued"` | run one at a time, FIFO-queue the rest |
//! | [`CancellingScheduler`] | `"cancel_previous"` | cancel the running one (waiting for it to finish), then permit |
//!
//! Scheduler listeners are notified on submission only — never on state
//! changes (watch the operation itself for those). A listener that panics
//! is evicted.

mod cancelling;
mod nowait;
mod queued;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::FutureExt;

use crate::error::OpError;
use crate::events::ListenerId;
use crate::op::OpRef;
use crate::relock;

pub use cancelling::CancellingScheduler;
pub use nowait::NoWaitScheduler;
pub use queued::QueuedScheduler;

pub(crate) const LOG_TARGET: &str = "SCHEDULER";

/// Listener of scheduler submissions.
#[async_trait]
pub trait SchedulerWatcher: Send + Sync + 'static {
    /// Called when an operation was submitted to the scheduler.
    async fn on_submitted(&self, op: &OpRef);
}

/// An operation scheduler: arbitrates permits for submitted operations.
#[async_trait]
pub trait OpScheduler: Send + Sync + 'static {
    /// Stable policy identifier (`"nowait"`, `"queued"`,
    /// `"cancel_previous"`).
    fn policy_id(&self) -> &'static str;

    /// Submits an operation in the `Scheduling` phase. The scheduler tracks
    /// its completion and applies the policy.
    async fn submit(&self, op: OpRef) -> Result<(), OpError>;

    /// Cancels the running and queued operations and waits for all of them
    /// to finish.
    async fn stop_all(&self);

    /// Registers a submission listener.
    fn add_listener(&self, listener: Arc<dyn SchedulerWatcher>) -> ListenerId;

    /// Deregisters a submission listener.
    fn remove_listener(&self, id: ListenerId);
}

/// Shared submission-listener registry used by all scheduler policies.
pub(crate) struct SchedulerListeners {
    entries: Mutex<Vec<(ListenerId, Arc<dyn SchedulerWatcher>)>>,
    next_id: AtomicU64,
}

impl SchedulerListeners {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        })
    }

    pub(crate) fn add(&self, listener: Arc<dyn SchedulerWatcher>) -> ListenerId {
        let id = ListenerId::new(self.next_id.fetch_add(1, AtomicOrdering::Relaxed));
        relock(&self.entries).push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) {
        relock(&self.entries).retain(|(eid, _)| *eid != id);
    }

    /// Notifies all listeners of a submission, each on its own task. A
    /// panicking listener is evicted.
    pub(crate) fn notify_submitted(self: &Arc<Self>, op: &OpRef) {
        let snapshot: Vec<(ListenerId, Arc<dyn SchedulerWatcher>)> =
            relock(&self.entries).clone();
        for (id, listener) in snapshot {
            let registry = Arc::clone(self);
            let op = Arc::clone(op);
            tokio::spawn(async move {
                if AssertUnwindSafe(listener.on_submitted(&op))
                    .catch_unwind()
                    .await
                    .is_err()
                {
                    log::warn!(
                        target: LOG_TARGET,
                        "evicting panicked scheduler listener: op={}",
                        op.name()
                    );
                    registry.remove(id);
                }
            });
        }
    }
}

//! # The no-wait scheduling policy.
//!
//! Every submitted operation is permitted to start immediately; the
//! scheduler merely tracks the running set so `stop_all` can drain it.
//! Observationally this policy is transparent: submitting an operation
//! yields the same state trace as starting it directly.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::OpError;
use crate::events::ListenerId;
use crate::op::OpRef;
use crate::sched::{OpScheduler, SchedulerListeners, SchedulerWatcher, LOG_TARGET};

/// Scheduler that starts every submission immediately.
pub struct NoWaitScheduler {
    listeners: Arc<SchedulerListeners>,
    running: Arc<Mutex<Vec<OpRef>>>,
}

impl NoWaitScheduler {
    /// Creates a new no-wait scheduler.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: SchedulerListeners::new(),
            running: Arc::new(Mutex::new(Vec::new())),
        })
    }
}

#[async_trait]
impl OpScheduler for NoWaitScheduler {
    fn policy_id(&self) -> &'static str {
        "nowait"
    }

    async fn submit(&self, op: OpRef) -> Result<(), OpError> {
        self.listeners.notify_submitted(&op);

        if op.permit_to_start().await? {
            self.running.lock().await.push(Arc::clone(&op));

            let running = Arc::clone(&self.running);
            tokio::spawn(async move {
                op.wait_for_finished().await;
                running.lock().await.retain(|o| !Arc::ptr_eq(o, &op));
            });
        }
        Ok(())
    }

    async fn stop_all(&self) {
        let snapshot: Vec<OpRef> = self.running.lock().await.clone();
        for op in &snapshot {
            op.cancel().await;
        }
        for op in &snapshot {
            log::debug!(target: LOG_TARGET, "waiting finish: op={}", op.name());
            op.wait_for_finished().await;
        }
        self.running.lock().await.clear();
    }

    fn add_listener(&self, listener: Arc<dyn SchedulerWatcher>) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(id);
    }
}

//! # The cancel-previous scheduling policy.
//!
//! A submission cancels the currently running operation — synchronously
//! waiting for it to finish — and then permits the new one. Useful when
//! only the latest request matters (the newest submission invalidates the
//! one in flight).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::OpError;
use crate::events::ListenerId;
use crate::op::OpRef;
use crate::sched::{OpScheduler, SchedulerListeners, SchedulerWatcher, LOG_TARGET};

/// Scheduler that cancels the previous operation before starting the next.
pub struct CancellingScheduler {
    listeners: Arc<SchedulerListeners>,
    running: Arc<Mutex<Option<OpRef>>>,
}

impl CancellingScheduler {
    /// Creates a new cancel-previous scheduler.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: SchedulerListeners::new(),
            running: Arc::new(Mutex::new(None)),
        })
    }
}

#[async_trait]
impl OpScheduler for CancellingScheduler {
    fn policy_id(&self) -> &'static str {
        "cancel_previous"
    }

    async fn submit(&self, op: OpRef) -> Result<(), OpError> {
        self.listeners.notify_submitted(&op);

        let mut st = self.running.lock().await;
        if let Some(previous) = st.take() {
            log::debug!(
                target: LOG_TARGET,
                "cancelling previous: op={}",
                previous.name()
            );
            previous.cancel().await;
            previous.wait_for_finished().await;
        }

        if op.permit_to_start().await? {
            *st = Some(Arc::clone(&op));
            drop(st);

            let running = Arc::clone(&self.running);
            tokio::spawn(async move {
                op.wait_for_finished().await;
                let mut st = running.lock().await;
                if st.as_ref().is_some_and(|r| Arc::ptr_eq(r, &op)) {
                    *st = None;
                }
            });
        }
        Ok(())
    }

    async fn stop_all(&self) {
        let previous = self.running.lock().await.take();
        if let Some(previous) = previous {
            previous.cancel().await;
            previous.wait_for_finished().await;
        }
    }

    fn add_listener(&self, listener: Arc<dyn SchedulerWatcher>) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(id);
    }
}

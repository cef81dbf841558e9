//! # The queued scheduling policy.
//!
//! At most one operation runs at a time. A submission while idle is
//! permitted immediately; otherwise it joins a FIFO queue. When the
//! running operation finishes, the scheduler pops the queue and permits
//! the next entry, skipping entries whose permit is refused (cancelled
//! while waiting).

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::OpError;
use crate::events::ListenerId;
use crate::op::OpRef;
use crate::sched::{OpScheduler, SchedulerListeners, SchedulerWatcher, LOG_TARGET};

struct QueueState {
    running: Option<OpRef>,
    queue: VecDeque<OpRef>,
}

struct Inner {
    listeners: Arc<SchedulerListeners>,
    state: Mutex<QueueState>,
}

/// Scheduler that runs one operation at a time, queueing the rest FIFO.
pub struct QueuedScheduler {
    inner: Arc<Inner>,
}

impl QueuedScheduler {
    /// Creates a new queued scheduler.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Inner {
                listeners: SchedulerListeners::new(),
                state: Mutex::new(QueueState {
                    running: None,
                    queue: VecDeque::new(),
                }),
            }),
        })
    }
}

#[async_trait]
impl OpScheduler for QueuedScheduler {
    fn policy_id(&self) -> &'static str {
        "queued"
    }

    async fn submit(&self, op: OpRef) -> Result<(), OpError> {
        self.inner.listeners.notify_submitted(&op);

        let mut st = self.inner.state.lock().await;
        if st.running.is_none() {
            // Idle implies an empty queue; permit directly.
            if op.permit_to_start().await? {
                st.running = Some(Arc::clone(&op));
                drop(st);
                tokio::spawn(watch(Arc::clone(&self.inner), op));
            }
        } else {
            log::info!(target: LOG_TARGET, "enqueued: op={}", op.name());
            st.queue.push_back(op);
        }
        Ok(())
    }

    async fn stop_all(&self) {
        let victims: Vec<OpRef> = {
            let mut st = self.inner.state.lock().await;
            let mut victims: Vec<OpRef> = st.queue.drain(..).collect();
            if let Some(running) = st.running.take() {
                victims.push(running);
            }
            victims
        };
        for op in &victims {
            op.cancel().await;
        }
        for op in &victims {
            op.wait_for_finished().await;
        }
    }

    fn add_listener(&self, listener: Arc<dyn SchedulerWatcher>) -> ListenerId {
        self.inner.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.inner.listeners.remove(id);
    }
}

/// Follows the running operation to its finish and hands the slot to the
/// next queued entry. One watcher chain exists per busy period; a stale
/// watcher (its operation was detached by `stop_all`) exits quietly.
async fn watch(inner: Arc<Inner>, mut op: OpRef) {
    loop {
        op.wait_for_finished().await;

        let next = {
            let mut st = inner.state.lock().await;
            let is_current = st
                .running
                .as_ref()
                .is_some_and(|running| Arc::ptr_eq(running, &op));
            if !is_current {
                return;
            }
            st.running = None;

            let mut started = None;
            while let Some(candidate) = st.queue.pop_front() {
                match candidate.permit_to_start().await {
                    Ok(true) => {
                        st.running = Some(Arc::clone(&candidate));
                        started = Some(candidate);
                        break;
                    }
                    Ok(false) => {
                        log::debug!(
                            target: LOG_TARGET,
                            "skipping cancelled entry: op={}",
                            candidate.name()
                        );
                    }
                    Err(fault) => {
                        log::warn!(
                            target: LOG_TARGET,
                            "permit refused: op={}, cause={fault}",
                            candidate.name()
                        );
                    }
                }
            }
            started
        };

        match next {
            Some(next) => op = next,
            None => return,
        }
    }
}

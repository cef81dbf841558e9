//! # Sequential composition of operations.
//!
//! Runs its children strictly in order: each child starts once its
//! predecessor completed. The parent's result is the last child's result.
//!
//! ## Rules
//! - Any child failure or cancellation short-circuits; the parent reports
//!   the same terminal state (failures carry the child's cause).
//! - A cancel request observed at a child completion boundary cancels the
//!   parent instead of starting the next child (a cancelled child may still
//!   complete; the cursor re-checks the flag under the lock).

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::OpError;
use crate::op::core::{AsyncOp, Operate, OpResult};
use crate::op::OpPhase;
use crate::relock;

const LOG_TARGET: &str = "AOP.SEQ";

/// Sequential operation combinator.
pub struct SequentialOp;

impl SequentialOp {
    /// Composes `elements` into one operation that runs them in order.
    ///
    /// # Errors
    /// [`OpError::IllegalState`] when `elements` is empty.
    pub fn new<T: OpResult>(elements: Vec<AsyncOp<T>>) -> Result<AsyncOp<T>, OpError> {
        if elements.is_empty() {
            return Err(OpError::IllegalState("no element operations".into()));
        }
        let body = SeqBody {
            elements: Arc::new(elements),
            shared: Arc::new(Mutex::new(SeqShared {
                cursor: 0,
                stop_requested: false,
            })),
        };
        Ok(AsyncOp::with_target("sequential", Arc::new(body), LOG_TARGET))
    }
}

struct SeqShared {
    cursor: usize,
    stop_requested: bool,
}

struct SeqBody<T: OpResult> {
    elements: Arc<Vec<AsyncOp<T>>>,
    shared: Arc<Mutex<SeqShared>>,
}

#[async_trait]
impl<T: OpResult> Operate<T> for SeqBody<T> {
    async fn start_operation(&self, op: &AsyncOp<T>) -> Result<(), OpError> {
        relock(&self.shared).cursor = 0;
        self.elements[0].start().await?;
        op.notify_started();

        let elements = Arc::clone(&self.elements);
        let shared = Arc::clone(&self.shared);
        let parent = op.clone();
        tokio::spawn(async move {
            drive(elements, shared, parent).await;
        });
        Ok(())
    }

    async fn stop_operation(&self, _op: &AsyncOp<T>) {
        let current = {
            let mut sh = relock(&self.shared);
            sh.stop_requested = true;
            self.elements.get(sh.cursor).cloned()
        };
        if let Some(child) = current {
            child.cancel().await;
        }
    }
}

/// What the driver decided to do after a child completed.
enum Step<T: OpResult> {
    Start(AsyncOp<T>),
    CancelParent,
    Complete(T),
    Fail(OpError),
}

async fn drive<T: OpResult>(
    elements: Arc<Vec<AsyncOp<T>>>,
    shared: Arc<Mutex<SeqShared>>,
    parent: AsyncOp<T>,
) {
    loop {
        let child = {
            let sh = relock(&shared);
            match elements.get(sh.cursor) {
                Some(child) => child.clone(),
                None => return,
            }
        };
        child.wait_for_finished().await;
        log::debug!(
            target: LOG_TARGET,
            "finished element: seq={}, child={}",
            parent.name(),
            child.name()
        );

        match child.phase() {
            OpPhase::Completed => {
                let step = {
                    let mut sh = relock(&shared);
                    sh.cursor += 1;
                    if sh.cursor < elements.len() {
                        if sh.stop_requested {
                            Step::CancelParent
                        } else {
                            Step::Start(elements[sh.cursor].clone())
                        }
                    } else {
                        match child.result() {
                            Ok(value) => Step::Complete(value),
                            Err(fault) => Step::Fail(fault),
                        }
                    }
                };
                match step {
                    Step::Start(next) => {
                        if let Err(fault) = next.start().await {
                            parent.notify_failed(fault);
                            return;
                        }
                    }
                    Step::CancelParent => {
                        parent.notify_cancelled();
                        return;
                    }
                    Step::Complete(value) => {
                        parent.notify_completed(value).await;
                        return;
                    }
                    Step::Fail(fault) => {
                        log::warn!(
                            target: LOG_TARGET,
                            "fails to read element result: child={}, cause={fault}",
                            child.name()
                        );
                        parent.notify_failed(fault);
                        return;
                    }
                }
            }
            OpPhase::Cancelled | OpPhase::DelayedCancelling | OpPhase::CancelPended => {
                parent.notify_cancelled();
                return;
            }
            OpPhase::Failed => {
                let cause = child
                    .failure_cause()
                    .unwrap_or_else(|| OpError::failed("element failed without recorded cause"));
                parent.notify_failed(cause);
                return;
            }
            other => {
                log::error!(
                    target: LOG_TARGET,
                    "element settled in unexpected phase {other:?}: child={}",
                    child.name()
                );
                return;
            }
        }
    }
}

//! # Concurrent composition of operations.
//!
//! Starts all children in parallel. The parent completes once `quorum` of
//! them have finished — **any** terminal state counts toward the quorum, so
//! a failed or cancelled child does not abort the combinator. When the
//! quorum is reached, the remaining children are cancelled.
//!
//! The parent's result is `()`: a quorum combinator is not a collect-all;
//! individual results stay observable on the children.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};

use crate::error::OpError;
use crate::op::core::{AsyncOp, Operate, OpRef};
use crate::op::OpState;
use crate::relock;

const LOG_TARGET: &str = "AOP.CONCUR";

/// Concurrent operation combinator.
pub struct ConcurrentOp;

impl ConcurrentOp {
    /// Composes `elements` into one operation that runs them in parallel
    /// and completes when **all** of them finished.
    ///
    /// # Errors
    /// [`OpError::IllegalState`] when `elements` is empty.
    pub fn new(elements: Vec<OpRef>) -> Result<AsyncOp<()>, OpError> {
        let quorum = elements.len();
        Self::with_quorum(elements, quorum)
    }

    /// Like [`new`](Self::new), but the parent completes once `quorum`
    /// children finished; the rest are cancelled.
    ///
    /// # Errors
    /// [`OpError::IllegalState`] when `elements` is empty or `quorum` is
    /// out of `1..=elements.len()`.
    pub fn with_quorum(elements: Vec<OpRef>, quorum: usize) -> Result<AsyncOp<()>, OpError> {
        if elements.is_empty() {
            return Err(OpError::IllegalState("no element operations".into()));
        }
        if quorum == 0 || quorum > elements.len() {
            return Err(OpError::IllegalState(format!(
                "quorum {quorum} out of range 1..={}",
                elements.len()
            )));
        }
        let body = ConcurBody {
            elements: Arc::new(elements),
            quorum,
            stopping: Arc::new(Mutex::new(false)),
        };
        Ok(AsyncOp::with_target("concurrent", Arc::new(body), LOG_TARGET))
    }
}

struct ConcurBody {
    elements: Arc<Vec<OpRef>>,
    quorum: usize,
    stopping: Arc<Mutex<bool>>,
}

#[async_trait]
impl Operate<()> for ConcurBody {
    async fn start_operation(&self, op: &AsyncOp<()>) -> Result<(), OpError> {
        for element in self.elements.iter() {
            if element.state() == OpState::NotStarted {
                element.start().await?;
            }
        }
        op.notify_started();

        let elements = Arc::clone(&self.elements);
        let quorum = self.quorum;
        let stopping = Arc::clone(&self.stopping);
        let parent = op.clone();
        tokio::spawn(async move {
            let mut settles: FuturesUnordered<_> = elements
                .iter()
                .map(|element| {
                    let element = Arc::clone(element);
                    async move { element.wait_for_finished().await }
                })
                .collect();

            let mut finished = 0usize;
            while settles.next().await.is_some() {
                finished += 1;
                if finished == elements.len() {
                    let stopped = *relock(&stopping);
                    if stopped {
                        parent.notify_cancelled();
                    } else {
                        parent.notify_completed(()).await;
                    }
                } else if finished == quorum {
                    log::debug!(
                        target: LOG_TARGET,
                        "quorum reached ({finished}/{}): cancelling the rest",
                        elements.len()
                    );
                    for element in elements.iter() {
                        element.cancel().await;
                    }
                }
            }
        });
        Ok(())
    }

    async fn stop_operation(&self, _op: &AsyncOp<()>) {
        *relock(&self.stopping) = true;
        for element in self.elements.iter() {
            element.cancel().await;
        }
    }
}

//! # Deferred start of an operation.
//!
//! Starts the target operation after a configured delay and then mirrors
//! its outcome, result included. Cancelling the parent before the tick
//! cancels only the pending timer (the target is never started);
//! cancelling after the tick delegates to the target.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::error::OpError;
use crate::op::core::{AsyncOp, Operate, OpResult};
use crate::op::OpPhase;

const LOG_TARGET: &str = "AOP.DELAYED";

/// Deferred-start operation combinator.
pub struct DelayedOp;

impl DelayedOp {
    /// Starts `target` after `delay`; the parent adopts the target's
    /// result and terminal state.
    pub fn new<T: OpResult>(target: AsyncOp<T>, delay: Duration) -> AsyncOp<T> {
        let body = DelayedBody {
            target,
            delay,
            gate: CancellationToken::new(),
            tick_passed: Arc::new(AtomicBool::new(false)),
        };
        AsyncOp::with_target(format!("delayed[{delay:?}]"), Arc::new(body), LOG_TARGET)
    }
}

struct DelayedBody<T: OpResult> {
    target: AsyncOp<T>,
    delay: Duration,
    gate: CancellationToken,
    tick_passed: Arc<AtomicBool>,
}

#[async_trait]
impl<T: OpResult> Operate<T> for DelayedBody<T> {
    async fn start_operation(&self, op: &AsyncOp<T>) -> Result<(), OpError> {
        let target = self.target.clone();
        let delay = self.delay;
        let gate = self.gate.clone();
        let tick_passed = Arc::clone(&self.tick_passed);
        let parent = op.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = time::sleep(delay) => {}
                _ = gate.cancelled() => {
                    parent.notify_cancelled();
                    return;
                }
            }
            tick_passed.store(true, AtomicOrdering::SeqCst);
            // The parent may have been cancelled while the timer was pending.
            if parent.phase() > OpPhase::Running {
                return;
            }

            if let Err(fault) = target.start().await {
                parent.notify_failed(fault);
                return;
            }
            log::debug!(target: LOG_TARGET, "started delayed op: target={}", target.name());

            target.wait_for_finished().await;
            match target.phase() {
                OpPhase::Completed => match target.result() {
                    Ok(value) => parent.notify_completed(value).await,
                    Err(fault) => {
                        log::warn!(
                            target: LOG_TARGET,
                            "fails to read delayed result: cause={fault}"
                        );
                        parent.notify_failed(fault);
                    }
                },
                OpPhase::Failed => {
                    let cause = target
                        .failure_cause()
                        .unwrap_or_else(|| OpError::failed("target failed without recorded cause"));
                    parent.notify_failed(cause);
                }
                _ => parent.notify_cancelled(),
            }
        });

        op.notify_started();
        Ok(())
    }

    async fn stop_operation(&self, _op: &AsyncOp<T>) {
        if self.tick_passed.load(AtomicOrdering::SeqCst) {
            self.target.cancel().await;
        } else {
            self.gate.cancel();
        }
    }
}

//! # Deadline-bounded execution of an operation.
//!
//! Runs a target operation under a timeout. If the target finishes first,
//! its terminal state propagates. If the timeout fires first, the target is
//! cancelled and — when an `on_timeout` factory is configured — a timeout
//! handler operation runs in its place and the parent adopts its outcome
//! (handler completed → parent completed; handler failed or cancelled →
//! parent cancelled). Without a factory, the parent completes and the
//! combinator is marked timed-out.
//!
//! Like the concurrent combinator, the parent's result is `()`: the
//! target's result stays observable on the target itself.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time;

use crate::error::OpError;
use crate::op::core::{mirror_started, AsyncOp, Operate, OpRef};
use crate::op::OpPhase;
use crate::relock;

const LOG_TARGET: &str = "AOP.TIMED";

/// Factory producing the operation to run when the timeout fires.
type TimeoutOpFactory = Arc<dyn Fn() -> OpRef + Send + Sync>;

struct TimedShared {
    /// The timer fired and the timeout path is in charge.
    timeout_fired: bool,
    /// The combinator timed out (with or without a handler op).
    timed_out: bool,
    /// Parent cancellation requested while the timeout path was settling.
    cancel_requested: bool,
    /// The running timeout handler, if any.
    timeout_op: Option<OpRef>,
}

/// Deadline-bounding operation combinator.
///
/// Holds the composed [`AsyncOp`] plus the timed-out probe.
#[derive(Clone)]
pub struct TimedOp {
    op: AsyncOp<()>,
    shared: Arc<Mutex<TimedShared>>,
}

impl TimedOp {
    /// Bounds `target` by `timeout`.
    ///
    /// # Errors
    /// [`OpError::IllegalState`] when `timeout` is zero.
    pub fn new(target: OpRef, timeout: Duration) -> Result<TimedOp, OpError> {
        Self::build(target, timeout, None)
    }

    /// Like [`new`](Self::new), with a handler operation started when the
    /// timeout fires; the parent adopts the handler's outcome.
    pub fn with_on_timeout(
        target: OpRef,
        timeout: Duration,
        on_timeout: impl Fn() -> OpRef + Send + Sync + 'static,
    ) -> Result<TimedOp, OpError> {
        Self::build(target, timeout, Some(Arc::new(on_timeout)))
    }

    fn build(
        target: OpRef,
        timeout: Duration,
        on_timeout: Option<TimeoutOpFactory>,
    ) -> Result<TimedOp, OpError> {
        if timeout.is_zero() {
            return Err(OpError::IllegalState(
                "timeout should be greater than zero".into(),
            ));
        }
        let shared = Arc::new(Mutex::new(TimedShared {
            timeout_fired: false,
            timed_out: false,
            cancel_requested: false,
            timeout_op: None,
        }));
        let body = TimedBody {
            target,
            timeout,
            on_timeout,
            shared: Arc::clone(&shared),
        };
        let op = AsyncOp::with_target("timed", Arc::new(body), LOG_TARGET);
        Ok(TimedOp { op, shared })
    }

    /// The composed operation.
    pub fn op(&self) -> &AsyncOp<()> {
        &self.op
    }

    /// Whether the deadline fired before the target finished.
    pub fn is_timed_out(&self) -> bool {
        relock(&self.shared).timed_out
    }
}

struct TimedBody {
    target: OpRef,
    timeout: Duration,
    on_timeout: Option<TimeoutOpFactory>,
    shared: Arc<Mutex<TimedShared>>,
}

#[async_trait]
impl Operate<()> for TimedBody {
    async fn start_operation(&self, op: &AsyncOp<()>) -> Result<(), OpError> {
        self.target.start().await?;
        mirror_started(Arc::clone(&self.target), op.clone());

        let target = Arc::clone(&self.target);
        let timeout = self.timeout;
        let on_timeout = self.on_timeout.clone();
        let shared = Arc::clone(&self.shared);
        let parent = op.clone();
        tokio::spawn(async move {
            let mut rx = target.watch_phase();
            let settled = async {
                let _ = rx.wait_for(|p| p.is_settled()).await;
            };
            tokio::select! {
                _ = settled => {
                    propagate(&target, &parent).await;
                }
                _ = time::sleep(timeout) => {
                    relock(&shared).timeout_fired = true;
                    log::debug!(
                        target: LOG_TARGET,
                        "expired: target={}, timeout={timeout:?}",
                        target.name()
                    );
                    target.cancel().await;
                    target.wait_for_finished().await;
                    match target.phase() {
                        // Finished right at the tick: the timeout did not count.
                        OpPhase::Completed | OpPhase::Failed => propagate(&target, &parent).await,
                        _ => handle_timeout(&target, on_timeout, &shared, &parent).await,
                    }
                }
            }
        });
        Ok(())
    }

    async fn stop_operation(&self, _op: &AsyncOp<()>) {
        let running_handler = {
            let mut sh = relock(&self.shared);
            sh.cancel_requested = true;
            sh.timeout_op.clone()
        };
        match running_handler {
            Some(handler) => handler.cancel().await,
            None => self.target.cancel().await,
        }
    }
}

/// Mirrors the target's terminal state onto the parent.
async fn propagate(target: &OpRef, parent: &AsyncOp<()>) {
    match target.phase() {
        OpPhase::Completed => parent.notify_completed(()).await,
        OpPhase::Failed => {
            let cause = target
                .failure_cause()
                .unwrap_or_else(|| OpError::failed("target failed without recorded cause"));
            parent.notify_failed(cause);
        }
        _ => parent.notify_cancelled(),
    }
}

async fn handle_timeout(
    target: &OpRef,
    on_timeout: Option<TimeoutOpFactory>,
    shared: &Arc<Mutex<TimedShared>>,
    parent: &AsyncOp<()>,
) {
    let factory = {
        let mut sh = relock(shared);
        sh.timed_out = true;
        if sh.cancel_requested {
            None
        } else {
            on_timeout
        }
    };

    let Some(factory) = factory else {
        let cancel_requested = relock(shared).cancel_requested;
        if cancel_requested {
            parent.notify_cancelled();
        } else {
            parent.notify_completed(()).await;
        }
        return;
    };

    let handler = factory();
    relock(shared).timeout_op = Some(Arc::clone(&handler));
    log::info!(
        target: LOG_TARGET,
        "starting timeout op: target={}, handler={}",
        target.name(),
        handler.name()
    );
    if let Err(fault) = handler.start().await {
        log::warn!(
            target: LOG_TARGET,
            "failed to start timeout op: cause={fault}"
        );
        parent.notify_failed(fault);
        return;
    }
    handler.wait_for_finished().await;
    match handler.phase() {
        OpPhase::Completed => parent.notify_completed(()).await,
        _ => parent.notify_cancelled(),
    }
}

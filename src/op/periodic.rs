//! # Periodic repetition of an operation.
//!
//! Repeatedly creates a fresh child through a factory and runs it:
//! an initial delay before the first round, an inter-round delay between
//! rounds, and an optional round count (`None` = forever). The parent
//! completes after the configured number of successful rounds; a child
//! that fails or is cancelled propagates its terminal state immediately.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::error::OpError;
use crate::op::core::{AsyncOp, Operate, OpRef};
use crate::op::OpPhase;
use crate::relock;

const LOG_TARGET: &str = "AOP.PERIODIC";

/// Factory producing a fresh child operation per round.
type RoundFactory = Arc<dyn Fn() -> OpRef + Send + Sync>;

/// Periodic operation combinator.
pub struct PeriodicOp;

impl PeriodicOp {
    /// Repeats operations produced by `factory`.
    ///
    /// `rounds = None` repeats forever (the parent then only finishes by
    /// cancellation or a child failure).
    ///
    /// # Errors
    /// [`OpError::IllegalState`] when `rounds` is `Some(0)`.
    pub fn new(
        factory: impl Fn() -> OpRef + Send + Sync + 'static,
        init_delay: Duration,
        inter_delay: Duration,
        rounds: Option<u32>,
    ) -> Result<AsyncOp<()>, OpError> {
        if rounds == Some(0) {
            return Err(OpError::IllegalState("rounds should not be zero".into()));
        }
        let body = PeriodicBody {
            factory: Arc::new(factory),
            init_delay,
            inter_delay,
            rounds,
            token: CancellationToken::new(),
            current: Arc::new(Mutex::new(None)),
        };
        Ok(AsyncOp::with_target("periodic", Arc::new(body), LOG_TARGET))
    }
}

struct PeriodicBody {
    factory: RoundFactory,
    init_delay: Duration,
    inter_delay: Duration,
    rounds: Option<u32>,
    token: CancellationToken,
    current: Arc<Mutex<Option<OpRef>>>,
}

#[async_trait]
impl Operate<()> for PeriodicBody {
    async fn start_operation(&self, op: &AsyncOp<()>) -> Result<(), OpError> {
        let factory = Arc::clone(&self.factory);
        let init_delay = self.init_delay;
        let inter_delay = self.inter_delay;
        let mut remains = self.rounds;
        let token = self.token.clone();
        let current = Arc::clone(&self.current);
        let parent = op.clone();

        tokio::spawn(async move {
            if !init_delay.is_zero() {
                tokio::select! {
                    _ = time::sleep(init_delay) => {}
                    _ = token.cancelled() => {
                        parent.notify_cancelled();
                        return;
                    }
                }
            }

            loop {
                if parent.phase() > OpPhase::Running {
                    return;
                }
                let child = (factory)();
                *relock(&current) = Some(Arc::clone(&child));
                if let Err(fault) = child.start().await {
                    parent.notify_failed(fault);
                    return;
                }
                child.wait_for_finished().await;

                match child.phase() {
                    OpPhase::Completed => {
                        if parent.phase() == OpPhase::Cancelling {
                            parent.notify_cancelled();
                            return;
                        }
                        if let Some(r) = remains.as_mut() {
                            *r -= 1;
                            if *r == 0 {
                                parent.notify_completed(()).await;
                                return;
                            }
                        }
                        log::debug!(
                            target: LOG_TARGET,
                            "round finished: periodic={}, remains={remains:?}",
                            parent.name()
                        );
                        if !inter_delay.is_zero() {
                            tokio::select! {
                                _ = time::sleep(inter_delay) => {}
                                _ = token.cancelled() => {
                                    parent.notify_cancelled();
                                    return;
                                }
                            }
                        }
                    }
                    OpPhase::Failed => {
                        let cause = child.failure_cause().unwrap_or_else(|| {
                            OpError::failed("round failed without recorded cause")
                        });
                        parent.notify_failed(cause);
                        return;
                    }
                    _ => {
                        parent.notify_cancelled();
                        return;
                    }
                }
            }
        });

        op.notify_started();
        Ok(())
    }

    async fn stop_operation(&self, _op: &AsyncOp<()>) {
        self.token.cancel();
        let child = relock(&self.current).clone();
        if let Some(child) = child {
            child.cancel().await;
        }
    }
}

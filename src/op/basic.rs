//! # Trivial operations: no-op and idle.
//!
//! [`NopOp`] completes immediately with `()` on start; [`IdleOp`] sleeps
//! for a configured duration and then completes. Both are cancellable and
//! are mainly useful as building blocks for combinators (e.g. the timeout
//! op of a [`TimedOp`](crate::TimedOp)).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::error::OpError;
use crate::op::core::{AsyncOp, Operate};

/// An operation that completes immediately with `()`.
pub struct NopOp;

impl NopOp {
    /// Creates a fresh no-op operation.
    pub fn new() -> AsyncOp<()> {
        AsyncOp::with_target("nop", Arc::new(NopBody), "AOP.NOP")
    }
}

struct NopBody;

#[async_trait]
impl Operate<()> for NopBody {
    async fn start_operation(&self, op: &AsyncOp<()>) -> Result<(), OpError> {
        op.notify_started();
        op.notify_completed(()).await;
        Ok(())
    }

    async fn stop_operation(&self, op: &AsyncOp<()>) {
        op.notify_cancelled();
    }
}

/// An operation that sleeps for a configured duration, then completes.
pub struct IdleOp;

impl IdleOp {
    /// Creates an operation that completes after `sleep`.
    pub fn new(sleep: Duration) -> AsyncOp<()> {
        let body = IdleBody {
            sleep,
            token: CancellationToken::new(),
        };
        AsyncOp::with_target(format!("idle[{sleep:?}]"), Arc::new(body), "AOP")
    }
}

struct IdleBody {
    sleep: Duration,
    token: CancellationToken,
}

#[async_trait]
impl Operate<()> for IdleBody {
    async fn start_operation(&self, op: &AsyncOp<()>) -> Result<(), OpError> {
        let sleep = self.sleep;
        let token = self.token.clone();
        let op_task = op.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = time::sleep(sleep) => op_task.notify_completed(()).await,
                _ = token.cancelled() => op_task.notify_cancelled(),
            }
        });
        op.notify_started();
        Ok(())
    }

    async fn stop_operation(&self, _op: &AsyncOp<()>) {
        self.token.cancel();
    }
}

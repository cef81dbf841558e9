//! # Foreground/background pairing of operations.
//!
//! Starts a foreground and a background operation together. The parent
//! mirrors the foreground's outcome (result included); the background is
//! always cancelled when the foreground terminates, whatever the terminal
//! state. A background that fails to start or finishes early never affects
//! the foreground.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::OpError;
use crate::op::core::{mirror_started, AsyncOp, Operate, OpRef, OpResult};
use crate::op::OpPhase;

const LOG_TARGET: &str = "AOP.BACKGROUND";

/// Foreground/background operation combinator.
pub struct BackgroundedOp;

impl BackgroundedOp {
    /// Runs `background` alongside `foreground`; the parent adopts the
    /// foreground's result and terminal state.
    pub fn new<T: OpResult>(foreground: AsyncOp<T>, background: OpRef) -> AsyncOp<T> {
        let body = BackgroundBody {
            foreground,
            background,
        };
        AsyncOp::with_target("backgrounded", Arc::new(body), LOG_TARGET)
    }
}

struct BackgroundBody<T: OpResult> {
    foreground: AsyncOp<T>,
    background: OpRef,
}

#[async_trait]
impl<T: OpResult> Operate<T> for BackgroundBody<T> {
    async fn start_operation(&self, op: &AsyncOp<T>) -> Result<(), OpError> {
        if let Err(fault) = self.background.start().await {
            log::warn!(
                target: LOG_TARGET,
                "failed to start background op: bg={}, cause={fault}",
                self.background.name()
            );
        }
        self.foreground.start().await?;

        // The started report comes from the foreground.
        mirror_started(self.foreground.erased(), op.clone());

        let foreground = self.foreground.clone();
        let background = Arc::clone(&self.background);
        let parent = op.clone();
        tokio::spawn(async move {
            foreground.wait_for_finished().await;
            // The background never outlives the foreground.
            background.cancel().await;

            match foreground.phase() {
                OpPhase::Completed => match foreground.result() {
                    Ok(value) => parent.notify_completed(value).await,
                    Err(fault) => {
                        log::warn!(
                            target: LOG_TARGET,
                            "fails to read foreground result: cause={fault}"
                        );
                        parent.notify_failed(fault);
                    }
                },
                OpPhase::Failed => {
                    let cause = foreground.failure_cause().unwrap_or_else(|| {
                        OpError::failed("foreground failed without recorded cause")
                    });
                    parent.notify_failed(cause);
                }
                _ => parent.notify_cancelled(),
            }
        });
        Ok(())
    }

    async fn stop_operation(&self, _op: &AsyncOp<T>) {
        self.foreground.cancel().await;
        self.background.cancel().await;
    }
}

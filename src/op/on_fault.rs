//! # Failure fallback for an operation.
//!
//! Runs a target operation; when (and only when) it fails, a handler
//! operation is created from the factory — which receives the failure
//! cause — and the parent adopts the handler's completion. If the handler
//! fails or is cancelled, the parent fails with the **original** cause.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::OpError;
use crate::op::core::{mirror_started, AsyncOp, Operate, OpResult};
use crate::op::OpPhase;
use crate::relock;

const LOG_TARGET: &str = "AOP.ON_FAULT";

/// Failure-fallback operation combinator.
pub struct OnFaultOp;

impl OnFaultOp {
    /// Runs `target`; on failure, runs the operation produced by
    /// `handler_factory` and adopts its completion.
    pub fn new<T: OpResult>(
        target: AsyncOp<T>,
        handler_factory: impl Fn(&OpError) -> AsyncOp<T> + Send + Sync + 'static,
    ) -> AsyncOp<T> {
        let body = OnFaultBody {
            target,
            factory: Arc::new(handler_factory),
            handler: Arc::new(Mutex::new(None)),
        };
        AsyncOp::with_target("on-fault", Arc::new(body), LOG_TARGET)
    }
}

type HandlerFactory<T> = Arc<dyn Fn(&OpError) -> AsyncOp<T> + Send + Sync>;

struct OnFaultBody<T: OpResult> {
    target: AsyncOp<T>,
    factory: HandlerFactory<T>,
    handler: Arc<Mutex<Option<AsyncOp<T>>>>,
}

#[async_trait]
impl<T: OpResult> Operate<T> for OnFaultBody<T> {
    async fn start_operation(&self, op: &AsyncOp<T>) -> Result<(), OpError> {
        self.target.start().await?;
        mirror_started(self.target.erased(), op.clone());

        let target = self.target.clone();
        let factory = Arc::clone(&self.factory);
        let handler_slot = Arc::clone(&self.handler);
        let parent = op.clone();
        tokio::spawn(async move {
            target.wait_for_finished().await;
            match target.phase() {
                OpPhase::Completed => match target.result() {
                    Ok(value) => parent.notify_completed(value).await,
                    Err(fault) => parent.notify_failed(fault),
                },
                OpPhase::Failed => {
                    let cause = target.failure_cause().unwrap_or_else(|| {
                        OpError::failed("target failed without recorded cause")
                    });
                    let handler = (factory)(&cause);
                    *relock(&handler_slot) = Some(handler.clone());
                    log::info!(
                        target: LOG_TARGET,
                        "starting fault handler: target={}, cause={cause}",
                        target.name()
                    );
                    if let Err(fault) = handler.start().await {
                        log::warn!(
                            target: LOG_TARGET,
                            "failed to start fault handler: cause={fault}"
                        );
                        parent.notify_failed(cause);
                        return;
                    }
                    handler.wait_for_finished().await;
                    match handler.phase() {
                        OpPhase::Completed => match handler.result() {
                            Ok(value) => parent.notify_completed(value).await,
                            Err(_) => parent.notify_failed(cause),
                        },
                        // Handler did not complete: restore the original fault.
                        _ => parent.notify_failed(cause),
                    }
                }
                _ => parent.notify_cancelled(),
            }
        });
        Ok(())
    }

    async fn stop_operation(&self, _op: &AsyncOp<T>) {
        let handler = relock(&self.handler).clone();
        match handler {
            Some(handler) => handler.cancel().await,
            None => self.target.cancel().await,
        }
    }
}

//! # Closure-backed operations.
//!
//! [`FnOp`] turns a plain async closure into an [`AsyncOp`]. The closure
//! receives a [`CancellationToken`] and must check it cooperatively; its
//! return value maps onto the state machine:
//!
//! - `Ok(value)` → `Completed` with that result,
//! - `Err(OpError::Stopped)` → `Cancelled` (the cooperative-cancel
//!   sentinel; nothing is surfaced to observers),
//! - any other `Err` → `Failed` with that cause.
//!
//! Cancellation cancels the token by default; a custom canceler closure can
//! be supplied and is invoked instead.
//!
//! # Example
//! ```no_run
//! use opvisor::{FnOp, OpError};
//! use tokio_util::sync::CancellationToken;
//!
//! let op = FnOp::new("fetch", |ctx: CancellationToken| async move {
//!     if ctx.is_cancelled() {
//!         return Err(OpError::Stopped);
//!     }
//!     Ok::<_, OpError>(42u32)
//! });
//! ```

use std::borrow::Cow;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::OpError;
use crate::op::core::{AsyncOp, Operate, OpResult};
use crate::relock;

const LOG_TARGET: &str = "ASYNC.RUNNABLE";

type Canceler = Arc<dyn Fn() + Send + Sync>;

/// Factory for closure-backed operations.
pub struct FnOp;

impl FnOp {
    /// Wraps an async closure as an operation. The default canceler cancels
    /// the closure's token.
    pub fn new<T, F, Fut>(name: impl Into<Cow<'static, str>>, func: F) -> AsyncOp<T>
    where
        T: OpResult,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, OpError>> + Send + 'static,
    {
        Self::build(name, func, None)
    }

    /// Like [`new`](Self::new), but cancellation invokes the given closure
    /// instead of cancelling the token.
    pub fn with_canceler<T, F, Fut>(
        name: impl Into<Cow<'static, str>>,
        func: F,
        canceler: impl Fn() + Send + Sync + 'static,
    ) -> AsyncOp<T>
    where
        T: OpResult,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, OpError>> + Send + 'static,
    {
        Self::build(name, func, Some(Arc::new(canceler)))
    }

    fn build<T, F, Fut>(
        name: impl Into<Cow<'static, str>>,
        func: F,
        canceler: Option<Canceler>,
    ) -> AsyncOp<T>
    where
        T: OpResult,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, OpError>> + Send + 'static,
    {
        let body = FnBody {
            func: Mutex::new(Some(func)),
            token: CancellationToken::new(),
            canceler,
            _marker: PhantomData,
        };
        AsyncOp::with_target(name, Arc::new(body), LOG_TARGET)
    }
}

struct FnBody<T, F, Fut>
where
    T: OpResult,
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, OpError>> + Send + 'static,
{
    /// The body closure; taken on the first (and only) start.
    func: Mutex<Option<F>>,
    token: CancellationToken,
    canceler: Option<Canceler>,
    _marker: PhantomData<fn() -> (T, Fut)>,
}

#[async_trait]
impl<T, F, Fut> Operate<T> for FnBody<T, F, Fut>
where
    T: OpResult,
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, OpError>> + Send + 'static,
{
    async fn start_operation(&self, op: &AsyncOp<T>) -> Result<(), OpError> {
        let fut = {
            let mut slot = relock(&self.func);
            match slot.take() {
                Some(func) => func(self.token.clone()),
                None => {
                    return Err(OpError::IllegalState(format!(
                        "body already consumed: {}",
                        op.name()
                    )))
                }
            }
        };

        let op = op.clone();
        tokio::spawn(async move {
            op.notify_started();
            match fut.await {
                Ok(value) => op.notify_completed(value).await,
                Err(fault) if fault.is_stopped() => op.notify_cancelled(),
                Err(fault) => op.notify_failed(fault),
            }
        });
        Ok(())
    }

    async fn stop_operation(&self, op: &AsyncOp<T>) {
        log::debug!(target: LOG_TARGET, "interrupting worker: op={}", op.name());
        match &self.canceler {
            Some(canceler) => canceler(),
            None => self.token.cancel(),
        }
    }
}

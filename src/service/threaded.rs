//! # Services backed by a long-running worker task.
//!
//! [`ThreadedService`] wraps an async body as a [`Service`]: `start` spawns
//! the body on a worker task and blocks until the worker signals that it is
//! running (or failed); `stop` requests cooperative termination and waits
//! for the worker to exit.
//!
//! ## Start signalling
//! By default the service counts as running as soon as the worker begins.
//! With *manual start notification*
//! ([`with_manual_start`](ThreadedService::with_manual_start)) the body
//! must call [`ServiceContext::notify_started`] once its prelude
//! succeeded; an error before that signal surfaces from `start`, an error
//! after it routes through `notify_failed`.
//!
//! ## Cooperative stop
//! The body observes [`ServiceContext::is_stop_pending`] (or awaits
//! [`ServiceContext::cancelled`]) and returns promptly. A body returning
//! `Ok` on its own (outside `stop`) routes through `notify_interrupted`.

use std::borrow::Cow;
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::ServiceError;
use crate::relock;
use crate::service::core::{Service, ServiceBody};

/// Worker lifecycle, tracked separately from the service phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WorkerPhase {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

/// Handle passed to a threaded service body.
#[derive(Clone)]
pub struct ServiceContext {
    token: CancellationToken,
    phase_tx: watch::Sender<WorkerPhase>,
    manual_start: bool,
}

impl ServiceContext {
    /// Signals that the body's start prelude succeeded. Only meaningful
    /// with manual start notification; otherwise a no-op.
    pub fn notify_started(&self) {
        if self.manual_start {
            self.phase_tx.send_if_modified(|p| {
                if *p == WorkerPhase::Starting {
                    *p = WorkerPhase::Running;
                    true
                } else {
                    false
                }
            });
        }
    }

    /// `true` once a stop was requested; the body should return promptly.
    pub fn is_stop_pending(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once a stop was requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// The underlying cancellation token, for `select!`-style bodies.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Per-start worker plumbing.
#[derive(Clone)]
struct WorkerRt {
    token: CancellationToken,
    phase_tx: watch::Sender<WorkerPhase>,
    fault: Arc<Mutex<Option<ServiceError>>>,
}

/// Factory for worker-backed services.
pub struct ThreadedService;

impl ThreadedService {
    /// Wraps an async body as a service. The service counts as running as
    /// soon as the worker begins.
    pub fn from_fn<F, Fut>(name: impl Into<Cow<'static, str>>, func: F) -> Service
    where
        F: FnMut(ServiceContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ServiceError>> + Send + 'static,
    {
        Self::build(name, func, false)
    }

    /// Like [`from_fn`](Self::from_fn), but the body must call
    /// [`ServiceContext::notify_started`] once its prelude succeeded;
    /// `start` blocks until then.
    pub fn with_manual_start<F, Fut>(name: impl Into<Cow<'static, str>>, func: F) -> Service
    where
        F: FnMut(ServiceContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ServiceError>> + Send + 'static,
    {
        Self::build(name, func, true)
    }

    /// Builds and immediately starts a worker-backed service.
    pub async fn run<F, Fut>(
        name: impl Into<Cow<'static, str>>,
        func: F,
    ) -> Result<Service, ServiceError>
    where
        F: FnMut(ServiceContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ServiceError>> + Send + 'static,
    {
        let service = Self::from_fn(name, func);
        service.start().await?;
        Ok(service)
    }

    fn build<F, Fut>(name: impl Into<Cow<'static, str>>, func: F, manual_start: bool) -> Service
    where
        F: FnMut(ServiceContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ServiceError>> + Send + 'static,
    {
        let body = ThreadedBody {
            func: Mutex::new(func),
            manual_start,
            rt: Mutex::new(None),
        };
        Service::with_target(name, Arc::new(body), "STARTABLE")
    }
}

struct ThreadedBody<F> {
    /// The body closure; invoked once per start cycle.
    func: Mutex<F>,
    manual_start: bool,
    /// Plumbing of the current start cycle, if any.
    rt: Mutex<Option<WorkerRt>>,
}

#[async_trait]
impl<F, Fut> ServiceBody for ThreadedBody<F>
where
    F: FnMut(ServiceContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), ServiceError>> + Send + 'static,
{
    async fn start_service(&self, service: &Service) -> Result<(), ServiceError> {
        let (phase_tx, mut phase_rx) = watch::channel(WorkerPhase::Starting);
        let token = CancellationToken::new();
        let fault = Arc::new(Mutex::new(None));
        *relock(&self.rt) = Some(WorkerRt {
            token: token.clone(),
            phase_tx: phase_tx.clone(),
            fault: Arc::clone(&fault),
        });

        let ctx = ServiceContext {
            token,
            phase_tx: phase_tx.clone(),
            manual_start: self.manual_start,
        };
        let fut = {
            let mut func = relock(&self.func);
            (*func)(ctx)
        };

        let manual_start = self.manual_start;
        let worker_tx = phase_tx;
        let worker_fault = Arc::clone(&fault);
        let svc = service.clone();
        tokio::spawn(async move {
            if !manual_start {
                worker_tx.send_if_modified(|p| {
                    if *p == WorkerPhase::Starting {
                        *p = WorkerPhase::Running;
                        true
                    } else {
                        false
                    }
                });
            }

            match fut.await {
                Ok(()) => {
                    let _ = worker_tx.send(WorkerPhase::Stopped);
                    svc.notify_interrupted().await;
                }
                Err(cause) => {
                    // Only this task moves the phase past Starting once the
                    // body returned, so the read below cannot race a start
                    // signal.
                    let before_start_signal = *worker_tx.borrow() == WorkerPhase::Starting;
                    if before_start_signal {
                        // The fault must be in place before the Failed
                        // signal wakes the pending start call.
                        *relock(&worker_fault) = Some(cause);
                        let _ = worker_tx.send(WorkerPhase::Failed);
                    } else {
                        let _ = worker_tx.send(WorkerPhase::Failed);
                        svc.notify_failed(cause).await;
                    }
                }
            }
        });

        // Block until the worker signalled running (or failed first).
        let _ = phase_rx.wait_for(|p| *p != WorkerPhase::Starting).await;
        let result = match *phase_rx.borrow() {
            WorkerPhase::Failed => Err(relock(&fault)
                .take()
                .unwrap_or_else(|| ServiceError::failed("worker failed during start"))),
            _ => Ok(()),
        };
        result
    }

    async fn stop_service(&self, _service: &Service) -> Result<(), ServiceError> {
        let Some(rt) = relock(&self.rt).clone() else {
            return Ok(());
        };
        {
            let current = *rt.phase_tx.borrow();
            if matches!(current, WorkerPhase::Stopped | WorkerPhase::Failed) {
                return Ok(());
            }
        }

        rt.phase_tx.send_if_modified(|p| {
            if *p == WorkerPhase::Running {
                *p = WorkerPhase::Stopping;
                true
            } else {
                false
            }
        });
        rt.token.cancel();

        let mut rx = rt.phase_tx.subscribe();
        let _ = rx
            .wait_for(|p| matches!(p, WorkerPhase::Stopped | WorkerPhase::Failed))
            .await;
        Ok(())
    }
}

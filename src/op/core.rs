//! # The asynchronous operation state machine.
//!
//! [`AsyncOp`] is a one-shot, cancellable computation with the public states
//! `NotStarted → Running → {Completed, Failed, Cancelled}` and a ten-phase
//! internal machine that tolerates out-of-order notifications.
//!
//! ## Architecture
//! ```text
//! start()
//!   NotStarted ──► Scheduling ──► (scheduler.submit / direct permit)
//!                                    │
//! permit_to_start()                  ▼
//!   Scheduling ──► Starting ──► body.start_operation()   (lock released)
//!                                    │
//! notify_started()                   ▼
//!   Starting ──► Running ──► notify_completed / notify_failed /
//!                            cancel ──► Cancelling ──► Cancelled
//! ```
//!
//! ## Rules
//! - Hooks ([`Operate::start_operation`], [`Operate::stop_operation`]) are
//!   always invoked **without** the state lock held.
//! - Once terminal, the state never changes; redundant terminal
//!   notifications are logged at `debug` and ignored.
//! - `cancel` is safe in any state, any number of times, and never errors.
//!   Cancelling before the body started skips the stop hook entirely.
//! - A completion notification arriving **before** the started notification
//!   waits up to [`RECONCILE_WINDOW`] for it, then force-transitions to
//!   `Running` (with a `warn`), so observers always see `Running` before
//!   the terminal event.
//! - Events are enqueued to listener queues while the state lock is held,
//!   which makes the per-operation event order total.

use std::borrow::Cow;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::OpError;
use crate::events::listeners::{OpListener, OpListeners};
use crate::events::{ListenerId, OpEvent};
use crate::op::{OpPhase, OpState};
use crate::relock;
use crate::sched::OpScheduler;

/// How long a completion notification waits for a tardy started
/// notification before the framework reconciles by force-transitioning to
/// `Running`. A constant of the design; deliberately not configurable.
pub(crate) const RECONCILE_WINDOW: Duration = Duration::from_secs(3);

/// Marker bound for operation result types.
pub trait OpResult: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> OpResult for T {}

/// Behavior of an operation: the two hooks driven by the state machine.
///
/// Implementations receive the operation handle so the start prelude can
/// spawn work that later reports back through the `notify_*` methods.
#[async_trait]
pub trait Operate<T: OpResult>: Send + Sync + 'static {
    /// Start prelude. Invoked once the operation is permitted to start,
    /// without the state lock held. The implementation (or work it spawns)
    /// must eventually call [`AsyncOp::notify_started`] and one of the
    /// terminal notifications. An error here fails the operation
    /// asynchronously.
    async fn start_operation(&self, op: &AsyncOp<T>) -> Result<(), OpError>;

    /// Cancellation request. Invoked from [`AsyncOp::cancel`] when the body
    /// is already running, without the state lock held. Best-effort: it may
    /// return before the body actually stopped.
    async fn stop_operation(&self, op: &AsyncOp<T>);
}

struct OpShared<T> {
    phase: OpPhase,
    result: Option<T>,
    fault: Option<OpError>,
    /// Whether `Running` was ever reached; drives listener catch-up.
    ever_ran: bool,
}

pub(crate) struct OpCore<T: OpResult> {
    name: Arc<str>,
    log_target: &'static str,
    body: Arc<dyn Operate<T>>,
    shared: Mutex<OpShared<T>>,
    phase_tx: watch::Sender<OpPhase>,
    listeners: OpListeners<T>,
    scheduler: Mutex<Option<Arc<dyn OpScheduler>>>,
}

/// A one-shot, cancellable asynchronous operation.
///
/// `AsyncOp` is a cheap clonable handle over shared state, like the
/// `Arc`-backed task handles elsewhere in the crate. The result type `T`
/// must be `Clone` so late readers can still obtain it.
pub struct AsyncOp<T: OpResult> {
    core: Arc<OpCore<T>>,
}

impl<T: OpResult> Clone for AsyncOp<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: OpResult> std::fmt::Debug for AsyncOp<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AsyncOp[{}, {:?}]", self.core.name, self.phase())
    }
}

impl<T: OpResult> std::fmt::Display for AsyncOp<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{:?}]", self.core.name, self.state())
    }
}

impl<T: OpResult> AsyncOp<T> {
    /// Creates an operation around the given body.
    pub fn new(name: impl Into<Cow<'static, str>>, body: impl Operate<T>) -> Self {
        Self::with_target(name, Arc::new(body), "AOP")
    }

    pub(crate) fn with_target(
        name: impl Into<Cow<'static, str>>,
        body: Arc<dyn Operate<T>>,
        log_target: &'static str,
    ) -> Self {
        let name: Arc<str> = Arc::from(name.into().as_ref());
        let (phase_tx, _rx) = watch::channel(OpPhase::NotStarted);
        Self {
            core: Arc::new(OpCore {
                name,
                log_target,
                body,
                shared: Mutex::new(OpShared {
                    phase: OpPhase::NotStarted,
                    result: None,
                    fault: None,
                    ever_ran: false,
                }),
                phase_tx,
                listeners: OpListeners::new(),
                scheduler: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn from_core(core: Arc<OpCore<T>>) -> Self {
        Self { core }
    }

    /// Stable, human-readable operation name.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Attaches an operation scheduler; `start` will submit to it instead
    /// of permitting the start directly.
    pub fn set_scheduler(&self, scheduler: Arc<dyn OpScheduler>) {
        *relock(&self.core.scheduler) = Some(scheduler);
    }

    /// Returns a type-erased control handle for this operation.
    pub fn erased(&self) -> OpRef {
        Arc::new(self.clone())
    }

    /// Public state of the operation.
    pub fn state(&self) -> OpState {
        self.phase().public()
    }

    /// Fine-grained internal phase.
    pub fn phase(&self) -> OpPhase {
        relock(&self.core.shared).phase
    }

    /// Subscribes to phase transitions.
    pub fn watch_phase(&self) -> watch::Receiver<OpPhase> {
        self.core.phase_tx.subscribe()
    }

    /// `true` while the public state is `Running`.
    pub fn is_running(&self) -> bool {
        self.state() == OpState::Running
    }

    /// `true` once a terminal state was reached.
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// `true` when the operation completed successfully.
    pub fn is_completed(&self) -> bool {
        self.state() == OpState::Completed
    }

    /// `true` when the operation was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state() == OpState::Cancelled
    }

    /// `true` when the operation failed.
    pub fn is_failed(&self) -> bool {
        self.state() == OpState::Failed
    }

    /// Whether the operation ever reached `Running`.
    pub fn ever_ran(&self) -> bool {
        relock(&self.core.shared).ever_ran
    }

    /// Starts the operation.
    ///
    /// With a scheduler attached the operation is submitted and starts when
    /// the scheduler permits it; otherwise the start is permitted directly.
    /// Calling `start` on an operation that was cancelled before ever
    /// starting is an idempotent no-op.
    ///
    /// # Errors
    /// [`OpError::IllegalState`] when already started,
    /// [`OpError::Rejected`] when the scheduler refuses the submission.
    pub async fn start(&self) -> Result<(), OpError> {
        let scheduler = {
            let mut sh = relock(&self.core.shared);
            match sh.phase {
                // Cancelled before start: ignore.
                OpPhase::Cancelled => return Ok(()),
                OpPhase::NotStarted => self.set_phase(&mut sh, OpPhase::Scheduling),
                other => {
                    return Err(OpError::IllegalState(format!(
                        "cannot start {}: phase={other:?}",
                        self.core.name
                    )))
                }
            }
            relock(&self.core.scheduler).clone()
        };

        match scheduler {
            Some(scheduler) => {
                // The lock is released around the submission.
                match scheduler.submit(self.erased()).await {
                    Ok(()) => Ok(()),
                    Err(fault) => {
                        let rejected = OpError::Rejected {
                            reason: fault.to_string(),
                        };
                        let mut sh = relock(&self.core.shared);
                        sh.fault = Some(rejected.clone());
                        self.set_phase(&mut sh, OpPhase::Failed);
                        drop(sh);
                        log::warn!(
                            target: self.core.log_target,
                            "submit rejected: op={}, cause={fault}",
                            self
                        );
                        Err(rejected)
                    }
                }
            }
            None => self.permit_to_start().await.map(|_| ()),
        }
    }

    /// Scheduler handshake: authorizes a submitted operation to leave
    /// `Scheduling`. Returns `false` when the operation was cancelled in the
    /// meantime (the scheduler should skip it).
    pub async fn permit_to_start(&self) -> Result<bool, OpError> {
        {
            let mut sh = relock(&self.core.shared);
            log::debug!(
                target: self.core.log_target,
                "starting: op={}, phase={:?}",
                self.core.name,
                sh.phase
            );
            match sh.phase {
                OpPhase::Scheduling => self.set_phase(&mut sh, OpPhase::Starting),
                OpPhase::Cancelled => return Ok(false),
                p if p > OpPhase::Running => {
                    self.set_phase(&mut sh, OpPhase::Cancelled);
                    return Ok(false);
                }
                other => {
                    return Err(OpError::IllegalState(format!(
                        "cannot permit {}: phase={other:?}",
                        self.core.name
                    )))
                }
            }
        }

        if let Err(fault) = self.core.body.start_operation(self).await {
            log::warn!(
                target: self.core.log_target,
                "fails to start: op={}, cause={fault}",
                self
            );
            let this = self.clone();
            tokio::spawn(async move {
                this.notify_failed(fault);
            });
        }
        Ok(true)
    }

    /// Cancels the operation.
    ///
    /// Safe to call in every state, any number of times. Before the body
    /// started the operation transitions straight to `Cancelled` without
    /// invoking the stop hook; while running, the stop hook is invoked and
    /// the operation settles in `Cancelled` unless it reached another
    /// terminal state first. The method may return before the terminal
    /// state is reached; use [`wait_for_finished`](Self::wait_for_finished)
    /// to await it.
    pub async fn cancel(&self) {
        let invoke_stop = {
            let mut sh = relock(&self.core.shared);
            log::debug!(
                target: self.core.log_target,
                "cancelling: op={}, phase={:?}",
                self.core.name,
                sh.phase
            );
            if sh.phase > OpPhase::Running {
                // Terminal, or a cancellation is already in flight.
                return;
            }
            match sh.phase {
                OpPhase::NotStarted | OpPhase::Scheduling | OpPhase::Starting => {
                    // The body never started; skip the stop hook.
                    self.set_phase(&mut sh, OpPhase::Cancelled);
                    self.emit(&sh, OpState::Cancelled);
                    false
                }
                OpPhase::Running => {
                    self.set_phase(&mut sh, OpPhase::Cancelling);
                    true
                }
                _ => unreachable!("phases above Running are handled by the guard"),
            }
        };

        if invoke_stop {
            self.core.body.stop_operation(self).await;

            let mut sh = relock(&self.core.shared);
            if sh.phase == OpPhase::Cancelling {
                self.set_phase(&mut sh, OpPhase::Cancelled);
                self.emit(&sh, OpState::Cancelled);
            }
        }
    }

    /// Signals that the start prelude completed and the body is running.
    ///
    /// Ignored when a terminal state was reached first; preserved (the
    /// pending cancellation proceeds) in `DelayedCancelling`.
    pub fn notify_started(&self) -> OpState {
        let mut sh = relock(&self.core.shared);
        match sh.phase {
            OpPhase::Starting => {
                sh.ever_ran = true;
                self.set_phase(&mut sh, OpPhase::Running);
            }
            OpPhase::DelayedCancelling => {
                sh.ever_ran = true;
            }
            OpPhase::Completed | OpPhase::Cancelled | OpPhase::Failed | OpPhase::CancelPended => {
                log::debug!(
                    target: self.core.log_target,
                    "started notification but already finished: op={}",
                    self.core.name
                );
                return sh.phase.public();
            }
            other => {
                log::error!(
                    target: self.core.log_target,
                    "unexpected started notification: op={}, phase={other:?}",
                    self.core.name
                );
                return sh.phase.public();
            }
        }
        self.emit(&sh, OpState::Running);
        let state = sh.phase.public();
        drop(sh);

        log::debug!(target: self.core.log_target, "started: op={}", self.core.name);
        state
    }

    /// Signals successful completion with a result.
    ///
    /// May legitimately arrive before the started notification (a very
    /// short computation): the call waits up to the reconciliation window
    /// for it and then forces the `Running` transition so observers see
    /// `{Running, Completed}` in order. Redundant notifications after a
    /// terminal state are ignored.
    pub async fn notify_completed(&self, result: T) {
        let starting = relock(&self.core.shared).phase == OpPhase::Starting;
        if starting {
            self.wait_started_notification().await;
        }

        {
            let mut sh = relock(&self.core.shared);
            match sh.phase {
                OpPhase::Running | OpPhase::Cancelling => {
                    sh.result = Some(result);
                    self.set_phase(&mut sh, OpPhase::Completed);
                    self.emit(&sh, OpState::Completed);
                }
                OpPhase::Completed | OpPhase::Failed => {
                    log::debug!(
                        target: self.core.log_target,
                        "duplicate completed notification ignored: op={}, phase={:?}",
                        self.core.name,
                        sh.phase
                    );
                    return;
                }
                OpPhase::Cancelled | OpPhase::CancelPended => return,
                other => {
                    log::error!(
                        target: self.core.log_target,
                        "unexpected completed notification: op={}, phase={other:?}",
                        self.core.name
                    );
                    return;
                }
            }
        }

        log::info!(target: self.core.log_target, "completed: op={}", self.core.name);
    }

    /// Signals cancellation of the body. Ignored when already cancelled.
    pub fn notify_cancelled(&self) {
        {
            let mut sh = relock(&self.core.shared);
            match sh.phase {
                OpPhase::Starting
                | OpPhase::Running
                | OpPhase::Cancelling
                | OpPhase::DelayedCancelling => {
                    self.set_phase(&mut sh, OpPhase::Cancelled);
                    self.emit(&sh, OpState::Cancelled);
                }
                OpPhase::Cancelled => return,
                other => {
                    log::error!(
                        target: self.core.log_target,
                        "unexpected cancelled notification: op={}, phase={other:?}",
                        self.core.name
                    );
                    return;
                }
            }
        }

        log::info!(target: self.core.log_target, "cancelled: op={}", self.core.name);
    }

    /// Signals failure of the body with a cause. Ignored when a terminal
    /// state was reached first.
    pub fn notify_failed(&self, cause: OpError) {
        {
            let mut sh = relock(&self.core.shared);
            match sh.phase {
                OpPhase::Running | OpPhase::Cancelling | OpPhase::Starting => {
                    sh.fault = Some(cause.clone());
                    self.set_phase(&mut sh, OpPhase::Failed);
                    self.emit(&sh, OpState::Failed);
                }
                OpPhase::Completed | OpPhase::Failed => {
                    log::debug!(
                        target: self.core.log_target,
                        "late failed notification ignored: op={}, phase={:?}",
                        self.core.name,
                        sh.phase
                    );
                    return;
                }
                OpPhase::Cancelled | OpPhase::CancelPended => return,
                other => {
                    log::error!(
                        target: self.core.log_target,
                        "unexpected failed notification: op={}, phase={other:?}",
                        self.core.name
                    );
                    return;
                }
            }
        }

        log::info!(
            target: self.core.log_target,
            "failed: op={}, cause={cause}",
            self.core.name
        );
    }

    /// Waits until the operation has started (or finished before starting).
    pub async fn wait_for_started(&self) {
        let mut rx = self.watch_phase();
        let _ = rx.wait_for(|p| *p >= OpPhase::Running).await;
    }

    /// Like [`wait_for_started`](Self::wait_for_started), bounded by a
    /// deadline. Returns `false` on timeout.
    pub async fn wait_for_started_for(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_for_started())
            .await
            .is_ok()
    }

    /// Waits until the operation settled in a terminal state.
    pub async fn wait_for_finished(&self) {
        let mut rx = self.watch_phase();
        let _ = rx.wait_for(|p| p.is_settled()).await;
    }

    /// Like [`wait_for_finished`](Self::wait_for_finished), bounded by a
    /// deadline. Returns `false` on timeout.
    pub async fn wait_for_finished_for(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_for_finished())
            .await
            .is_ok()
    }

    /// The result of a completed operation.
    ///
    /// # Errors
    /// [`OpError::IllegalState`] unless the state is `Completed`.
    pub fn result(&self) -> Result<T, OpError> {
        let sh = relock(&self.core.shared);
        if sh.phase == OpPhase::Completed {
            sh.result.clone().ok_or_else(|| {
                OpError::IllegalState(format!("completed without result: {}", self.core.name))
            })
        } else {
            Err(OpError::IllegalState(format!(
                "not completed: op={}, phase={:?}",
                self.core.name, sh.phase
            )))
        }
    }

    /// The failure cause; `None` unless the state is `Failed`.
    pub fn failure_cause(&self) -> Option<OpError> {
        let sh = relock(&self.core.shared);
        if sh.phase == OpPhase::Failed {
            sh.fault.clone()
        } else {
            None
        }
    }

    /// Registers a state-change listener.
    ///
    /// A listener added after the operation already reached `Running` (or a
    /// terminal state) immediately receives the synthesized `Running` event
    /// (if the operation ever ran) followed by the terminal event.
    pub fn add_listener(&self, listener: OpListener<T>) -> ListenerId {
        let sh = relock(&self.core.shared);
        let mut catchup = Vec::new();
        if sh.ever_ran && sh.phase >= OpPhase::Running {
            catchup.push(OpEvent::new(self.core.name.clone(), OpState::Running));
        }
        if sh.phase.is_settled() {
            catchup.push(OpEvent::new(self.core.name.clone(), sh.phase.public()));
        }
        self.core
            .listeners
            .add(Arc::downgrade(&self.core), listener, catchup)
    }

    /// Deregisters a listener; events already queued to it still arrive.
    pub fn remove_listener(&self, id: ListenerId) {
        self.core.listeners.remove(id);
    }

    fn set_phase(&self, sh: &mut OpShared<T>, phase: OpPhase) {
        sh.phase = phase;
        let _ = self.core.phase_tx.send(phase);
    }

    /// Enqueues a state-change event. Requires the state lock to be held
    /// (the guard parameter enforces it), which yields the per-operation
    /// total event order.
    fn emit(&self, _guard: &OpShared<T>, to: OpState) {
        self.core
            .listeners
            .emit(&OpEvent::new(self.core.name.clone(), to));
    }

    /// Bounded wait for the started notification that should precede a
    /// completion. On expiry the state is force-transitioned to `Running`.
    async fn wait_started_notification(&self) {
        let mut rx = self.watch_phase();
        let waited =
            tokio::time::timeout(RECONCILE_WINDOW, rx.wait_for(|p| *p >= OpPhase::Running)).await;
        if waited.is_err() {
            let mut sh = relock(&self.core.shared);
            if sh.phase == OpPhase::Starting {
                log::warn!(
                    target: self.core.log_target,
                    "started notification missing for {:?}; forcing RUNNING: op={}",
                    RECONCILE_WINDOW,
                    self.core.name
                );
                sh.ever_ran = true;
                self.set_phase(&mut sh, OpPhase::Running);
                self.emit(&sh, OpState::Running);
            }
        }
    }
}

/// Type-erased control handle over an operation.
///
/// Schedulers and heterogeneous combinators hold operations through this
/// trait: the permit-to-start handshake and cancellation are control-plane
/// concerns and never touch the typed result.
#[async_trait]
pub trait OpHandle: Send + Sync + 'static {
    /// Stable operation name.
    fn name(&self) -> &str;

    /// Public state.
    fn state(&self) -> OpState;

    /// Fine-grained internal phase.
    fn phase(&self) -> OpPhase;

    /// Whether the operation ever reached `Running`.
    fn ever_ran(&self) -> bool;

    /// Subscribes to phase transitions.
    fn watch_phase(&self) -> watch::Receiver<OpPhase>;

    /// See [`AsyncOp::start`].
    async fn start(&self) -> Result<(), OpError>;

    /// See [`AsyncOp::permit_to_start`].
    async fn permit_to_start(&self) -> Result<bool, OpError>;

    /// See [`AsyncOp::cancel`].
    async fn cancel(&self);

    /// See [`AsyncOp::wait_for_started`].
    async fn wait_for_started(&self);

    /// See [`AsyncOp::wait_for_finished`].
    async fn wait_for_finished(&self);

    /// See [`AsyncOp::wait_for_finished_for`].
    async fn wait_for_finished_for(&self, timeout: Duration) -> bool;

    /// The failure cause; `None` unless failed.
    fn failure_cause(&self) -> Option<OpError>;
}

/// Shared, type-erased operation handle.
pub type OpRef = Arc<dyn OpHandle>;

#[async_trait]
impl<T: OpResult> OpHandle for AsyncOp<T> {
    fn name(&self) -> &str {
        AsyncOp::name(self)
    }

    fn state(&self) -> OpState {
        AsyncOp::state(self)
    }

    fn phase(&self) -> OpPhase {
        AsyncOp::phase(self)
    }

    fn ever_ran(&self) -> bool {
        AsyncOp::ever_ran(self)
    }

    fn watch_phase(&self) -> watch::Receiver<OpPhase> {
        AsyncOp::watch_phase(self)
    }

    async fn start(&self) -> Result<(), OpError> {
        AsyncOp::start(self).await
    }

    async fn permit_to_start(&self) -> Result<bool, OpError> {
        AsyncOp::permit_to_start(self).await
    }

    async fn cancel(&self) {
        AsyncOp::cancel(self).await
    }

    async fn wait_for_started(&self) {
        AsyncOp::wait_for_started(self).await
    }

    async fn wait_for_finished(&self) {
        AsyncOp::wait_for_finished(self).await
    }

    async fn wait_for_finished_for(&self, timeout: Duration) -> bool {
        AsyncOp::wait_for_finished_for(self, timeout).await
    }

    fn failure_cause(&self) -> Option<OpError> {
        AsyncOp::failure_cause(self)
    }
}

/// Spawns a watcher that mirrors a child's started notification onto a
/// parent combinator. Fires only if the child actually reached `Running`
/// (a child cancelled before starting never ran).
pub(crate) fn mirror_started<T: OpResult>(child: OpRef, parent: AsyncOp<T>) {
    tokio::spawn(async move {
        let mut rx = child.watch_phase();
        let _ = rx.wait_for(|p| *p >= OpPhase::Running).await;
        if child.ever_ran() {
            parent.notify_started();
        }
    });
}

//! # opvisor
//!
//! **Opvisor** is an asynchronous lifecycle and operation framework: a
//! small set of abstractions and combinators for building long-running
//! activities with well-defined state machines, observable state-transition
//! events, and rich composition (sequencing, concurrency, timeouts,
//! deferral, repetition, backgrounding, fallback, chaining).
//!
//! ## Features
//!
//! | Area | Description | Key types / traits |
//! |------|-------------|--------------------|
//! | **Services** | Restartable `{Stopped, Running, Failed}` activities with start/stop hooks and failure recovery. | [`Service`], [`ServiceBody`], [`ThreadedService`] |
//! | **Operations** | One-shot cancellable computations with out-of-order-tolerant notifications. | [`AsyncOp`], [`Operate`], [`FnOp`] |
//! | **Schedulers** | Submit → permit-to-start arbitration: no-wait, queued, cancel-previous. | [`OpScheduler`], [`QueuedScheduler`] |
//! | **Combinators** | Compose operations and services while preserving the state-machine contract. | [`SequentialOp`], [`ConcurrentOp`], [`TimedOp`], [`CompositeService`], [`chain`] |
//! | **Events** | Typed state-change events, two listener shapes, per-entity total order. | [`ServiceEvent`], [`OpEvent`], [`EventSink`] |
//! | **Conditions** | Await a predicate over an entity's state. | [`ServiceCondition`], [`OpCondition`] |
//! | **Variables** | Observable cells with timestamped values and timed waits. | [`Variable`], [`ValueInfo`] |
//!
//! ```no_run
//! use opvisor::{FnOp, OpError, QueuedScheduler, OpState};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let scheduler = QueuedScheduler::new();
//!
//!     let op = FnOp::new("greet", |ctx: CancellationToken| async move {
//!         if ctx.is_cancelled() {
//!             return Err(OpError::Stopped);
//!         }
//!         println!("hello from an operation");
//!         Ok::<_, OpError>(())
//!     });
//!     op.set_scheduler(scheduler);
//!
//!     op.start().await?;
//!     op.wait_for_finished().await;
//!     assert_eq!(op.state(), OpState::Completed);
//!     Ok(())
//! }
//! ```
//!
//! ## Concurrency model
//!
//! Every entity owns its own state lock and phase channel; there is no
//! global event loop. User hooks always run **without** the state lock
//! held. Listener callbacks are dispatched on per-listener worker tasks in
//! the order the transitions happened (per entity, the event order is
//! total). Cancellation is cooperative, threaded through bodies as a
//! [`tokio_util::sync::CancellationToken`].

mod condition;
mod error;
mod events;
mod op;
mod sched;
mod service;
mod variable;

pub use condition::{OpCondition, ServiceCondition};
pub use error::{OpError, ServiceError};
pub use events::{
    EventSink, ListenerId, OpEvent, OpListener, OpWatcher, ServiceEvent, ServiceListener,
    ServiceWatcher,
};
pub use op::{
    AsyncOp, BackgroundedOp, ConcurrentOp, DelayedOp, FnOp, IdleOp, NopOp, OnFaultOp, OpHandle,
    OpPhase, OpRef, OpResult, OpState, Operate, PeriodicOp, SequentialOp, TimedOp,
};
pub use sched::{
    CancellingScheduler, NoWaitScheduler, OpScheduler, QueuedScheduler, SchedulerWatcher,
};
pub use service::{
    chain, failure_dependency, ChainLink, CompositeService, ConcurrentService,
    ConcurrentServiceBuilder, FailureLink, Service, ServiceBody, ServiceContext, ServiceFacet,
    ServicePhase, ServiceState, ThreadedService,
};
pub use variable::{ValueInfo, Variable, VariableWatcher};

/// Locks a mutex, recovering the guard from a poisoned lock (state behind
/// these locks stays consistent across panics; the panic itself is handled
/// at the listener-dispatch boundary).
pub(crate) fn relock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

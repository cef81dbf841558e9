//! # Listener registration and dispatch.
//!
//! Two listener shapes are accepted for every entity, expressed as a tagged
//! enum instead of marker-interface introspection:
//!
//! - **Callback-style** — [`ServiceWatcher::on_state_changed`] for services,
//!   [`OpWatcher::on_started`] / [`OpWatcher::on_finished`] for operations.
//! - **Event-sink-style** — a single [`EventSink::on_event`] receiving the
//!   typed state-change event.
//!
//! ## Dispatch architecture
//! ```text
//! transition (state lock held)
//!     │
//!     ├──► [queue 1] ──► worker 1 ──► listener1
//!     ├──► [queue 2] ──► worker 2 ──► listener2
//!     └──► [queue N] ──► worker N ──► listenerN
//! ```
//!
//! ## Rules
//! - Events are enqueued while the entity's state lock is held, so every
//!   listener observes the same total order of transitions.
//! - Listener code runs on a dedicated worker task, never on the
//!   state-transition task; a slow listener delays only itself.
//! - A listener that panics is logged at `warn` and stays registered.
//! - Callback-style operation listeners deregister themselves after
//!   delivering the terminal event.
//! - A listener added after an operation already ran receives a synthesized
//!   `Running` event (if the operation was ever running) and the terminal
//!   event, in that order.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::mpsc;

use crate::events::{OpEvent, ServiceEvent};
use crate::op::core::OpCore;
use crate::op::{AsyncOp, OpResult, OpState};
use crate::relock;
use crate::service::core::ServiceCore;
use crate::service::{Service, ServiceState};

/// Opaque handle identifying a registered listener, used for removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Receives typed state-change events (the event-bus listener shape).
#[async_trait]
pub trait EventSink<E>: Send + Sync + 'static {
    /// Handles a single event.
    async fn on_event(&self, event: &E);

    /// Human-readable name (for logs).
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Callback-style listener of service state transitions.
#[async_trait]
pub trait ServiceWatcher: Send + Sync + 'static {
    /// Called for every `from → to` transition of the watched service.
    async fn on_state_changed(&self, service: &Service, from: ServiceState, to: ServiceState);
}

/// Callback-style listener of operation state transitions.
#[async_trait]
pub trait OpWatcher<T: OpResult>: Send + Sync + 'static {
    /// Called when the operation reaches `Running`.
    async fn on_started(&self, op: &AsyncOp<T>);

    /// Called once with the unique terminal state; the listener is
    /// deregistered afterwards.
    async fn on_finished(&self, op: &AsyncOp<T>, terminal: OpState);
}

/// A registered service listener, in either shape.
pub enum ServiceListener {
    /// Callback-style.
    Callback(Arc<dyn ServiceWatcher>),
    /// Event-sink-style.
    Sink(Arc<dyn EventSink<ServiceEvent>>),
}

/// A registered operation listener, in either shape.
pub enum OpListener<T: OpResult> {
    /// Callback-style (auto-deregisters after the terminal event).
    Callback(Arc<dyn OpWatcher<T>>),
    /// Event-sink-style.
    Sink(Arc<dyn EventSink<OpEvent>>),
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct Entry<E> {
    id: ListenerId,
    tx: mpsc::UnboundedSender<E>,
}

/// Per-service listener registry. Senders live in the service core; workers
/// hold only a weak back-reference, so dropping the service ends dispatch.
pub(crate) struct ServiceListeners {
    entries: Mutex<Vec<Entry<ServiceEvent>>>,
    next_id: AtomicU64,
}

impl ServiceListeners {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Registers a listener and spawns its dispatch worker.
    pub(crate) fn add(&self, source: Weak<ServiceCore>, listener: ServiceListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, AtomicOrdering::Relaxed));
        let (tx, mut rx) = mpsc::unbounded_channel::<ServiceEvent>();

        tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                let outcome = match &listener {
                    ServiceListener::Callback(cb) => {
                        let Some(core) = source.upgrade() else { break };
                        let service = Service::from_core(core);
                        AssertUnwindSafe(cb.on_state_changed(&service, ev.from, ev.to))
                            .catch_unwind()
                            .await
                    }
                    ServiceListener::Sink(sink) => {
                        AssertUnwindSafe(sink.on_event(&ev)).catch_unwind().await
                    }
                };
                if let Err(panic) = outcome {
                    log::warn!(
                        target: "STARTABLE",
                        "(ignored) service listener panicked: source={}, cause={}",
                        ev.source,
                        panic_message(panic)
                    );
                }
            }
        });

        relock(&self.entries).push(Entry { id, tx });
        id
    }

    /// Deregisters a listener; already-queued events are still delivered.
    pub(crate) fn remove(&self, id: ListenerId) {
        relock(&self.entries).retain(|e| e.id != id);
    }

    /// Enqueues an event to every listener. Called with the state lock held
    /// so that all queues observe the same order.
    pub(crate) fn emit(&self, event: &ServiceEvent) {
        relock(&self.entries).retain(|e| e.tx.send(event.clone()).is_ok());
    }
}

/// Per-operation listener registry (see [`ServiceListeners`]).
pub(crate) struct OpListeners<T: OpResult> {
    entries: Mutex<Vec<Entry<OpEvent>>>,
    next_id: AtomicU64,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: OpResult> OpListeners<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            _marker: std::marker::PhantomData,
        }
    }

    /// Registers a listener and spawns its dispatch worker. `catchup` holds
    /// the synthesized events owed to a late listener and is delivered ahead
    /// of anything emitted afterwards.
    pub(crate) fn add(
        &self,
        source: Weak<OpCore<T>>,
        listener: OpListener<T>,
        catchup: Vec<OpEvent>,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, AtomicOrdering::Relaxed));
        let (tx, mut rx) = mpsc::unbounded_channel::<OpEvent>();
        for ev in catchup {
            let _ = tx.send(ev);
        }

        tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                let terminal = ev.to.is_terminal();
                let outcome = match &listener {
                    OpListener::Callback(cb) => {
                        let Some(core) = source.upgrade() else { break };
                        let op = AsyncOp::from_core(core);
                        if ev.to == OpState::Running {
                            AssertUnwindSafe(cb.on_started(&op)).catch_unwind().await
                        } else if terminal {
                            AssertUnwindSafe(cb.on_finished(&op, ev.to)).catch_unwind().await
                        } else {
                            Ok(())
                        }
                    }
                    OpListener::Sink(sink) => {
                        AssertUnwindSafe(sink.on_event(&ev)).catch_unwind().await
                    }
                };
                if let Err(panic) = outcome {
                    log::warn!(
                        target: "AOP",
                        "(ignored) operation listener panicked: source={}, cause={}",
                        ev.source,
                        panic_message(panic)
                    );
                }
                if terminal && matches!(listener, OpListener::Callback(_)) {
                    break;
                }
            }
        });

        relock(&self.entries).push(Entry { id, tx });
        id
    }

    /// Deregisters a listener; already-queued events are still delivered.
    pub(crate) fn remove(&self, id: ListenerId) {
        relock(&self.entries).retain(|e| e.id != id);
    }

    /// Enqueues an event to every listener. Called with the state lock held
    /// so that all queues observe the same order.
    pub(crate) fn emit(&self, event: &OpEvent) {
        relock(&self.entries).retain(|e| e.tx.send(event.clone()).is_ok());
    }
}

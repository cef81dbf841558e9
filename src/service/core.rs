//! # The service state machine.
//!
//! [`Service`] models a restartable background activity with the public
//! states `Stopped ↔ Running → Failed → (Stopped | Running)` and a
//! six-phase internal machine. The behavior is supplied through a
//! [`ServiceBody`]: a start hook, a stop hook, and an overridable failure
//! handler that decides the recovered state.
//!
//! ## Rules
//! - Hooks always run **without** the state lock held.
//! - `start` is legal only from `Stopped`/`Failed`; anything else is an
//!   `IllegalState` error. A failing start hook records the cause, settles
//!   in `Failed`, emits `Stopped → Failed` and surfaces the error.
//! - `stop` outside `Running` is ignored (after waiting out any in-flight
//!   transient phase).
//! - `notify_failed` runs the failure handler outside the lock and maps the
//!   recovered state: `Running` = silent recovery (no event), `Stopped` =
//!   `Running → Stopped`, `Failed` = record cause + `Running → Failed`.
//!   Called from inside a start/stop hook it observes the transient phase
//!   and proceeds immediately; it only waits out a *concurrent* failure.
//! - Events are enqueued to listener queues while the state lock is held,
//!   so every observer sees the same total order of transitions (per
//!   service).

use std::borrow::Cow;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::ServiceError;
use crate::events::listeners::{ServiceListener, ServiceListeners};
use crate::events::{ListenerId, ServiceEvent};
use crate::relock;
use crate::service::{ServicePhase, ServiceState};

/// Behavior of a service: the hooks driven by the state machine.
#[async_trait]
pub trait ServiceBody: Send + Sync + 'static {
    /// Start hook. Runs without the state lock; on success the service
    /// transitions to `Running`, on error to `Failed` (and the error is
    /// surfaced from `start`).
    async fn start_service(&self, service: &Service) -> Result<(), ServiceError>;

    /// Stop hook. Runs without the state lock; on success the service
    /// transitions to `Stopped`, on error to `Failed`.
    async fn stop_service(&self, service: &Service) -> Result<(), ServiceError>;

    /// Failure policy invoked by [`Service::notify_failed`], returning the
    /// recovered state. The default stops the service quietly and declares
    /// it `Failed`.
    async fn handle_failure(&self, service: &Service, cause: &ServiceError) -> ServiceState {
        let _ = cause;
        let _ = self.stop_service(service).await;
        ServiceState::Failed
    }
}

struct SvcShared {
    phase: ServicePhase,
    fault: Option<ServiceError>,
}

pub(crate) struct ServiceCore {
    name: Arc<str>,
    log_target: &'static str,
    body: Arc<dyn ServiceBody>,
    shared: Mutex<SvcShared>,
    phase_tx: watch::Sender<ServicePhase>,
    listeners: ServiceListeners,
}

/// A restartable lifecycle entity with the states
/// `{Stopped, Running, Failed}`.
///
/// `Service` is a cheap clonable handle over shared state.
pub struct Service {
    core: Arc<ServiceCore>,
}

impl Clone for Service {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Service[{}, {:?}]", self.core.name, self.phase())
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{:?}]", self.core.name, self.state())
    }
}

impl Service {
    /// Creates a service around the given body.
    pub fn new(name: impl Into<Cow<'static, str>>, body: impl ServiceBody) -> Self {
        Self::with_target(name, Arc::new(body), "STARTABLE")
    }

    pub(crate) fn with_target(
        name: impl Into<Cow<'static, str>>,
        body: Arc<dyn ServiceBody>,
        log_target: &'static str,
    ) -> Self {
        let name: Arc<str> = Arc::from(name.into().as_ref());
        let (phase_tx, _rx) = watch::channel(ServicePhase::Stopped);
        Self {
            core: Arc::new(ServiceCore {
                name,
                log_target,
                body,
                shared: Mutex::new(SvcShared {
                    phase: ServicePhase::Stopped,
                    fault: None,
                }),
                phase_tx,
                listeners: ServiceListeners::new(),
            }),
        }
    }

    pub(crate) fn from_core(core: Arc<ServiceCore>) -> Self {
        Self { core }
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<ServiceCore> {
        Arc::downgrade(&self.core)
    }

    /// Stable, human-readable service name.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Public state of the service.
    pub fn state(&self) -> ServiceState {
        self.phase().public()
    }

    /// Fine-grained internal phase.
    pub fn phase(&self) -> ServicePhase {
        relock(&self.core.shared).phase
    }

    /// Subscribes to phase transitions.
    pub fn watch_phase(&self) -> watch::Receiver<ServicePhase> {
        self.core.phase_tx.subscribe()
    }

    /// `true` while the public state is `Running`.
    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }

    /// `true` while the public state is `Stopped`.
    pub fn is_stopped(&self) -> bool {
        self.state() == ServiceState::Stopped
    }

    /// `true` while the public state is `Failed`.
    pub fn is_failed(&self) -> bool {
        self.state() == ServiceState::Failed
    }

    /// The failure cause; `None` unless the public state is `Failed`.
    pub fn failure_cause(&self) -> Option<ServiceError> {
        let sh = relock(&self.core.shared);
        match sh.phase {
            ServicePhase::Failing | ServicePhase::Failed => sh.fault.clone(),
            _ => None,
        }
    }

    /// Starts the service.
    ///
    /// Legal from `Stopped` and `Failed`. Runs the start hook without the
    /// lock; on success the service is `Running` and `Stopped → Running`
    /// was emitted, on hook failure the service is `Failed`, the cause is
    /// recorded, `Stopped → Failed` was emitted and the error returns to
    /// the caller.
    ///
    /// # Errors
    /// [`ServiceError::IllegalState`] when not startable, or the start
    /// hook's error.
    pub async fn start(&self) -> Result<(), ServiceError> {
        {
            let mut sh = relock(&self.core.shared);
            match sh.phase {
                ServicePhase::Stopped | ServicePhase::Failed => {
                    self.set_phase(&mut sh, ServicePhase::Starting);
                }
                _ => {
                    return Err(ServiceError::IllegalState(format!(
                        "already started: {}",
                        self
                    )))
                }
            }
        }

        if let Err(fault) = self.core.body.start_service(self).await {
            {
                let mut sh = relock(&self.core.shared);
                sh.fault = Some(fault.clone());
                self.set_phase(&mut sh, ServicePhase::Failed);
                self.emit(&sh, ServiceState::Stopped, ServiceState::Failed);
            }
            log::warn!(
                target: self.core.log_target,
                "start failed: service={}, cause={fault}",
                self.core.name
            );
            return Err(fault);
        }

        let mut sh = relock(&self.core.shared);
        // The hook may have driven the machine elsewhere (e.g. reported a
        // failure); only a still-starting service becomes running.
        if sh.phase == ServicePhase::Starting {
            self.set_phase(&mut sh, ServicePhase::Running);
            self.emit(&sh, ServiceState::Stopped, ServiceState::Running);
        }
        Ok(())
    }

    /// Stops the service.
    ///
    /// Waits out any in-flight transient phase first; outside `Running`
    /// the call is then ignored. Runs the stop hook without the lock; on
    /// success the service is `Stopped` (`Running → Stopped` emitted), on
    /// hook failure it is `Failed` with the cause recorded.
    pub async fn stop(&self) {
        let mut rx = self.watch_phase();
        loop {
            {
                let mut sh = relock(&self.core.shared);
                match sh.phase {
                    ServicePhase::Stopped | ServicePhase::Failed => return,
                    ServicePhase::Running => {
                        self.set_phase(&mut sh, ServicePhase::Stopping);
                        break;
                    }
                    // Transient: wait for it to resolve.
                    _ => {}
                }
            }
            if rx.changed().await.is_err() {
                return;
            }
        }

        if let Err(fault) = self.core.body.stop_service(self).await {
            {
                let mut sh = relock(&self.core.shared);
                sh.fault = Some(fault.clone());
                self.set_phase(&mut sh, ServicePhase::Failed);
                self.emit(&sh, ServiceState::Running, ServiceState::Failed);
            }
            log::warn!(
                target: self.core.log_target,
                "stop raised a failure: service={}, cause={fault}",
                self.core.name
            );
            return;
        }

        let mut sh = relock(&self.core.shared);
        if sh.phase == ServicePhase::Stopping {
            self.set_phase(&mut sh, ServicePhase::Stopped);
            self.emit(&sh, ServiceState::Running, ServiceState::Stopped);
        }
    }

    /// Reports a runtime failure detected by the body.
    ///
    /// Ignored when already `Failed`. Transitions through `Failing`, runs
    /// the body's failure handler outside the lock, and maps the recovered
    /// state (`Running` = silent recovery, `Stopped` = stop with event,
    /// `Failed` = record cause with event).
    ///
    /// May be called from within a start/stop hook: the transient phase is
    /// taken over immediately rather than waited out (only a concurrent
    /// `Failing` blocks).
    pub async fn notify_failed(&self, cause: ServiceError) {
        let mut rx = self.watch_phase();
        loop {
            {
                let mut sh = relock(&self.core.shared);
                match sh.phase {
                    ServicePhase::Failed => return,
                    // Another failure is being handled; wait it out.
                    ServicePhase::Failing => {}
                    _ => {
                        self.set_phase(&mut sh, ServicePhase::Failing);
                        break;
                    }
                }
            }
            if rx.changed().await.is_err() {
                return;
            }
        }

        let recovered = self.core.body.handle_failure(self, &cause).await;

        let mut sh = relock(&self.core.shared);
        match recovered {
            ServiceState::Running => {
                // Silent recovery: no event.
                self.set_phase(&mut sh, ServicePhase::Running);
                drop(sh);
                log::info!(
                    target: self.core.log_target,
                    "failure recovered: service={}, failure={cause}",
                    self.core.name
                );
            }
            ServiceState::Stopped => {
                self.set_phase(&mut sh, ServicePhase::Stopped);
                self.emit(&sh, ServiceState::Running, ServiceState::Stopped);
                drop(sh);
                log::info!(
                    target: self.core.log_target,
                    "stopped due to failure: service={}, cause={cause}",
                    self.core.name
                );
            }
            ServiceState::Failed => {
                sh.fault = Some(cause.clone());
                self.set_phase(&mut sh, ServicePhase::Failed);
                self.emit(&sh, ServiceState::Running, ServiceState::Failed);
                drop(sh);
                log::info!(
                    target: self.core.log_target,
                    "failed: service={}, cause={cause}",
                    self.core.name
                );
            }
        }
    }

    /// Signals that the body's activity stopped on its own, outside `stop`.
    ///
    /// Waits out any transient phase; if then `Running`, transitions to
    /// `Stopped` and emits `Running → Stopped`. No stop hook is invoked —
    /// the activity is already gone.
    pub async fn notify_interrupted(&self) {
        let mut rx = self.watch_phase();
        loop {
            {
                let mut sh = relock(&self.core.shared);
                match sh.phase {
                    ServicePhase::Stopped | ServicePhase::Failed => return,
                    ServicePhase::Running => {
                        self.set_phase(&mut sh, ServicePhase::Stopped);
                        self.emit(&sh, ServiceState::Running, ServiceState::Stopped);
                        return;
                    }
                    _ => {}
                }
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Waits until the public state is `Stopped` or `Failed`.
    pub async fn wait_for_finished(&self) {
        let mut rx = self.watch_phase();
        let _ = rx
            .wait_for(|p| matches!(p, ServicePhase::Stopped | ServicePhase::Failed))
            .await;
    }

    /// Like [`wait_for_finished`](Self::wait_for_finished), bounded by a
    /// deadline. Returns `false` on timeout.
    pub async fn wait_for_finished_for(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_for_finished())
            .await
            .is_ok()
    }

    /// Registers a state-change listener.
    pub fn add_listener(&self, listener: ServiceListener) -> ListenerId {
        self.core
            .listeners
            .add(Arc::downgrade(&self.core), listener)
    }

    /// Deregisters a listener; events already queued to it still arrive.
    pub fn remove_listener(&self, id: ListenerId) {
        self.core.listeners.remove(id);
    }

    fn set_phase(&self, sh: &mut SvcShared, phase: ServicePhase) {
        sh.phase = phase;
        let _ = self.core.phase_tx.send(phase);
    }

    /// Enqueues a state-change event. Requires the state lock to be held
    /// (the guard parameter enforces it), which yields the per-service
    /// total event order.
    fn emit(&self, _guard: &SvcShared, from: ServiceState, to: ServiceState) {
        self.core
            .listeners
            .emit(&ServiceEvent::new(self.core.name.clone(), from, to));
    }
}

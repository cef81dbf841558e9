//! # Lifecycle dependencies between services.
//!
//! [`chain`] ties a follower's lifecycle to a leader: when the leader
//! starts running, the follower is started; when the leader stops, the
//! follower is stopped; when the leader fails, the follower is notified
//! failed with the same cause. [`failure_dependency`] is the one-way
//! failure-only subset.
//!
//! Both return a link guard: dropping it (or calling `unchain`)
//! unsubscribes from the leader, after which the follower is on its own.

use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::error::ServiceError;
use crate::events::listeners::ServiceListener;
use crate::events::{EventSink, ListenerId, ServiceEvent};
use crate::service::core::{Service, ServiceCore};
use crate::service::ServiceState;

const LOG_TARGET: &str = "STARTABLE.CHAIN";

/// Guard of a leader→follower lifecycle chain. Dropping it unsubscribes.
pub struct ChainLink {
    leader: Service,
    id: Option<ListenerId>,
}

impl ChainLink {
    /// Removes the chain; the follower no longer tracks the leader.
    pub fn unchain(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(id) = self.id.take() {
            self.leader.remove_listener(id);
        }
    }
}

impl Drop for ChainLink {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Ties `follower`'s lifecycle to `leader`: start on `Running`, stop on
/// `Stopped`, fail on `Failed`.
pub fn chain(leader: &Service, follower: &Service) -> ChainLink {
    let sink = ChainSink {
        leader: leader.downgrade(),
        follower: follower.clone(),
    };
    let id = leader.add_listener(ServiceListener::Sink(Arc::new(sink)));
    ChainLink {
        leader: leader.clone(),
        id: Some(id),
    }
}

struct ChainSink {
    leader: Weak<ServiceCore>,
    follower: Service,
}

#[async_trait]
impl EventSink<ServiceEvent> for ChainSink {
    async fn on_event(&self, event: &ServiceEvent) {
        match event.to {
            ServiceState::Running => {
                if let Err(fault) = self.follower.start().await {
                    log::warn!(
                        target: LOG_TARGET,
                        "failed to start chained service: follower={}, cause={fault}",
                        self.follower.name()
                    );
                }
            }
            ServiceState::Stopped => self.follower.stop().await,
            ServiceState::Failed => {
                let cause = self
                    .leader
                    .upgrade()
                    .map(Service::from_core)
                    .and_then(|leader| leader.failure_cause())
                    .unwrap_or_else(|| ServiceError::failed("chained leader failed"));
                self.follower.notify_failed(cause).await;
            }
        }
    }
}

/// Guard of a failure dependency. Dropping it unsubscribes.
pub struct FailureLink {
    dependee: Service,
    id: Option<ListenerId>,
}

impl FailureLink {
    /// Removes the dependency.
    pub fn remove(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(id) = self.id.take() {
            self.dependee.remove_listener(id);
        }
    }
}

impl Drop for FailureLink {
    fn drop(&mut self) {
        self.detach();
    }
}

/// One-way failure propagation: when `dependee` fails, `dependent` is
/// notified failed with the same cause.
pub fn failure_dependency(dependee: &Service, dependent: &Service) -> FailureLink {
    let sink = FailureSink {
        dependee: dependee.downgrade(),
        dependent: dependent.clone(),
    };
    let id = dependee.add_listener(ServiceListener::Sink(Arc::new(sink)));
    FailureLink {
        dependee: dependee.clone(),
        id: Some(id),
    }
}

struct FailureSink {
    dependee: Weak<ServiceCore>,
    dependent: Service,
}

#[async_trait]
impl EventSink<ServiceEvent> for FailureSink {
    async fn on_event(&self, event: &ServiceEvent) {
        if event.to == ServiceState::Failed {
            let cause = self
                .dependee
                .upgrade()
                .map(Service::from_core)
                .and_then(|dependee| dependee.failure_cause())
                .unwrap_or_else(|| ServiceError::failed("dependee failed"));
            self.dependent.notify_failed(cause).await;
        }
    }
}

//! # Composite service: all-or-nothing parallel membership.
//!
//! Starts all member services in parallel; if any fails to start, the
//! others are stopped again and the first failure surfaces from `start`.
//! While running, a member transitioning to `Failed` is propagated through
//! the parent's `notify_failed` (the default failure handler then stops
//! the remaining members), and a member stopping *unsolicited* makes the
//! parent stop itself.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use futures::future::join_all;

use crate::error::ServiceError;
use crate::events::listeners::ServiceListener;
use crate::events::{EventSink, ListenerId, ServiceEvent};
use crate::relock;
use crate::service::core::{Service, ServiceBody, ServiceCore};
use crate::service::ServiceState;

const LOG_TARGET: &str = "STARTABLE";

/// All-or-nothing parallel service combinator.
pub struct CompositeService;

impl CompositeService {
    /// Composes `members` into one service that starts and stops them in
    /// parallel.
    ///
    /// # Errors
    /// [`ServiceError::IllegalState`] when `members` is empty.
    pub fn new(members: Vec<Service>) -> Result<Service, ServiceError> {
        if members.is_empty() {
            return Err(ServiceError::IllegalState("no member services".into()));
        }
        let body = CompositeBody {
            members,
            stopping: Arc::new(AtomicBool::new(false)),
            links: Mutex::new(Vec::new()),
        };
        Ok(Service::with_target("composite", Arc::new(body), LOG_TARGET))
    }
}

struct CompositeBody {
    members: Vec<Service>,
    /// Set while the parent itself drives a stop, so member-stopped events
    /// are not mistaken for unsolicited exits.
    stopping: Arc<AtomicBool>,
    links: Mutex<Vec<(Service, ListenerId)>>,
}

#[async_trait]
impl ServiceBody for CompositeBody {
    async fn start_service(&self, service: &Service) -> Result<(), ServiceError> {
        self.stopping.store(false, AtomicOrdering::SeqCst);

        let results = join_all(self.members.iter().map(|m| m.start())).await;
        if let Some(fault) = results.into_iter().find_map(|r| r.err()) {
            log::warn!(
                target: LOG_TARGET,
                "member failed to start, rolling back: composite={}, cause={fault}",
                service.name()
            );
            join_all(self.members.iter().map(|m| m.stop())).await;
            return Err(fault);
        }

        let mut links = relock(&self.links);
        for member in &self.members {
            let sink = MemberSink {
                parent: service.downgrade(),
                member: member.downgrade(),
                stopping: Arc::clone(&self.stopping),
            };
            let id = member.add_listener(ServiceListener::Sink(Arc::new(sink)));
            links.push((member.clone(), id));
        }
        Ok(())
    }

    async fn stop_service(&self, _service: &Service) -> Result<(), ServiceError> {
        self.stopping.store(true, AtomicOrdering::SeqCst);
        {
            let mut links = relock(&self.links);
            for (member, id) in links.drain(..) {
                member.remove_listener(id);
            }
        }
        join_all(self.members.iter().map(|m| m.stop())).await;
        Ok(())
    }
}

/// Watches one member and feeds its terminal transitions back into the
/// parent. Holds only weak references: the combinator owns its children,
/// never the other way around.
struct MemberSink {
    parent: Weak<ServiceCore>,
    member: Weak<ServiceCore>,
    stopping: Arc<AtomicBool>,
}

#[async_trait]
impl EventSink<ServiceEvent> for MemberSink {
    async fn on_event(&self, event: &ServiceEvent) {
        let (Some(parent), Some(member)) = (self.parent.upgrade(), self.member.upgrade()) else {
            return;
        };
        let parent = Service::from_core(parent);
        let member = Service::from_core(member);

        match event.to {
            ServiceState::Failed => {
                let cause = member
                    .failure_cause()
                    .unwrap_or_else(|| ServiceError::failed("member failed"));
                parent.notify_failed(cause).await;
            }
            ServiceState::Stopped => {
                if !self.stopping.load(AtomicOrdering::SeqCst) && parent.is_running() {
                    log::info!(
                        target: LOG_TARGET,
                        "member stopped unsolicited, stopping composite: member={}",
                        member.name()
                    );
                    parent.stop().await;
                }
            }
            ServiceState::Running => {}
        }
    }
}

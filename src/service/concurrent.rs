//! # Concurrent service: fault-tolerant parallel membership.
//!
//! Starts and stops its members in parallel like
//! [`CompositeService`](crate::CompositeService), but tolerates partial
//! failure: a member that fails to start is logged and left behind (only
//! the degenerate all-members-failed start errors), member failures are
//! not propagated, and stop never rolls anything back.
//!
//! The [`ConcurrentServiceBuilder`] returns a [`ServiceFacet`]: an explicit
//! view that pairs the combinator with direct access to its members, for
//! callers that need a member-specific interface next to the service one.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;

use crate::error::ServiceError;
use crate::service::core::{Service, ServiceBody};

const LOG_TARGET: &str = "STARTABLE";

/// Fault-tolerant parallel service combinator.
pub struct ConcurrentService;

impl ConcurrentService {
    /// Composes `members` into one service that starts and stops them in
    /// parallel, tolerating partial failure.
    ///
    /// # Errors
    /// [`ServiceError::IllegalState`] when `members` is empty.
    pub fn new(members: Vec<Service>) -> Result<Service, ServiceError> {
        if members.is_empty() {
            return Err(ServiceError::IllegalState("no member services".into()));
        }
        let body = ConcurrentBody { members };
        Ok(Service::with_target("concurrent", Arc::new(body), LOG_TARGET))
    }
}

struct ConcurrentBody {
    members: Vec<Service>,
}

#[async_trait]
impl ServiceBody for ConcurrentBody {
    async fn start_service(&self, service: &Service) -> Result<(), ServiceError> {
        let results = join_all(self.members.iter().map(|m| m.start())).await;

        let mut first_fault = None;
        let mut failures = 0usize;
        for (member, result) in self.members.iter().zip(results) {
            if let Err(fault) = result {
                failures += 1;
                log::warn!(
                    target: LOG_TARGET,
                    "member failed to start (tolerated): concurrent={}, member={}, cause={fault}",
                    service.name(),
                    member.name()
                );
                first_fault.get_or_insert(fault);
            }
        }
        match first_fault {
            Some(fault) if failures == self.members.len() => Err(fault),
            _ => Ok(()),
        }
    }

    async fn stop_service(&self, _service: &Service) -> Result<(), ServiceError> {
        join_all(self.members.iter().map(|m| m.stop())).await;
        Ok(())
    }
}

/// Builder assembling a [`ConcurrentService`] and its facet view.
pub struct ConcurrentServiceBuilder {
    members: Vec<Service>,
}

impl ConcurrentServiceBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self {
            members: Vec::new(),
        }
    }

    /// Adds a member service.
    pub fn add(mut self, member: Service) -> Self {
        self.members.push(member);
        self
    }

    /// Builds the combinator together with its facet view.
    ///
    /// # Errors
    /// [`ServiceError::IllegalState`] when no member was added.
    pub fn build(self) -> Result<ServiceFacet, ServiceError> {
        let members = Arc::new(self.members.clone());
        let service = ConcurrentService::new(self.members)?;
        Ok(ServiceFacet { service, members })
    }
}

impl Default for ConcurrentServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Explicit facet view over a concurrent service: the combinator plus
/// direct member access (the primary member fronts for interfaces the
/// combinator itself does not carry).
#[derive(Clone)]
pub struct ServiceFacet {
    service: Service,
    members: Arc<Vec<Service>>,
}

impl ServiceFacet {
    /// The combinator service.
    pub fn service(&self) -> &Service {
        &self.service
    }

    /// The first member: the designated target for member-specific calls.
    pub fn primary(&self) -> &Service {
        &self.members[0]
    }

    /// All members, in registration order.
    pub fn members(&self) -> &[Service] {
        &self.members
    }
}

//! # Event objects published on state transitions.
//!
//! Every transition of a [`Service`](crate::Service) synthesizes a
//! [`ServiceEvent`] (`from → to`), and every transition of an
//! [`AsyncOp`](crate::AsyncOp) synthesizes an [`OpEvent`] (`to` only; the
//! operation graph is a one-way street).
//!
//! ## Ordering guarantees
//! Each event carries a globally unique sequence number (`seq`) that
//! increases monotonically, so events can be ordered even after crossing
//! async channel boundaries. Within one entity, events are enqueued while
//! the state lock is held, which already yields a per-entity total order.
//!
//! ## Property bag
//! Both event types expose a uniform accessor by property name
//! ([`ServiceEvent::property`], [`OpEvent::property`]) for generic event
//! buses, alongside the strongly-typed fields. Equality is structural over
//! `(source, to[, from])` — sequence numbers and timestamps do not
//! participate.

use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::SystemTime;

use crate::op::OpState;
use crate::service::ServiceState;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_seq() -> u64 {
    EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed)
}

/// State-change event of a [`Service`](crate::Service).
#[derive(Clone, Debug)]
pub struct ServiceEvent {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp (may go backwards, use for logging only).
    pub at: SystemTime,
    /// Name of the service that transitioned.
    pub source: Arc<str>,
    /// Public state before the transition.
    pub from: ServiceState,
    /// Public state after the transition.
    pub to: ServiceState,
    /// Optional free-form tag attached by the emitter.
    pub tag: Option<Cow<'static, str>>,
}

impl ServiceEvent {
    /// Property name of the source service.
    pub const PROP_SERVICE: &'static str = "service";
    /// Property name of the pre-transition state.
    pub const PROP_FROM_STATE: &'static str = "fromState";
    /// Property name of the post-transition state.
    pub const PROP_TO_STATE: &'static str = "toState";
    /// Property name of the optional tag.
    pub const PROP_TAG: &'static str = "tag";

    /// Creates a new event stamped with the next sequence number.
    pub fn new(source: Arc<str>, from: ServiceState, to: ServiceState) -> Self {
        Self {
            seq: next_seq(),
            at: SystemTime::now(),
            source,
            from,
            to,
            tag: None,
        }
    }

    /// Attaches a tag.
    pub fn with_tag(mut self, tag: impl Into<Cow<'static, str>>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// All property names understood by [`property`](Self::property).
    pub fn property_names() -> &'static [&'static str] {
        &[
            Self::PROP_SERVICE,
            Self::PROP_FROM_STATE,
            Self::PROP_TO_STATE,
            Self::PROP_TAG,
        ]
    }

    /// Uniform name → value lookup for generic event buses.
    pub fn property(&self, name: &str) -> Option<String> {
        match name {
            Self::PROP_SERVICE => Some(self.source.to_string()),
            Self::PROP_FROM_STATE => Some(format!("{:?}", self.from)),
            Self::PROP_TO_STATE => Some(format!("{:?}", self.to)),
            Self::PROP_TAG => self.tag.as_ref().map(|t| t.to_string()),
            _ => None,
        }
    }
}

impl PartialEq for ServiceEvent {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.from == other.from && self.to == other.to
    }
}

impl Eq for ServiceEvent {}

impl std::fmt::Display for ServiceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "service: {}, {:?} -> {:?}", self.source, self.from, self.to)
    }
}

/// State-change event of an [`AsyncOp`](crate::AsyncOp).
#[derive(Clone, Debug)]
pub struct OpEvent {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp (may go backwards, use for logging only).
    pub at: SystemTime,
    /// Name of the operation that transitioned.
    pub source: Arc<str>,
    /// Public state after the transition.
    pub to: OpState,
    /// Optional free-form tag attached by the emitter.
    pub tag: Option<Cow<'static, str>>,
}

impl OpEvent {
    /// Property name of the source operation.
    pub const PROP_OPERATION: &'static str = "operation";
    /// Property name of the post-transition state.
    pub const PROP_TO_STATE: &'static str = "toState";
    /// Property name of the optional tag.
    pub const PROP_TAG: &'static str = "tag";

    /// Creates a new event stamped with the next sequence number.
    pub fn new(source: Arc<str>, to: OpState) -> Self {
        Self {
            seq: next_seq(),
            at: SystemTime::now(),
            source,
            to,
            tag: None,
        }
    }

    /// Attaches a tag.
    pub fn with_tag(mut self, tag: impl Into<Cow<'static, str>>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// All property names understood by [`property`](Self::property).
    pub fn property_names() -> &'static [&'static str] {
        &[Self::PROP_OPERATION, Self::PROP_TO_STATE, Self::PROP_TAG]
    }

    /// Uniform name → value lookup for generic event buses.
    pub fn property(&self, name: &str) -> Option<String> {
        match name {
            Self::PROP_OPERATION => Some(self.source.to_string()),
            Self::PROP_TO_STATE => Some(format!("{:?}", self.to)),
            Self::PROP_TAG => self.tag.as_ref().map(|t| t.to_string()),
            _ => None,
        }
    }
}

impl PartialEq for OpEvent {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.to == other.to
    }
}

impl Eq for OpEvent {}

impl std::fmt::Display for OpEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op: {} -> {:?}", self.source, self.to)
    }
}

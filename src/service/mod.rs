//! # Services: the restartable lifecycle entity and its combinators.
//!
//! [`Service`] is the `{Stopped, Running, Failed}` state machine;
//! [`ThreadedService`] backs one with a long-running worker task; the
//! remaining modules compose services (parallel membership, lifecycle
//! chains, failure dependencies).

pub(crate) mod core;
mod state;

mod chain;
mod composite;
mod concurrent;
mod threaded;

pub use chain::{chain, failure_dependency, ChainLink, FailureLink};
pub use composite::CompositeService;
pub use concurrent::{ConcurrentService, ConcurrentServiceBuilder, ServiceFacet};
pub use self::core::{Service, ServiceBody};
pub use state::{ServicePhase, ServiceState};
pub use threaded::{ServiceContext, ThreadedService};

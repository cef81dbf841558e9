//! # Asynchronous operations: the state machine and its combinators.
//!
//! [`AsyncOp`] is the one-shot cancellable computation at the heart of the
//! crate. [`FnOp`] wraps a plain async closure as an operation; the
//! remaining modules are combinators that compose operations into larger
//! ones while preserving the state-machine contract.

pub(crate) mod core;
mod state;

mod background;
mod basic;
mod concur;
mod delayed;
mod func;
mod on_fault;
mod periodic;
mod seq;
mod timed;

pub use background::BackgroundedOp;
pub use basic::{IdleOp, NopOp};
pub use concur::ConcurrentOp;
pub use self::core::{AsyncOp, OpHandle, OpRef, OpResult, Operate};
pub use delayed::DelayedOp;
pub use func::FnOp;
pub use on_fault::OnFaultOp;
pub use periodic::PeriodicOp;
pub use seq::SequentialOp;
pub use state::{OpPhase, OpState};
pub use timed::TimedOp;

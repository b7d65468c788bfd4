//! Operations and the process-wide service that runs them.
//!
//! A [`ServiceContext`] owns the storage engine and replication coordinator
//! and tracks every live operation. Each [`OperationContext`] carries one
//! recovery unit and one locker, and polls for interruption at checkpoints.

mod context;
mod fault;
mod service;

pub use context::OperationContext;
pub use fault::FaultInjection;
pub use service::{Client, CurOp, ServiceContext};

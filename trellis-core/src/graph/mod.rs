//! Scheduling Graph
//!
//! Node identity and the machinery that decides when invalidated
//! computations run.
//!
//! # Overview
//!
//! - [`NodeId`] orders computations by creation. The scheduler relies on
//!   this ordering: parents before children, plain reactions before an
//!   owner's primary reaction.
//! - [`UpdateScheduler`] batches, de-duplicates and flushes queued jobs.
//! - [`TickHost`] runs deferred work (flushes and `next_tick` callbacks)
//!   after the current synchronous code.

mod host;
mod node;
mod scheduler;

pub use host::{ManualHost, Task, TickHost, TokioHost};
pub use node::{NodeId, NodeKind};
pub use scheduler::{AfterFlush, Enqueue, FlushReport, Job, Phase, UpdateScheduler};

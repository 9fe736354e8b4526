//! Tick Hosts
//!
//! A tick host decides when deferred work runs. The runtime hands it one
//! task per tick (a scheduler flush, a batch of `next_tick` callbacks) and
//! never runs deferred work itself.
//!
//! Two hosts are provided:
//!
//! - [`ManualHost`] queues tasks until [`TickHost::run_pending`] is called.
//!   Deterministic, and the default.
//! - [`TokioHost`] spawns each task onto the current `tokio::task::LocalSet`.

use std::cell::RefCell;
use std::collections::VecDeque;

use tracing::{debug, error};

use crate::error::ReactiveError;

/// Deferred unit of work.
pub type Task = Box<dyn FnOnce() -> Result<(), ReactiveError>>;

/// Something that runs deferred tasks after the current synchronous work.
pub trait TickHost {
    /// Arrange for `task` to run later, after tasks scheduled before it.
    fn schedule(&self, task: Task);

    /// Run everything scheduled so far, including tasks scheduled while
    /// running. Hosts that drive themselves return `Ok(0)`.
    fn run_pending(&self) -> Result<usize, ReactiveError> {
        Ok(0)
    }
}

impl<H: TickHost + ?Sized> TickHost for std::rc::Rc<H> {
    fn schedule(&self, task: Task) {
        (**self).schedule(task);
    }

    fn run_pending(&self) -> Result<usize, ReactiveError> {
        (**self).run_pending()
    }
}

/// FIFO host driven explicitly by the embedder.
#[derive(Default)]
pub struct ManualHost {
    tasks: RefCell<VecDeque<Task>>,
}

impl ManualHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.tasks.borrow().len()
    }
}

impl TickHost for ManualHost {
    fn schedule(&self, task: Task) {
        self.tasks.borrow_mut().push_back(task);
    }

    /// Drains until empty. Every task runs even if an earlier one failed;
    /// the first error is returned.
    fn run_pending(&self) -> Result<usize, ReactiveError> {
        let mut ran = 0;
        let mut first_error = None;
        loop {
            let next = self.tasks.borrow_mut().pop_front();
            let Some(task) = next else { break };
            ran += 1;
            if let Err(err) = task() {
                first_error.get_or_insert(err);
            }
        }
        debug!(ran, "manual host drained");
        match first_error {
            Some(err) => Err(err),
            None => Ok(ran),
        }
    }
}

/// Host that spawns tasks onto the current `LocalSet`.
///
/// Must be used from inside `LocalSet::run_until` (or a
/// `#[tokio::test]` wrapped in one): `spawn_local` panics otherwise.
/// Task errors have no caller to return to and are logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioHost;

impl TokioHost {
    pub fn new() -> Self {
        Self
    }
}

impl TickHost for TokioHost {
    fn schedule(&self, task: Task) {
        tokio::task::spawn_local(async move {
            if let Err(err) = task() {
                error!(target: "trellis", error = %err, "tick task failed");
            }
        });
    }
}

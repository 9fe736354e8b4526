//! Update Scheduler
//!
//! The scheduler batches invalidated computations and runs each of them
//! once per flush, in creation order.
//!
//! # Algorithm
//!
//! 1. `enqueue` adds a job unless it is already pending. The first enqueue
//!    after the scheduler went idle reports [`Enqueue::FlushNeeded`]; the
//!    caller then arranges for [`UpdateScheduler::flush`] to run (next host
//!    tick, or right away in synchronous mode).
//! 2. `flush` sorts the queue by node id. Parents are created before their
//!    children, so they run first; an owner's plain reactions are created
//!    before its primary one, so they run first too.
//! 3. The queue is drained with an explicit cursor because running a job
//!    may enqueue more. A job enqueued while flushing is spliced into the
//!    unprocessed part of the queue at its sorted position.
//! 4. A job's pending flag is cleared right before it runs, so a job that
//!    invalidates itself is queued again. Each re-queue is counted; past the
//!    configured ceiling the flush is aborted as a runaway loop.
//! 5. State is reset before post-flush callbacks run, so invalidations
//!    they cause start a fresh cycle.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;

use tracing::{debug, trace};

use super::node::NodeId;
use crate::diagnostics;
use crate::error::ReactiveError;

/// A unit of work the scheduler can queue.
///
/// Implemented by [`Watcher`](crate::reactive::Watcher); tests use mocks.
pub trait Job: Clone {
    /// Stable id, also the sort key.
    fn id(&self) -> NodeId;

    /// Hook run right before the job during a flush.
    fn before(&self) {}

    /// Run the job.
    fn run(&self) -> Result<(), ReactiveError>;

    /// Human-readable description for diagnostics.
    fn describe(&self) -> String;
}

/// Result of [`UpdateScheduler::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    /// The job was already pending.
    Duplicate,
    /// Queued; a flush is already scheduled or running.
    Queued,
    /// Queued, and the scheduler was idle: the caller must schedule a flush.
    FlushNeeded,
}

/// Scheduler phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// A flush has been scheduled but has not started.
    Waiting,
    Flushing,
}

/// What a finished flush did. Passed to post-flush callbacks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Ids of every job that was in the queue, in run order.
    pub flushed: Vec<NodeId>,
    /// The flush stopped early on a runaway update loop.
    pub aborted: bool,
}

/// Callback run once after the current (or next) flush completes.
pub type AfterFlush = Box<dyn FnOnce(&FlushReport)>;

struct State<J> {
    queue: Vec<J>,
    has: HashSet<NodeId>,
    circular: HashMap<NodeId, usize>,
    waiting: bool,
    flushing: bool,
    index: usize,
    after_flush: Vec<AfterFlush>,
}

impl<J> Default for State<J> {
    fn default() -> Self {
        Self {
            queue: Vec::new(),
            has: HashSet::new(),
            circular: HashMap::new(),
            waiting: false,
            flushing: false,
            index: 0,
            after_flush: Vec::new(),
        }
    }
}

/// Batching, de-duplicating, id-ordered job queue.
pub struct UpdateScheduler<J: Job> {
    state: RefCell<State<J>>,
    max_update_count: usize,
    silent: bool,
}

impl<J: Job> UpdateScheduler<J> {
    /// Create an idle scheduler with the given re-entry ceiling.
    pub fn new(max_update_count: usize) -> Self {
        Self {
            state: RefCell::new(State::default()),
            max_update_count,
            silent: false,
        }
    }

    /// Suppress the runaway-update diagnostic. Runaway loops are still
    /// aborted.
    pub fn with_silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    pub fn phase(&self) -> Phase {
        let state = self.state.borrow();
        if state.flushing {
            Phase::Flushing
        } else if state.waiting {
            Phase::Waiting
        } else {
            Phase::Idle
        }
    }

    /// Number of jobs in the queue, processed or not.
    pub fn len(&self) -> usize {
        self.state.borrow().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().queue.is_empty()
    }

    /// Whether `id` is pending (queued and not yet run in this flush).
    pub fn is_pending(&self, id: NodeId) -> bool {
        self.state.borrow().has.contains(&id)
    }

    /// Queue a job.
    pub fn enqueue(&self, job: &J) -> Enqueue {
        let mut state = self.state.borrow_mut();
        let id = job.id();
        if !state.has.insert(id) {
            return Enqueue::Duplicate;
        }

        if state.flushing {
            // Keep the unprocessed tail sorted; never insert at or before
            // the job currently running.
            let mut i = state.queue.len();
            while i > state.index + 1 && state.queue[i - 1].id() > id {
                i -= 1;
            }
            state.queue.insert(i, job.clone());
        } else {
            state.queue.push(job.clone());
        }
        trace!(job = %id, "enqueued");

        if state.waiting {
            Enqueue::Queued
        } else {
            state.waiting = true;
            Enqueue::FlushNeeded
        }
    }

    /// Register a callback for the end of the current flush, or of the
    /// next one if none is in progress. Returns `true` when the scheduler
    /// was idle and the caller must schedule a flush.
    pub fn run_after_current_flush(&self, callback: AfterFlush) -> bool {
        let mut state = self.state.borrow_mut();
        state.after_flush.push(callback);
        if state.waiting {
            false
        } else {
            state.waiting = true;
            true
        }
    }

    /// Drain the queue.
    ///
    /// Errors from jobs stop the flush and are returned after the state has
    /// been reset. A runaway loop is reported as a diagnostic, not an error.
    pub fn flush(&self) -> Result<FlushReport, ReactiveError> {
        {
            let mut state = self.state.borrow_mut();
            if state.flushing {
                return Ok(FlushReport::default());
            }
            state.flushing = true;
            state.waiting = true;
            state.queue.sort_by_key(|job| job.id());
            state.index = 0;
            debug!(queued = state.queue.len(), "flushing scheduler queue");
        }

        let mut failure = None;
        let mut runaway = None;
        loop {
            let job = {
                let state = self.state.borrow();
                match state.queue.get(state.index) {
                    Some(job) => job.clone(),
                    None => break,
                }
            };

            job.before();
            let id = job.id();
            self.state.borrow_mut().has.remove(&id);

            if let Err(err) = job.run() {
                failure = Some(err);
                break;
            }

            let mut state = self.state.borrow_mut();
            if state.has.contains(&id) {
                let count = state.circular.entry(id).or_insert(0);
                *count += 1;
                if *count > self.max_update_count {
                    runaway = Some(ReactiveError::RunawayUpdate {
                        watcher: id,
                        expression: job.describe(),
                        count: *count,
                    });
                    break;
                }
            }
            state.index += 1;
        }

        let (report, callbacks) = self.reset(runaway.is_some());
        debug!(ran = report.flushed.len(), aborted = report.aborted, "flush complete");
        if let Some(diagnostic) = &runaway {
            diagnostics::emit(self.silent, diagnostic);
        }
        for callback in callbacks {
            callback(&report);
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Return to idle, handing back a copy of what was flushed and the
    /// pending post-flush callbacks.
    fn reset(&self, aborted: bool) -> (FlushReport, Vec<AfterFlush>) {
        let mut state = self.state.borrow_mut();
        let flushed = state.queue.drain(..).map(|job| job.id()).collect();
        let callbacks = std::mem::take(&mut state.after_flush);
        state.has.clear();
        state.circular.clear();
        state.index = 0;
        state.waiting = false;
        state.flushing = false;
        (FlushReport { flushed, aborted }, callbacks)
    }
}

impl<J: Job> fmt::Debug for UpdateScheduler<J> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateScheduler")
            .field("phase", &self.phase())
            .field("queued", &self.len())
            .field("max_update_count", &self.max_update_count)
            .field("silent", &self.silent)
            .finish()
    }
}

//! Reactive Runtime
//!
//! The runtime is the coordinator every owner is attached to. It holds the
//! update scheduler, the tick host that runs deferred work, and the error
//! handler user watchers report to.
//!
//! # How It Works
//!
//! 1. A write notifies a subject, which invalidates its watchers.
//!
//! 2. A queued watcher is handed to the runtime, which puts it on the
//!    scheduler. The first job after the scheduler went idle schedules a
//!    flush: on the next tick, or immediately when the runtime is
//!    configured as `sync`.
//!
//! 3. Deferred work goes through one tick queue: flushes and
//!    [`Runtime::next_tick`] callbacks run in the order they were
//!    requested, batched into a single host task per tick.
//!
//! # Diagnostics
//!
//! `silent` is per runtime. The scheduler reports runaway loops with it,
//! owners pass it to their root state, and flushes, tick tasks and watcher
//! evaluations run inside a diagnostics scope carrying it.
//!
//! # Threading
//!
//! A runtime is single-threaded (`!Send`). Nothing in it locks; all
//! mutable state sits in `RefCell`s that are never borrowed across a call
//! into user code.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{debug, error};

use super::watcher::Watcher;
use crate::config::Config;
use crate::diagnostics;
use crate::error::ReactiveError;
use crate::graph::{Enqueue, FlushReport, ManualHost, Phase, TickHost, UpdateScheduler};

/// Receives errors from user watchers.
pub type ErrorHandler = Rc<dyn Fn(&ReactiveError)>;

type Deferred = Box<dyn FnOnce() -> Result<(), ReactiveError>>;

#[derive(Default)]
struct TickQueue {
    callbacks: Vec<Deferred>,
    pending: bool,
}

struct RuntimeInner {
    config: Config,
    scheduler: UpdateScheduler<Watcher>,
    host: Rc<dyn TickHost>,
    ticks: RefCell<TickQueue>,
    error_handler: RefCell<ErrorHandler>,
}

/// Handle to a reactive runtime. Clones share the same runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

impl Runtime {
    /// Runtime with the default configuration and a [`ManualHost`].
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Runtime with a [`ManualHost`]: deferred work runs on [`Runtime::tick`].
    pub fn with_config(config: Config) -> Self {
        Self::with_host(config, ManualHost::new())
    }

    /// Runtime driven by `host`.
    pub fn with_host(config: Config, host: impl TickHost + 'static) -> Self {
        let default_handler: ErrorHandler = Rc::new(|err: &ReactiveError| {
            error!(target: "trellis", error = %err, "error in watcher");
        });
        Self {
            inner: Rc::new(RuntimeInner {
                scheduler: UpdateScheduler::new(config.max_update_count)
                    .with_silent(config.silent),
                config,
                host: Rc::new(host),
                ticks: RefCell::new(TickQueue::default()),
                error_handler: RefCell::new(default_handler),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Open a diagnostics scope following this runtime's `silent` flag,
    /// for writes made outside any watcher or flush.
    pub fn enter(&self) -> diagnostics::Scope {
        diagnostics::Scope::enter(self.inner.config.silent)
    }

    /// Replace the handler user-watcher errors are reported to.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&ReactiveError) + 'static,
    {
        let handler: ErrorHandler = Rc::new(handler);
        *self.inner.error_handler.borrow_mut() = handler;
    }

    pub(crate) fn report_error(&self, err: &ReactiveError) {
        let handler = self.inner.error_handler.borrow().clone();
        handler(err);
    }

    /// Queue `watcher` for the next flush.
    pub(crate) fn enqueue(&self, watcher: &Watcher) -> Result<(), ReactiveError> {
        match self.inner.scheduler.enqueue(watcher) {
            Enqueue::FlushNeeded => self.schedule_flush(),
            Enqueue::Queued | Enqueue::Duplicate => Ok(()),
        }
    }

    fn schedule_flush(&self) -> Result<(), ReactiveError> {
        if self.inner.config.sync {
            return self.flush().map(drop);
        }
        let runtime = Rc::downgrade(&self.inner);
        self.defer(Box::new(move || match upgrade(&runtime) {
            Some(runtime) => runtime.flush().map(drop),
            None => Ok(()),
        }));
        Ok(())
    }

    /// Drain the scheduler now.
    ///
    /// Returns an empty report if a flush is already running.
    pub fn flush(&self) -> Result<FlushReport, ReactiveError> {
        let _diagnostics = self.enter();
        self.inner.scheduler.flush()
    }

    /// Run `callback` after the current flush, or after the next one when
    /// no flush is in progress (scheduling it if needed).
    pub fn run_after_current_flush<F>(&self, callback: F) -> Result<(), ReactiveError>
    where
        F: FnOnce(&FlushReport) + 'static,
    {
        if self.inner.scheduler.run_after_current_flush(Box::new(callback)) {
            self.schedule_flush()
        } else {
            Ok(())
        }
    }

    /// Run `callback` on the next tick, after any flush requested before it.
    pub fn next_tick<F>(&self, callback: F)
    where
        F: FnOnce() + 'static,
    {
        self.defer(Box::new(move || {
            callback();
            Ok(())
        }));
    }

    /// Append to the tick queue, handing the host one task per batch.
    fn defer(&self, task: Deferred) {
        let schedule = {
            let mut ticks = self.inner.ticks.borrow_mut();
            ticks.callbacks.push(task);
            !std::mem::replace(&mut ticks.pending, true)
        };
        if !schedule {
            return;
        }
        let runtime = Rc::downgrade(&self.inner);
        self.inner.host.schedule(Box::new(move || match upgrade(&runtime) {
            Some(runtime) => runtime.run_ticks(),
            None => Ok(()),
        }));
    }

    /// Run the current tick batch. Every callback runs; the first error is
    /// returned.
    fn run_ticks(&self) -> Result<(), ReactiveError> {
        let callbacks = {
            let mut ticks = self.inner.ticks.borrow_mut();
            ticks.pending = false;
            std::mem::take(&mut ticks.callbacks)
        };
        debug!(callbacks = callbacks.len(), "running tick");
        let _diagnostics = self.enter();
        let mut first_error = None;
        for callback in callbacks {
            if let Err(err) = callback() {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Run deferred work through the host. With a [`ManualHost`] this
    /// drains everything pending and returns the number of host tasks run.
    pub fn tick(&self) -> Result<usize, ReactiveError> {
        self.inner.host.run_pending()
    }

    /// Whether a flush is scheduled or running.
    pub fn is_flush_pending(&self) -> bool {
        self.inner.scheduler.phase() != Phase::Idle
    }

    pub fn is_flushing(&self) -> bool {
        self.inner.scheduler.phase() == Phase::Flushing
    }

    /// Number of watchers in the scheduler queue.
    pub fn queued(&self) -> usize {
        self.inner.scheduler.len()
    }
}

fn upgrade(runtime: &Weak<RuntimeInner>) -> Option<Runtime> {
    runtime.upgrade().map(|inner| Runtime { inner })
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.inner.config)
            .field("scheduler", &self.inner.scheduler)
            .finish()
    }
}

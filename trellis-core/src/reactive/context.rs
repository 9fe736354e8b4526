//! Reactive Context
//!
//! The reactive context tracks which computation is currently evaluating.
//! This enables automatic dependency tracking: when a reactive field is
//! read, the field's subject registers the current watcher as a dependent.
//!
//! # Implementation
//!
//! We use a thread-local stack of frames. Evaluating a watcher pushes a
//! frame naming it; the guard returned by [`ReactiveContext::enter`] pops
//! the frame when dropped, on every exit path including unwinding.
//!
//! Nested frames happen when one computation reads a lazy value that has
//! to evaluate first. An empty frame ([`ReactiveContext::untracked`])
//! suspends tracking for the code run under it.

use std::cell::RefCell;

use super::watcher::Watcher;
use crate::graph::NodeId;

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<Option<Watcher>>> = const { RefCell::new(Vec::new()) };
}

/// Guard that pops the context frame when dropped.
pub struct ReactiveContext {
    target: Option<NodeId>,
}

impl ReactiveContext {
    /// Make `watcher` the current computation until the guard is dropped.
    pub fn enter(watcher: &Watcher) -> Self {
        CONTEXT_STACK.with(|stack| stack.borrow_mut().push(Some(watcher.clone())));
        Self {
            target: Some(watcher.id()),
        }
    }

    /// Push a frame with no current computation: reads under it are not
    /// tracked.
    pub fn untracked() -> Self {
        CONTEXT_STACK.with(|stack| stack.borrow_mut().push(None));
        Self { target: None }
    }

    /// Check if a computation is currently collecting dependencies.
    pub fn is_active() -> bool {
        CONTEXT_STACK.with(|stack| matches!(stack.borrow().last(), Some(Some(_))))
    }

    /// The computation currently collecting dependencies, if any.
    pub fn current() -> Option<Watcher> {
        CONTEXT_STACK.with(|stack| stack.borrow().last().cloned().flatten())
    }

    /// Id of the current computation, if any.
    pub fn current_id() -> Option<NodeId> {
        CONTEXT_STACK.with(|stack| {
            stack
                .borrow()
                .last()
                .and_then(|frame| frame.as_ref().map(Watcher::id))
        })
    }

    /// Number of frames on the stack.
    pub fn depth() -> usize {
        CONTEXT_STACK.with(|stack| stack.borrow().len())
    }
}

impl Drop for ReactiveContext {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();

            // Catch mismatched guards in debug builds.
            if let Some(frame) = popped {
                debug_assert_eq!(
                    frame.as_ref().map(Watcher::id),
                    self.target,
                    "ReactiveContext mismatch"
                );
            }
        });
    }
}

/// Run `f` without registering any dependencies.
pub fn untracked<T>(f: impl FnOnce() -> T) -> T {
    let _frame = ReactiveContext::untracked();
    f()
}

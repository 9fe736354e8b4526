//! Diagnostics Channel
//!
//! Advisory warnings (runaway updates, misuse of `set_field` /
//! `delete_field`, bad watch paths) are emitted here rather than returned,
//! because the operation that triggers them carries on with its corrective
//! behaviour regardless.
//!
//! Every diagnostic is logged with `tracing::warn!` and, if installed,
//! handed to a per-thread handler.
//!
//! # Silencing
//!
//! Silence belongs to a runtime, not to the thread. Code that knows which
//! runtime it acts for calls [`emit`] with that runtime's `silent` flag.
//! Code that does not (a reactive write, a path compiled inside a getter)
//! calls [`warn`], which follows the innermost [`Scope`]: a runtime enters
//! one while it flushes, runs tick tasks or evaluates a watcher, and
//! [`Runtime::enter`](crate::reactive::Runtime::enter) opens one around
//! arbitrary code. Outside any scope diagnostics are emitted.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::error::ReactiveError;

/// Callback receiving every emitted diagnostic.
pub type DiagnosticHandler = Rc<dyn Fn(&ReactiveError)>;

#[derive(Default)]
struct Sink {
    scopes: Vec<bool>,
    handler: Option<DiagnosticHandler>,
}

thread_local! {
    static SINK: RefCell<Sink> = RefCell::new(Sink::default());
}

/// Guard for a silencing scope. Dropping it restores the enclosing scope.
#[must_use = "the scope ends when the guard is dropped"]
pub struct Scope {
    // Scopes are per-thread.
    _not_send: PhantomData<*const ()>,
}

impl Scope {
    /// Enter a scope in which [`warn`] is suppressed when `silent` is true.
    pub fn enter(silent: bool) -> Self {
        SINK.with(|sink| sink.borrow_mut().scopes.push(silent));
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        SINK.with(|sink| {
            let popped = sink.borrow_mut().scopes.pop();
            debug_assert!(popped.is_some(), "diagnostics scope stack underflow");
        });
    }
}

/// Whether the innermost scope suppresses diagnostics.
pub fn is_silent() -> bool {
    SINK.with(|sink| sink.borrow().scopes.last().copied().unwrap_or(false))
}

/// Install a handler that receives every diagnostic, replacing any
/// previous one. Pass `None` to remove it.
pub fn set_handler(handler: Option<DiagnosticHandler>) {
    SINK.with(|sink| sink.borrow_mut().handler = handler);
}

/// Emit a diagnostic unless the innermost scope is silent.
pub fn warn(diagnostic: &ReactiveError) {
    emit(is_silent(), diagnostic);
}

/// Emit a diagnostic on behalf of a runtime whose `silent` flag is given.
pub fn emit(silent: bool, diagnostic: &ReactiveError) {
    if silent {
        return;
    }
    tracing::warn!(target: "trellis", "{diagnostic}");
    // Called with the sink released so the handler may touch it.
    let handler = SINK.with(|sink| sink.borrow().handler.clone());
    if let Some(handler) = handler {
        handler(diagnostic);
    }
}

//! Watcher Implementation
//!
//! A Watcher is a computation node: it evaluates an expression while
//! recording every subject the expression reads, and reacts when any of
//! them notifies.
//!
//! # How Watchers Work
//!
//! 1. On creation, a non-lazy watcher evaluates its expression immediately
//!    to collect its initial dependencies.
//!
//! 2. Every evaluation collects dependencies into a fresh buffer. When the
//!    evaluation ends, subjects that were not read this time are
//!    unsubscribed and the buffers swap. Dependencies are therefore always
//!    exactly the subjects read by the last evaluation.
//!
//! 3. When a dependency notifies, the watcher reacts according to its kind:
//!    lazy watchers only mark themselves dirty, sync watchers re-run on the
//!    spot, and everything else is queued on the runtime's scheduler.
//!
//! 4. Re-running re-evaluates and fires the reaction callback with the new
//!    and old values, unless an unchanged primitive came out of a non-deep
//!    watcher.
//!
//! # Lazy Watchers
//!
//! A lazy watcher is a derived value: [`Watcher::read`] recomputes it only
//! if a dependency changed since the last read, and forwards its own
//! dependencies to whichever computation is reading it.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::trace;

use super::context::ReactiveContext;
use super::owner::{Owner, WeakOwner};
use super::path;
use super::runtime::Runtime;
use super::subject::{Subject, SubjectId, WeakSubject};
use super::traverse;
use super::value::Value;
use crate::diagnostics;
use crate::error::{EvalError, ReactiveError};
use crate::graph::{Job, NodeId, NodeKind};

/// Tracked expression: computes a value from the owner's context.
pub type Getter = Rc<dyn Fn(&Owner) -> Result<Value, EvalError>>;

/// Reaction callback, called with `(new, old)`.
pub type Reaction = Rc<dyn Fn(&Value, &Value) -> Result<(), EvalError>>;

/// Hook run right before a queued watcher runs during a flush.
pub type BeforeHook = Rc<dyn Fn()>;

/// What a watcher evaluates: a getter plus the text used to describe it
/// in diagnostics.
#[derive(Clone)]
pub struct Expression {
    text: String,
    getter: Getter,
    invalid_path: bool,
}

impl Expression {
    /// Expression backed by a closure.
    pub fn new<F>(getter: F) -> Self
    where
        F: Fn(&Owner) -> Result<Value, EvalError> + 'static,
    {
        Self {
            text: "<function>".to_owned(),
            getter: Rc::new(getter),
            invalid_path: false,
        }
    }

    /// Dot-path expression resolved against the owner's state, e.g.
    /// `"user.address.city"`.
    ///
    /// An invalid path always yields `Undefined`; the watcher built from it
    /// emits a diagnostic through its owner's runtime.
    pub fn path(path: &str) -> Self {
        let compiled = path::compile(path);
        Self {
            text: path.to_owned(),
            invalid_path: compiled.is_none(),
            getter: compiled.unwrap_or_else(path::undefined),
        }
    }

    /// Replace the text shown in diagnostics.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.text = label.into();
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

impl From<&str> for Expression {
    fn from(path: &str) -> Self {
        Expression::path(path)
    }
}

impl From<String> for Expression {
    fn from(path: String) -> Self {
        Expression::path(&path)
    }
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Expression").field(&self.text).finish()
    }
}

/// Options for creating a [`Watcher`].
#[derive(Clone, Default)]
pub struct WatcherOptions {
    deep: bool,
    user: bool,
    lazy: bool,
    sync: bool,
    before: Option<BeforeHook>,
}

impl WatcherOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also depend on everything reachable from the value, and fire the
    /// callback on every re-run.
    pub fn deep(mut self) -> Self {
        self.deep = true;
        self
    }

    /// The expression and callback are user code: their errors are
    /// reported and swallowed instead of propagated.
    pub fn user(mut self) -> Self {
        self.user = true;
        self
    }

    /// Derived value: evaluate on read, never on notification.
    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    /// Re-run inside the notifying write instead of queueing.
    pub fn sync(mut self) -> Self {
        self.sync = true;
        self
    }

    pub fn before<F: Fn() + 'static>(mut self, hook: F) -> Self {
        let hook: BeforeHook = Rc::new(hook);
        self.before = Some(hook);
        self
    }
}

impl fmt::Debug for WatcherOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatcherOptions")
            .field("deep", &self.deep)
            .field("user", &self.user)
            .field("lazy", &self.lazy)
            .field("sync", &self.sync)
            .field("before", &self.before.is_some())
            .finish()
    }
}

/// Double-buffered dependency sets: the subjects read by the last
/// evaluation, and those read by the one in flight.
#[derive(Default)]
struct Deps {
    current: Vec<WeakSubject>,
    current_ids: HashSet<SubjectId>,
    pending: Vec<WeakSubject>,
    pending_ids: HashSet<SubjectId>,
}

struct WatcherInner {
    id: NodeId,
    owner: WeakOwner,
    owner_name: String,
    expression: String,
    getter: Getter,
    callback: Option<Reaction>,
    kind: NodeKind,
    deep: bool,
    user: bool,
    // The owning runtime's `silent` and `sync` flags.
    silent: bool,
    sync_runtime: bool,
    before: Option<BeforeHook>,
    active: Cell<bool>,
    dirty: Cell<bool>,
    value: RefCell<Value>,
    deps: RefCell<Deps>,
}

/// A computation node.
///
/// `Watcher` is a cheap handle; clones refer to the same node. The node is
/// kept alive by its owner's registry until it is torn down.
#[derive(Clone)]
pub struct Watcher {
    inner: Rc<WatcherInner>,
}

impl Watcher {
    /// Create a watcher that calls `callback` with `(new, old)` whenever a
    /// re-run produces a changed value.
    ///
    /// Non-lazy watchers evaluate once before this returns. If that first
    /// evaluation fails on a non-user watcher, the watcher is torn down and
    /// the error returned.
    pub fn new<F>(
        owner: &Owner,
        expression: impl Into<Expression>,
        callback: F,
        options: WatcherOptions,
    ) -> Result<Self, ReactiveError>
    where
        F: Fn(&Value, &Value) -> Result<(), EvalError> + 'static,
    {
        let callback: Reaction = Rc::new(callback);
        Self::build(owner, expression.into(), Some(callback), options)
    }

    /// Create a watcher without a callback: re-running it is the effect.
    pub fn effect(
        owner: &Owner,
        expression: impl Into<Expression>,
        options: WatcherOptions,
    ) -> Result<Self, ReactiveError> {
        Self::build(owner, expression.into(), None, options)
    }

    /// Create a lazy derived value. Read it with [`Watcher::read`].
    pub fn computed(owner: &Owner, expression: impl Into<Expression>) -> Self {
        let options = WatcherOptions::new().lazy();
        Self::create(owner, expression.into(), None, &options)
    }

    fn build(
        owner: &Owner,
        expression: Expression,
        callback: Option<Reaction>,
        options: WatcherOptions,
    ) -> Result<Self, ReactiveError> {
        let watcher = Self::create(owner, expression, callback, &options);
        if watcher.inner.kind != NodeKind::Lazy {
            match watcher.evaluate() {
                Ok(value) => *watcher.inner.value.borrow_mut() = value,
                Err(err) => {
                    watcher.teardown();
                    return Err(err);
                }
            }
        }
        Ok(watcher)
    }

    fn create(
        owner: &Owner,
        expression: Expression,
        callback: Option<Reaction>,
        options: &WatcherOptions,
    ) -> Self {
        let config = owner.runtime().config();
        let (silent, sync_runtime) = (config.silent, config.sync);
        if expression.invalid_path {
            diagnostics::emit(silent, &ReactiveError::InvalidPath(expression.text.clone()));
        }
        let watcher = Self {
            inner: Rc::new(WatcherInner {
                id: NodeId::new(),
                owner: owner.downgrade(),
                owner_name: owner.name().to_owned(),
                expression: expression.text,
                getter: expression.getter,
                callback,
                kind: NodeKind::from_flags(options.lazy, options.sync),
                deep: options.deep,
                user: options.user,
                silent,
                sync_runtime,
                before: options.before.clone(),
                active: Cell::new(true),
                dirty: Cell::new(options.lazy),
                value: RefCell::new(Value::Undefined),
                deps: RefCell::new(Deps::default()),
            }),
        };
        owner.register(&watcher);
        trace!(watcher = %watcher.id(), expression = %watcher.inner.expression, "created");
        watcher
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn kind(&self) -> NodeKind {
        self.inner.kind
    }

    pub fn expression(&self) -> &str {
        &self.inner.expression
    }

    /// The last computed value, without evaluating or tracking.
    pub fn value(&self) -> Value {
        self.inner.value.borrow().clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.get()
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.get()
    }

    /// Number of subjects read by the last evaluation.
    pub fn dependency_count(&self) -> usize {
        self.inner.deps.borrow().current.len()
    }

    /// Ids of the subjects read by the last evaluation, in read order.
    pub fn dependency_ids(&self) -> Vec<SubjectId> {
        self.inner
            .deps
            .borrow()
            .current
            .iter()
            .map(WeakSubject::id)
            .collect()
    }

    pub fn owner(&self) -> Option<Owner> {
        self.inner.owner.upgrade()
    }

    fn runtime(&self) -> Option<Runtime> {
        self.owner().map(|owner| owner.runtime().clone())
    }

    /// Run the expression, collecting dependencies.
    ///
    /// Does not store the result. Getter errors of user watchers are
    /// reported and evaluate to `Undefined`.
    pub fn evaluate(&self) -> Result<Value, ReactiveError> {
        let result = {
            let _diagnostics = diagnostics::Scope::enter(self.inner.silent);
            let _scope = ReactiveContext::enter(self);
            let outcome = match self.owner() {
                Some(owner) => (self.inner.getter)(&owner),
                None => Ok(Value::Undefined),
            };
            match outcome {
                Ok(value) => {
                    if self.inner.deep {
                        traverse::touch(&value);
                    }
                    Ok(value)
                }
                Err(source) => {
                    let err = ReactiveError::Getter {
                        owner: self.inner.owner_name.clone(),
                        expression: self.inner.expression.clone(),
                        source,
                    };
                    if self.inner.user {
                        self.report(&err);
                        Ok(Value::Undefined)
                    } else {
                        Err(err)
                    }
                }
            }
        };
        self.cleanup_deps();
        result
    }

    /// Record a read of `subject` during the evaluation in flight.
    pub(crate) fn add_dep(&self, subject: &Subject) {
        let id = subject.id();
        let subscribe = {
            let mut deps = self.inner.deps.borrow_mut();
            if !deps.pending_ids.insert(id) {
                return;
            }
            deps.pending.push(subject.downgrade());
            !deps.current_ids.contains(&id)
        };
        if subscribe {
            subject.subscribe(self);
        }
    }

    /// Drop subjects the last evaluation no longer read, then promote the
    /// in-flight buffer.
    fn cleanup_deps(&self) {
        let stale: Vec<WeakSubject> = {
            let mut deps = self.inner.deps.borrow_mut();
            let Deps {
                current,
                current_ids,
                pending,
                pending_ids,
            } = &mut *deps;
            let stale = current
                .iter()
                .filter(|dep| !pending_ids.contains(&dep.id()))
                .cloned()
                .collect();
            std::mem::swap(current, pending);
            std::mem::swap(current_ids, pending_ids);
            pending.clear();
            pending_ids.clear();
            stale
        };
        for dep in stale {
            if let Some(subject) = dep.upgrade() {
                subject.unsubscribe(self.inner.id);
            }
        }
    }

    /// React to a dependency change.
    pub fn invalidate(&self) -> Result<(), ReactiveError> {
        match self.inner.kind {
            NodeKind::Lazy => {
                self.inner.dirty.set(true);
                Ok(())
            }
            NodeKind::Immediate => self.run(),
            NodeKind::Queued => match self.runtime() {
                Some(runtime) => runtime.enqueue(self),
                None => Ok(()),
            },
        }
    }

    /// Re-evaluate and fire the callback if the value changed.
    ///
    /// Containers and deep watchers always count as changed: their
    /// contents may have been mutated in place.
    pub fn run(&self) -> Result<(), ReactiveError> {
        if !self.inner.active.get() {
            return Ok(());
        }
        let value = self.evaluate()?;
        let changed = {
            let old = self.inner.value.borrow();
            !value.same_value(&old) || value.is_object() || self.inner.deep
        };
        if !changed {
            return Ok(());
        }

        let old = self.inner.value.replace(value.clone());
        trace!(watcher = %self.inner.id, "run");
        let Some(callback) = &self.inner.callback else {
            return Ok(());
        };
        let outcome = {
            let _diagnostics = diagnostics::Scope::enter(self.inner.silent);
            callback(&value, &old)
        };
        if let Err(source) = outcome {
            let err = ReactiveError::Callback {
                owner: self.inner.owner_name.clone(),
                expression: self.inner.expression.clone(),
                source,
            };
            if self.inner.user {
                self.report(&err);
            } else {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Read a lazy watcher's value, recomputing it first if dirty.
    ///
    /// When called inside another computation, that computation inherits
    /// this watcher's dependencies.
    pub fn read(&self) -> Result<Value, ReactiveError> {
        if self.inner.dirty.get() {
            let value = self.evaluate()?;
            *self.inner.value.borrow_mut() = value;
            self.inner.dirty.set(false);
        }
        if ReactiveContext::is_active() {
            self.depend();
        }
        Ok(self.value())
    }

    /// Register every current dependency with the computation currently
    /// evaluating.
    pub fn depend(&self) {
        let deps: Vec<WeakSubject> = self.inner.deps.borrow().current.clone();
        for dep in deps.iter().rev() {
            if let Some(subject) = dep.upgrade() {
                subject.depend();
            }
        }
    }

    /// Detach from every subject and from the owner. Idempotent.
    pub fn teardown(&self) {
        if !self.inner.active.get() {
            return;
        }
        if let Some(owner) = self.owner() {
            if !owner.is_being_destroyed() {
                owner.unregister(self.inner.id);
            }
        }
        let deps = {
            let mut deps = self.inner.deps.borrow_mut();
            deps.current_ids.clear();
            std::mem::take(&mut deps.current)
        };
        for dep in deps {
            if let Some(subject) = dep.upgrade() {
                subject.unsubscribe(self.inner.id);
            }
        }
        self.inner.active.set(false);
        trace!(watcher = %self.inner.id, "torn down");
    }

    fn report(&self, err: &ReactiveError) {
        let _frame = ReactiveContext::untracked();
        match self.runtime() {
            Some(runtime) => runtime.report_error(err),
            None => tracing::error!(target: "trellis", error = %err, "reactive error"),
        }
    }

    /// Whether the owning runtime flushes inside each write.
    pub(crate) fn in_sync_runtime(&self) -> bool {
        self.inner.sync_runtime
    }

    pub(crate) fn downgrade(&self) -> WeakWatcher {
        WeakWatcher(Rc::downgrade(&self.inner))
    }
}

impl Job for Watcher {
    fn id(&self) -> NodeId {
        self.inner.id
    }

    fn before(&self) {
        if let Some(hook) = &self.inner.before {
            hook();
        }
    }

    fn run(&self) -> Result<(), ReactiveError> {
        Watcher::run(self)
    }

    fn describe(&self) -> String {
        self.inner.expression.clone()
    }
}

impl PartialEq for Watcher {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Watcher {}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("id", &self.inner.id)
            .field("expression", &self.inner.expression)
            .field("kind", &self.inner.kind)
            .field("active", &self.inner.active.get())
            .field("dirty", &self.inner.dirty.get())
            .finish()
    }
}

/// Non-owning handle held by subjects.
#[derive(Clone)]
pub struct WeakWatcher(Weak<WatcherInner>);

impl WeakWatcher {
    pub fn upgrade(&self) -> Option<Watcher> {
        self.0.upgrade().map(|inner| Watcher { inner })
    }

    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::value::Record;
    use std::cell::Cell;

    fn setup(pairs: &[(&str, Value)]) -> (Runtime, Owner) {
        let runtime = Runtime::new();
        let state: Record = pairs.iter().cloned().collect();
        let owner = Owner::new(&runtime, "Test", state);
        (runtime, owner)
    }

    #[test]
    fn evaluates_on_creation() {
        let (_rt, owner) = setup(&[("a", 1.into())]);
        let watcher = Watcher::effect(&owner, "a", WatcherOptions::new()).unwrap();
        assert_eq!(watcher.value(), Value::from(1));
        assert_eq!(watcher.dependency_count(), 1);
        assert!(owner.contains(watcher.id()));
    }

    #[test]
    fn lazy_watcher_defers_evaluation() {
        let (_rt, owner) = setup(&[("a", 2.into())]);
        let watcher = Watcher::computed(&owner, "a");
        assert!(watcher.is_dirty());
        assert!(watcher.value().is_undefined());
        assert_eq!(watcher.dependency_count(), 0);

        assert_eq!(watcher.read().unwrap(), Value::from(2));
        assert!(!watcher.is_dirty());
    }

    #[test]
    fn lazy_watcher_marks_dirty_on_write() {
        let (_rt, owner) = setup(&[("a", 2.into())]);
        let watcher = Watcher::computed(&owner, "a");
        watcher.read().unwrap();

        owner.state().set("a", 3).unwrap();
        assert!(watcher.is_dirty());
        assert_eq!(watcher.read().unwrap(), Value::from(3));
    }

    #[test]
    fn sync_watcher_runs_inside_the_write() {
        let (_rt, owner) = setup(&[("a", 1.into())]);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let _watcher = Watcher::new(
            &owner,
            "a",
            move |new, old| {
                sink.borrow_mut().push((new.clone(), old.clone()));
                Ok(())
            },
            WatcherOptions::new().sync(),
        )
        .unwrap();

        owner.state().set("a", 5).unwrap();
        assert_eq!(*seen.borrow(), vec![(Value::from(5), Value::from(1))]);
    }

    #[test]
    fn getter_error_propagates_for_internal_watchers() {
        let (_rt, owner) = setup(&[]);
        let err = Watcher::effect(
            &owner,
            Expression::new(|_| Err("boom".into())).with_label("broken"),
            WatcherOptions::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ReactiveError::Getter { ref expression, .. } if expression == "broken"));
        assert_eq!(owner.watcher_count(), 0);
    }

    #[test]
    fn getter_error_is_reported_for_user_watchers() {
        let (runtime, owner) = setup(&[]);
        let reported = Rc::new(Cell::new(0));
        let counter = reported.clone();
        runtime.set_error_handler(move |err| {
            assert!(err.is_user_error());
            counter.set(counter.get() + 1);
        });

        let watcher = Watcher::effect(
            &owner,
            Expression::new(|_| Err("boom".into())),
            WatcherOptions::new().user(),
        )
        .unwrap();
        assert!(watcher.value().is_undefined());
        assert_eq!(reported.get(), 1);
    }

    #[test]
    fn callback_error_is_swallowed_for_user_watchers() {
        let (runtime, owner) = setup(&[("a", 1.into())]);
        let reported = Rc::new(Cell::new(false));
        let flag = reported.clone();
        runtime.set_error_handler(move |err| {
            assert!(matches!(err, ReactiveError::Callback { .. }));
            flag.set(true);
        });

        let _watcher = Watcher::new(
            &owner,
            "a",
            |_, _| Err("callback failed".into()),
            WatcherOptions::new().user().sync(),
        )
        .unwrap();
        owner.state().set("a", 2).unwrap();
        assert!(reported.get());
    }

    #[test]
    fn callback_error_propagates_to_the_writer_for_sync_internal_watchers() {
        let (_rt, owner) = setup(&[("a", 1.into())]);
        let _watcher = Watcher::new(
            &owner,
            "a",
            |_, _| Err("callback failed".into()),
            WatcherOptions::new().sync(),
        )
        .unwrap();
        let err = owner.state().set("a", 2).unwrap_err();
        assert!(matches!(err, ReactiveError::Callback { .. }));
    }

    #[test]
    fn teardown_is_idempotent_and_detaches() {
        let (_rt, owner) = setup(&[("a", 1.into())]);
        let watcher = Watcher::effect(&owner, "a", WatcherOptions::new()).unwrap();
        watcher.teardown();
        watcher.teardown();
        assert!(!watcher.is_active());
        assert_eq!(watcher.dependency_count(), 0);
        assert!(!owner.contains(watcher.id()));
    }

    #[test]
    fn inactive_watcher_ignores_run() {
        let (_rt, owner) = setup(&[("a", 1.into())]);
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let watcher = Watcher::new(
            &owner,
            "a",
            move |_, _| {
                counter.set(counter.get() + 1);
                Ok(())
            },
            WatcherOptions::new(),
        )
        .unwrap();
        watcher.teardown();
        owner.state().set("a", 2).unwrap();
        watcher.run().unwrap();
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn weak_watcher_tracks_liveness() {
        let (_rt, owner) = setup(&[]);
        let watcher = Watcher::effect(&owner, Expression::new(|_| Ok(Value::Null)), WatcherOptions::new())
            .unwrap();
        let weak = watcher.downgrade();
        assert!(weak.is_alive());
        assert_eq!(weak.upgrade(), Some(watcher.clone()));
        drop(watcher);
        owner.destroy();
        assert!(!weak.is_alive());
    }
}

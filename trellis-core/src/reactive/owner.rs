//! Owner Context
//!
//! An Owner is the context computations belong to: it names them in
//! diagnostics, provides the root state their expressions resolve against,
//! connects them to a [`Runtime`], and keeps them alive.
//!
//! The root state record is observed as root data. While any owner uses a
//! record as its root, `set_field` refuses to add keys to it and
//! `delete_field` refuses to remove them.
//!
//! Watchers hold their owner weakly. Destroying the owner, or dropping its
//! last handle, tears every registered watcher down.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use tracing::debug;

use super::observer::attach_root;
use super::runtime::Runtime;
use super::value::{Record, Value};
use super::watcher::Watcher;
use crate::graph::NodeId;

struct OwnerInner {
    name: String,
    runtime: Runtime,
    state: Record,
    watchers: RefCell<IndexMap<NodeId, Watcher>>,
    being_destroyed: Cell<bool>,
    destroyed: Cell<bool>,
}

impl OwnerInner {
    fn shut_down(&self) {
        if self.destroyed.get() {
            return;
        }
        self.being_destroyed.set(true);
        let watchers = std::mem::take(&mut *self.watchers.borrow_mut());
        debug!(owner = %self.name, watchers = watchers.len(), "destroying owner");
        for watcher in watchers.values().rev() {
            watcher.teardown();
        }
        if let Some(observer) = self.state.observer() {
            observer.release_root(self.runtime.config().silent);
        }
        self.destroyed.set(true);
    }
}

impl Drop for OwnerInner {
    fn drop(&mut self) {
        self.shut_down();
    }
}

/// Owning context of a group of watchers.
///
/// Cloning an `Owner` yields another handle to the same context.
#[derive(Clone)]
pub struct Owner {
    inner: Rc<OwnerInner>,
}

impl Owner {
    /// Create an owner with `state` as its root state. The record is
    /// observed (if it is not already) and its root count incremented.
    /// Root-state diagnostics for it follow the runtime's `silent` flag.
    pub fn new(runtime: &Runtime, name: impl Into<String>, state: Record) -> Self {
        attach_root(&Value::Record(state.clone()), runtime.config().silent);
        Self {
            inner: Rc::new(OwnerInner {
                name: name.into(),
                runtime: runtime.clone(),
                state,
                watchers: RefCell::new(IndexMap::new()),
                being_destroyed: Cell::new(false),
                destroyed: Cell::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> &Record {
        &self.inner.state
    }

    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    /// Active watchers, in creation order.
    pub fn watchers(&self) -> Vec<Watcher> {
        self.inner.watchers.borrow().values().cloned().collect()
    }

    pub fn watcher_count(&self) -> usize {
        self.inner.watchers.borrow().len()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.inner.watchers.borrow().contains_key(&id)
    }

    /// Tear down every registered watcher and release the root state.
    /// Idempotent.
    pub fn destroy(&self) {
        self.inner.shut_down();
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.get()
    }

    pub(crate) fn is_being_destroyed(&self) -> bool {
        self.inner.being_destroyed.get()
    }

    pub(crate) fn register(&self, watcher: &Watcher) {
        self.inner
            .watchers
            .borrow_mut()
            .insert(watcher.id(), watcher.clone());
    }

    pub(crate) fn unregister(&self, id: NodeId) {
        self.inner.watchers.borrow_mut().shift_remove(&id);
    }

    pub(crate) fn downgrade(&self) -> WeakOwner {
        WeakOwner(Rc::downgrade(&self.inner))
    }
}

impl fmt::Debug for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Owner")
            .field("name", &self.inner.name)
            .field("watchers", &self.watcher_count())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// Non-owning handle held by watchers.
#[derive(Clone)]
pub(crate) struct WeakOwner(Weak<OwnerInner>);

impl WeakOwner {
    pub(crate) fn upgrade(&self) -> Option<Owner> {
        self.0.upgrade().map(|inner| Owner { inner })
    }
}

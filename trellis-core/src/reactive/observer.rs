//! Observer
//!
//! An [`Observer`] is attached to a container the first time it is observed
//! and turns it into reactive state:
//!
//! - every field of a [`Record`] is replaced by a [`ReactiveCell`] holding
//!   the value and a [`Subject`] for that field;
//! - every element of a [`Sequence`] is observed in turn, and the sequence's
//!   mutators start notifying the observer's shape subject.
//!
//! The observer's own subject stands for "the container's shape changed":
//! keys added or deleted through [`set_field`] / [`delete_field`], or
//! elements inserted, removed or reordered.
//!
//! # Reads
//!
//! Reading a reactive field registers the field's subject with the current
//! computation. If the value is itself an observed container, its shape
//! subject is registered too, so adding a key to a nested record re-runs
//! whoever read the record. Sequence elements cannot be tracked per index,
//! so reading a sequence-valued field also registers the shape subject of
//! every (nested) element container.
//!
//! # Observation Toggle
//!
//! [`set_observation_enabled`] suspends creation of *new* observers on this
//! thread. Containers that already carry one are unaffected.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::trace;

use super::context::ReactiveContext;
use super::subject::Subject;
use super::value::{Record, Sequence, Value};
use crate::diagnostics;
use crate::error::{Mutation, ReactiveError};

thread_local! {
    static SHOULD_OBSERVE: Cell<bool> = const { Cell::new(true) };
}

/// Enable or disable creation of new observers on this thread.
pub fn set_observation_enabled(enabled: bool) {
    SHOULD_OBSERVE.with(|flag| flag.set(enabled));
}

/// Whether new observers may currently be created.
pub fn is_observation_enabled() -> bool {
    SHOULD_OBSERVE.with(Cell::get)
}

/// Per-container reactive bookkeeping.
#[derive(Debug)]
pub struct Observer {
    subject: Subject,
    root_count: Cell<usize>,
    // Roots held by runtimes that report diagnostics.
    loud_roots: Cell<usize>,
}

impl Observer {
    fn new() -> Self {
        Self {
            subject: Subject::new(),
            root_count: Cell::new(0),
            loud_roots: Cell::new(0),
        }
    }

    /// The subject notified when the container's shape changes.
    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    /// How many owners use this container as their root state.
    pub fn root_count(&self) -> usize {
        self.root_count.get()
    }

    pub(crate) fn release_root(&self, silent: bool) {
        self.root_count.set(self.root_count.get().saturating_sub(1));
        if !silent {
            self.loud_roots.set(self.loud_roots.get().saturating_sub(1));
        }
    }

    /// Whether every owner using this container as root state belongs to
    /// a silent runtime.
    fn is_silent_root(&self) -> bool {
        self.root_count.get() > 0 && self.loud_roots.get() == 0
    }
}

/// Attach an observer to `value` if it is an observable container, or
/// return the one it already has.
///
/// Returns `None` for primitives, opaque handles, frozen or raw containers,
/// and, while observation is disabled, for containers not yet observed.
pub fn observe(value: &Value) -> Option<Rc<Observer>> {
    match value {
        Value::Record(record) => record
            .observer()
            .or_else(|| can_observe(record.is_frozen(), record.is_raw()).then(|| attach_record(record))),
        Value::Sequence(sequence) => sequence.observer().or_else(|| {
            can_observe(sequence.is_frozen(), sequence.is_raw()).then(|| attach_sequence(sequence))
        }),
        _ => None,
    }
}

/// Observe `value` as an owner's root state, incrementing the observer's
/// root count.
pub fn observe_root(value: &Value) -> Option<Rc<Observer>> {
    attach_root(value, false)
}

/// Root observation on behalf of a runtime. Root-state diagnostics for the
/// container are suppressed while all of its roots are silent.
pub(crate) fn attach_root(value: &Value, silent: bool) -> Option<Rc<Observer>> {
    let observer = observe(value)?;
    observer.root_count.set(observer.root_count.get() + 1);
    if !silent {
        observer.loud_roots.set(observer.loud_roots.get() + 1);
    }
    Some(observer)
}

pub(crate) fn observe_all(values: &[Value]) {
    for value in values {
        observe(value);
    }
}

fn can_observe(frozen: bool, raw: bool) -> bool {
    is_observation_enabled() && !frozen && !raw
}

fn attach_record(record: &Record) -> Rc<Observer> {
    let observer = Rc::new(Observer::new());
    // Attach before walking so cyclic references find the observer.
    record.attach_observer(observer.clone());
    for (key, value) in record.plain_entries() {
        record.install_cell(&key, Rc::new(ReactiveCell::new(value, false, None)));
    }
    trace!(subject = %observer.subject.id(), fields = record.len(), "observed record");
    observer
}

fn attach_sequence(sequence: &Sequence) -> Rc<Observer> {
    let observer = Rc::new(Observer::new());
    sequence.attach_observer(observer.clone());
    observe_all(&sequence.to_vec());
    trace!(subject = %observer.subject.id(), len = sequence.len(), "observed sequence");
    observer
}

// ----------------------------------------------------------------------------
// Reactive cells
// ----------------------------------------------------------------------------

/// Side-channel callback invoked with the new value on every effective
/// write to a reactive field.
pub type WriteHook = Rc<dyn Fn(&Value)>;

/// A reactive field: the stored value plus the subject tracking it.
pub struct ReactiveCell {
    subject: Subject,
    value: RefCell<Value>,
    child: RefCell<Option<Rc<Observer>>>,
    shallow: bool,
    on_write: Option<WriteHook>,
}

impl ReactiveCell {
    pub(crate) fn new(value: Value, shallow: bool, on_write: Option<WriteHook>) -> Self {
        let child = if shallow { None } else { observe(&value) };
        Self {
            subject: Subject::new(),
            value: RefCell::new(value),
            child: RefCell::new(child),
            shallow,
            on_write,
        }
    }

    /// Read the value, registering it with the current computation.
    pub fn get(&self) -> Value {
        let value = self.value.borrow().clone();
        if ReactiveContext::is_active() {
            self.subject.depend();
            let child = self.child.borrow().clone();
            if let Some(child) = child {
                child.subject().depend();
                if let Value::Sequence(sequence) = &value {
                    depend_elements(sequence);
                }
            }
        }
        value
    }

    /// Read the value without tracking.
    pub fn peek(&self) -> Value {
        self.value.borrow().clone()
    }

    /// Store a new value and notify dependents. Writing the same value is
    /// a no-op.
    pub fn set(&self, value: Value) -> Result<(), ReactiveError> {
        if self.value.borrow().same_value(&value) {
            return Ok(());
        }
        if let Some(hook) = &self.on_write {
            hook(&value);
        }
        let child = if self.shallow { None } else { observe(&value) };
        *self.value.borrow_mut() = value;
        *self.child.borrow_mut() = child;
        self.subject.notify()
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }
}

/// Register the shape subject of every element container, recursively
/// through nested sequences.
fn depend_elements(sequence: &Sequence) {
    for item in sequence.to_vec() {
        if let Some(observer) = item.observer() {
            observer.subject().depend();
        }
        if let Value::Sequence(inner) = &item {
            depend_elements(inner);
        }
    }
}

// ----------------------------------------------------------------------------
// Field-level API
// ----------------------------------------------------------------------------

/// Key addressing a record field or a sequence index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    Name(String),
    Index(usize),
}

impl Key {
    fn name(&self) -> String {
        match self {
            Key::Name(name) => name.clone(),
            Key::Index(index) => index.to_string(),
        }
    }

    fn index(&self) -> Option<usize> {
        match self {
            Key::Name(name) => name.parse().ok(),
            Key::Index(index) => Some(*index),
        }
    }
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Key::Name(name.to_owned())
    }
}

impl From<String> for Key {
    fn from(name: String) -> Self {
        Key::Name(name)
    }
}

impl From<usize> for Key {
    fn from(index: usize) -> Self {
        Key::Index(index)
    }
}

/// Install a reactive field on `record`, observing `value` if it is a
/// container. `on_write` is called with the new value on every effective
/// write.
pub fn define_reactive_field(
    record: &Record,
    key: &str,
    value: impl Into<Value>,
    on_write: Option<WriteHook>,
) {
    record.install_cell(key, Rc::new(ReactiveCell::new(value.into(), false, on_write)));
}

/// Like [`define_reactive_field`], but the stored value is never observed:
/// only replacing the whole value notifies.
pub fn define_reactive_field_shallow(
    record: &Record,
    key: &str,
    value: impl Into<Value>,
    on_write: Option<WriteHook>,
) {
    record.install_cell(key, Rc::new(ReactiveCell::new(value.into(), true, on_write)));
}

/// Largest run of `Undefined` holes a sequence index write may create.
pub const MAX_INDEX_GAP: usize = 1 << 16;

/// Reactive write that may add a key.
///
/// - On a sequence with an index key, replaces (or appends at) that index
///   through `splice`, so the sequence's dependents are notified. Indices
///   more than [`MAX_INDEX_GAP`] past the end are refused with a
///   diagnostic.
/// - On a record with an existing key, behaves like [`Record::set`].
/// - On an observed record with a new key, installs a reactive field and
///   notifies the record's shape subject. Unobserved records get a plain
///   field. Root-state records refuse new keys with a diagnostic.
/// - On anything else, emits a diagnostic and does nothing.
///
/// Returns the value that was written (or would have been).
pub fn set_field(
    target: &Value,
    key: impl Into<Key>,
    value: impl Into<Value>,
) -> Result<Value, ReactiveError> {
    let key = key.into();
    let value = value.into();
    match target {
        Value::Sequence(sequence) => {
            let Some(index) = key.index() else {
                diagnostics::warn(&ReactiveError::InvalidTarget {
                    mutation: Mutation::Set,
                    found: "sequence with a non-index key",
                });
                return Ok(value);
            };
            if index > sequence.len().saturating_add(MAX_INDEX_GAP) {
                diagnostics::warn(&ReactiveError::InvalidTarget {
                    mutation: Mutation::Set,
                    found: "sequence index far past its length",
                });
                return Ok(value);
            }
            if index > sequence.len() {
                sequence.set(index - 1, Value::Undefined);
            }
            sequence.splice(index, 1, vec![value.clone()])?;
            Ok(value)
        }
        Value::Record(record) => {
            let name = key.name();
            if record.contains_key(&name) {
                record.set(&name, value.clone())?;
                return Ok(value);
            }
            match record.observer() {
                Some(observer) if observer.root_count() > 0 => {
                    root_state_warning(&observer, &ReactiveError::RootStateField(name));
                    Ok(value)
                }
                Some(observer) => {
                    if !record.is_frozen() {
                        define_reactive_field(record, &name, value.clone(), None);
                        observer.subject().notify()?;
                    }
                    Ok(value)
                }
                None => {
                    record.set(&name, value.clone())?;
                    Ok(value)
                }
            }
        }
        other => {
            diagnostics::warn(&ReactiveError::InvalidTarget {
                mutation: Mutation::Set,
                found: other.type_name(),
            });
            Ok(value)
        }
    }
}

/// Reactive delete.
///
/// Removes a sequence index through `splice`, or removes a record key and
/// notifies the record's shape subject. Root-state records and
/// non-containers are refused with a diagnostic.
pub fn delete_field(target: &Value, key: impl Into<Key>) -> Result<(), ReactiveError> {
    let key = key.into();
    match target {
        Value::Sequence(sequence) => {
            let Some(index) = key.index() else {
                diagnostics::warn(&ReactiveError::InvalidTarget {
                    mutation: Mutation::Delete,
                    found: "sequence with a non-index key",
                });
                return Ok(());
            };
            sequence.splice(index, 1, Vec::new())?;
            Ok(())
        }
        Value::Record(record) => {
            let name = key.name();
            let observer = record.observer();
            if let Some(root) = observer.as_ref().filter(|ob| ob.root_count() > 0) {
                root_state_warning(root, &ReactiveError::RootStateDelete(name));
                return Ok(());
            }
            if record.remove(&name).is_none() {
                return Ok(());
            }
            match observer {
                Some(observer) => observer.subject().notify(),
                None => Ok(()),
            }
        }
        other => {
            diagnostics::warn(&ReactiveError::InvalidTarget {
                mutation: Mutation::Delete,
                found: other.type_name(),
            });
            Ok(())
        }
    }
}

fn root_state_warning(observer: &Observer, diagnostic: &ReactiveError) {
    diagnostics::emit(observer.is_silent_root() || diagnostics::is_silent(), diagnostic);
}

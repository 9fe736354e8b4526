//! Value Model
//!
//! Reactive state is made of plain [`Value`]s: primitives plus two shared
//! containers, [`Record`] (insertion-ordered keyed fields) and [`Sequence`]
//! (indexable list). Containers have reference semantics: cloning a
//! `Record` clones the handle, not the fields, so the same container can be
//! reachable from several places and is identified by address.
//!
//! # Fields and Cells
//!
//! A record field is either a plain slot or a reactive cell installed by
//! the observer layer. Code that reads or writes through [`Record::get`] and
//! [`Record::set`] does not need to know which: a reactive cell tracks the
//! read and notifies on write, a plain slot just stores.
//!
//! Adding a *new* key with [`Record::set`] is a plain insertion, invisible
//! to anything already watching the record. Use
//! [`set_field`](super::set_field) to add keys reactively.
//!
//! # Sequences
//!
//! Index reads ([`Sequence::get`], [`Sequence::len`]) are never tracked on
//! their own. The mutators (`push`, `pop`, `shift`, `unshift`, `splice`,
//! `sort`, `reverse`) notify the sequence's shape subject once observed.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use serde::ser::{Error as _, SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

use super::observer::{self, Observer, ReactiveCell};
use crate::error::ReactiveError;

/// A dynamically typed value held in reactive state.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(Rc<str>),
    Record(Record),
    Sequence(Sequence),
    /// A foreign handle that is never observed or traversed.
    Opaque(Opaque),
}

impl Value {
    /// Identity comparison used for write suppression and change detection.
    ///
    /// Primitives compare by value (`NaN` equals `NaN`); containers and
    /// opaque handles compare by identity.
    pub fn same_value(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Record(a), Value::Record(b)) => a.ptr_eq(b),
            (Value::Sequence(a), Value::Sequence(b)) => a.ptr_eq(b),
            (Value::Opaque(a), Value::Opaque(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    pub fn is_primitive(&self) -> bool {
        !self.is_object()
    }

    /// Records, sequences and opaque handles.
    pub fn is_object(&self) -> bool {
        matches!(self, Value::Record(_) | Value::Sequence(_) | Value::Opaque(_))
    }

    pub fn is_container(&self) -> bool {
        matches!(self, Value::Record(_) | Value::Sequence(_))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Short name of the value's type, used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Record(_) => "record",
            Value::Sequence(_) => "sequence",
            Value::Opaque(_) => "opaque",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&Sequence> {
        match self {
            Value::Sequence(s) => Some(s),
            _ => None,
        }
    }

    /// The observer attached to this value, if it is an observed container.
    pub fn observer(&self) -> Option<Rc<Observer>> {
        match self {
            Value::Record(r) => r.observer(),
            Value::Sequence(s) => s.observer(),
            _ => None,
        }
    }

    /// Whether this container has been frozen.
    pub fn is_frozen(&self) -> bool {
        match self {
            Value::Record(r) => r.is_frozen(),
            Value::Sequence(s) => s.is_frozen(),
            _ => false,
        }
    }

    /// Snapshot the value as JSON without registering dependencies.
    ///
    /// Fails on cyclic containers. Undefined and non-finite numbers become
    /// `null`; opaque handles are rejected.
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Address of the underlying container, for identity-keyed sets.
    pub(crate) fn container_addr(&self) -> Option<usize> {
        match self {
            Value::Record(r) => Some(Rc::as_ptr(&r.0) as *const () as usize),
            Value::Sequence(s) => Some(Rc::as_ptr(&s.0) as *const () as usize),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.same_value(other)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("Undefined"),
            Value::Null => f.write_str("Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Number(n) => write!(f, "Number({n})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::Record(r) => r.fmt(f),
            Value::Sequence(s) => s.fmt(f),
            Value::Opaque(o) => o.fmt(f),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Number(f64::from(value))
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Number(f64::from(value))
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value as f64)
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Value::Number(value as f64)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(Rc::from(value))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(Rc::from(value))
    }
}

impl From<Record> for Value {
    fn from(value: Record) -> Self {
        Value::Record(value)
    }
}

impl From<Sequence> for Value {
    fn from(value: Sequence) -> Self {
        Value::Sequence(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(values: Vec<Value>) -> Self {
        Value::Sequence(Sequence::from(values))
    }
}

impl From<Opaque> for Value {
    fn from(value: Opaque) -> Self {
        Value::Opaque(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::from(s),
            serde_json::Value::Array(items) => {
                Value::Sequence(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Record(
                map.into_iter()
                    .map(|(key, value)| (key, Value::from(value)))
                    .collect(),
            ),
        }
    }
}

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------

thread_local! {
    /// Containers currently being serialized, to reject cycles.
    static SERIALIZING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

struct CycleGuard(usize);

impl CycleGuard {
    fn enter(addr: usize) -> Option<Self> {
        SERIALIZING.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.contains(&addr) {
                None
            } else {
                stack.push(addr);
                Some(CycleGuard(addr))
            }
        })
    }
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        SERIALIZING.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|addr| *addr == self.0) {
                stack.remove(pos);
            }
        });
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Undefined | Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) => serializer.serialize_f64(*n),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Opaque(_) => Err(S::Error::custom("opaque values cannot be serialized")),
            Value::Record(record) => {
                let addr = self.container_addr().unwrap_or_default();
                let _guard = CycleGuard::enter(addr)
                    .ok_or_else(|| S::Error::custom("cyclic record"))?;
                let entries = record.entries_untracked();
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in &entries {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
            Value::Sequence(sequence) => {
                let addr = self.container_addr().unwrap_or_default();
                let _guard = CycleGuard::enter(addr)
                    .ok_or_else(|| S::Error::custom("cyclic sequence"))?;
                let items = sequence.to_vec();
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in &items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Opaque
// ----------------------------------------------------------------------------

/// A handle to a value owned by another subsystem (a rendered node, a
/// native resource). Opaque values are compared by identity and never
/// observed.
#[derive(Clone)]
pub struct Opaque(Rc<dyn Any>);

impl Opaque {
    pub fn new<T: Any>(value: T) -> Self {
        Self(Rc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    pub fn ptr_eq(&self, other: &Opaque) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Opaque(..)")
    }
}

// ----------------------------------------------------------------------------
// Record
// ----------------------------------------------------------------------------

/// Storage behind a record key.
#[derive(Clone)]
pub(crate) enum Slot {
    Plain(Value),
    Reactive(Rc<ReactiveCell>),
}

impl Slot {
    fn peek(&self) -> Value {
        match self {
            Slot::Plain(value) => value.clone(),
            Slot::Reactive(cell) => cell.peek(),
        }
    }
}

struct RecordInner {
    fields: RefCell<IndexMap<String, Slot>>,
    observer: RefCell<Option<Rc<Observer>>>,
    frozen: Cell<bool>,
    raw: Cell<bool>,
}

/// A shared keyed container with insertion-ordered fields.
#[derive(Clone)]
pub struct Record(Rc<RecordInner>);

impl Record {
    pub fn new() -> Self {
        Self(Rc::new(RecordInner {
            fields: RefCell::new(IndexMap::new()),
            observer: RefCell::new(None),
            frozen: Cell::new(false),
            raw: Cell::new(false),
        }))
    }

    /// Read a field. Reactive fields register the read with the current
    /// computation; missing keys read as `Undefined`.
    pub fn get(&self, key: &str) -> Value {
        let slot = self.0.fields.borrow().get(key).cloned();
        match slot {
            Some(Slot::Plain(value)) => value,
            Some(Slot::Reactive(cell)) => cell.get(),
            None => Value::Undefined,
        }
    }

    /// Read a field without registering a dependency.
    pub fn peek(&self, key: &str) -> Value {
        self.0
            .fields
            .borrow()
            .get(key)
            .map(Slot::peek)
            .unwrap_or_default()
    }

    /// Write a field.
    ///
    /// Existing reactive fields notify their dependents (unless the value is
    /// unchanged). Everything else is a plain store. Writes to a frozen
    /// record are ignored.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<(), ReactiveError> {
        if self.is_frozen() {
            return Ok(());
        }
        let value = value.into();
        let existing = self.0.fields.borrow().get(key).cloned();
        match existing {
            Some(Slot::Reactive(cell)) => cell.set(value),
            _ => {
                self.0
                    .fields
                    .borrow_mut()
                    .insert(key.to_owned(), Slot::Plain(value));
                Ok(())
            }
        }
    }

    /// Remove a field without notifying anyone. Use
    /// [`delete_field`](super::delete_field) for a reactive delete.
    pub fn remove(&self, key: &str) -> Option<Value> {
        if self.is_frozen() {
            return None;
        }
        self.0
            .fields
            .borrow_mut()
            .shift_remove(key)
            .map(|slot| slot.peek())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.fields.borrow().contains_key(key)
    }

    /// Field names in insertion order.
    pub fn keys(&self) -> Vec<String> {
        self.0.fields.borrow().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.0.fields.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.fields.borrow().is_empty()
    }

    /// Whether `key` is backed by a reactive cell.
    pub fn is_reactive(&self, key: &str) -> bool {
        matches!(self.0.fields.borrow().get(key), Some(Slot::Reactive(_)))
    }

    /// Make the record non-extensible: it will not be observed, and writes
    /// are ignored from now on.
    pub fn freeze(&self) {
        self.0.frozen.set(true);
    }

    pub fn is_frozen(&self) -> bool {
        self.0.frozen.get()
    }

    /// Exclude the record from observation.
    pub fn mark_raw(&self) {
        self.0.raw.set(true);
    }

    pub fn is_raw(&self) -> bool {
        self.0.raw.get()
    }

    pub fn observer(&self) -> Option<Rc<Observer>> {
        self.0.observer.borrow().clone()
    }

    pub fn ptr_eq(&self, other: &Record) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn attach_observer(&self, observer: Rc<Observer>) {
        *self.0.observer.borrow_mut() = Some(observer);
    }

    /// Keys and values of fields that are not yet reactive cells.
    pub(crate) fn plain_entries(&self) -> Vec<(String, Value)> {
        self.0
            .fields
            .borrow()
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Plain(value) => Some((key.clone(), value.clone())),
                Slot::Reactive(_) => None,
            })
            .collect()
    }

    pub(crate) fn entries_untracked(&self) -> Vec<(String, Value)> {
        self.0
            .fields
            .borrow()
            .iter()
            .map(|(key, slot)| (key.clone(), slot.peek()))
            .collect()
    }

    /// Install (or replace) a reactive cell under `key`, keeping the key's
    /// position if it already exists.
    pub(crate) fn install_cell(&self, key: &str, cell: Rc<ReactiveCell>) {
        self.0
            .fields
            .borrow_mut()
            .insert(key.to_owned(), Slot::Reactive(cell));
    }
}

impl Default for Record {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let record = Record::new();
        {
            let mut fields = record.0.fields.borrow_mut();
            for (key, value) in iter {
                fields.insert(key.into(), Slot::Plain(value.into()));
            }
        }
        record
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("keys", &self.keys())
            .field("observed", &self.observer().is_some())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Sequence
// ----------------------------------------------------------------------------

struct SequenceInner {
    items: RefCell<Vec<Value>>,
    observer: RefCell<Option<Rc<Observer>>>,
    frozen: Cell<bool>,
    raw: Cell<bool>,
}

/// A shared indexable container.
#[derive(Clone)]
pub struct Sequence(Rc<SequenceInner>);

impl Sequence {
    pub fn new() -> Self {
        Self::from(Vec::new())
    }

    /// Element at `index`, or `Undefined`. Not tracked.
    pub fn get(&self, index: usize) -> Value {
        self.0.items.borrow().get(index).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.0.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.items.borrow().is_empty()
    }

    /// Copy of the elements. Not tracked.
    pub fn to_vec(&self) -> Vec<Value> {
        self.0.items.borrow().clone()
    }

    /// Plain index write. Grows the sequence with `Undefined` if needed.
    /// Nothing is notified; use [`set_field`](super::set_field) for a
    /// reactive index write.
    pub fn set(&self, index: usize, value: impl Into<Value>) {
        if self.is_frozen() {
            return;
        }
        let mut items = self.0.items.borrow_mut();
        if index >= items.len() {
            items.resize(index + 1, Value::Undefined);
        }
        items[index] = value.into();
    }

    /// Append an element. Returns the new length.
    pub fn push(&self, value: impl Into<Value>) -> Result<usize, ReactiveError> {
        if self.is_frozen() {
            return Ok(self.len());
        }
        let value = value.into();
        let len = {
            let mut items = self.0.items.borrow_mut();
            items.push(value.clone());
            items.len()
        };
        self.after_mutation(&[value])?;
        Ok(len)
    }

    /// Remove the last element. Returns `Undefined` when empty.
    pub fn pop(&self) -> Result<Value, ReactiveError> {
        if self.is_frozen() {
            return Ok(Value::Undefined);
        }
        let popped = self.0.items.borrow_mut().pop().unwrap_or_default();
        self.after_mutation(&[])?;
        Ok(popped)
    }

    /// Remove the first element. Returns `Undefined` when empty.
    pub fn shift(&self) -> Result<Value, ReactiveError> {
        if self.is_frozen() {
            return Ok(Value::Undefined);
        }
        let shifted = {
            let mut items = self.0.items.borrow_mut();
            if items.is_empty() {
                Value::Undefined
            } else {
                items.remove(0)
            }
        };
        self.after_mutation(&[])?;
        Ok(shifted)
    }

    /// Insert an element at the front. Returns the new length.
    pub fn unshift(&self, value: impl Into<Value>) -> Result<usize, ReactiveError> {
        if self.is_frozen() {
            return Ok(self.len());
        }
        let value = value.into();
        let len = {
            let mut items = self.0.items.borrow_mut();
            items.insert(0, value.clone());
            items.len()
        };
        self.after_mutation(&[value])?;
        Ok(len)
    }

    /// Remove `delete_count` elements starting at `start` and insert
    /// `items` in their place. Out-of-range arguments are clamped. Returns
    /// the removed elements.
    pub fn splice(
        &self,
        start: usize,
        delete_count: usize,
        items: Vec<Value>,
    ) -> Result<Vec<Value>, ReactiveError> {
        if self.is_frozen() {
            return Ok(Vec::new());
        }
        let removed: Vec<Value> = {
            let mut current = self.0.items.borrow_mut();
            let start = start.min(current.len());
            let end = start.saturating_add(delete_count).min(current.len());
            current.splice(start..end, items.iter().cloned()).collect()
        };
        self.after_mutation(&items)?;
        Ok(removed)
    }

    /// Sort in place with the default value ordering: `null`, booleans,
    /// numbers, strings, containers, opaque handles, and `Undefined` last.
    pub fn sort(&self) -> Result<(), ReactiveError> {
        self.sort_by(default_order)
    }

    /// Sort in place with a comparator (stable).
    ///
    /// The comparator may read this sequence; it sees the unsorted
    /// contents until the sort completes.
    pub fn sort_by<F>(&self, compare: F) -> Result<(), ReactiveError>
    where
        F: FnMut(&Value, &Value) -> Ordering,
    {
        if self.is_frozen() {
            return Ok(());
        }
        let mut items = self.0.items.borrow().clone();
        items.sort_by(compare);
        *self.0.items.borrow_mut() = items;
        self.after_mutation(&[])
    }

    /// Reverse in place.
    pub fn reverse(&self) -> Result<(), ReactiveError> {
        if self.is_frozen() {
            return Ok(());
        }
        self.0.items.borrow_mut().reverse();
        self.after_mutation(&[])
    }

    pub fn freeze(&self) {
        self.0.frozen.set(true);
    }

    pub fn is_frozen(&self) -> bool {
        self.0.frozen.get()
    }

    pub fn mark_raw(&self) {
        self.0.raw.set(true);
    }

    pub fn is_raw(&self) -> bool {
        self.0.raw.get()
    }

    pub fn observer(&self) -> Option<Rc<Observer>> {
        self.0.observer.borrow().clone()
    }

    pub fn ptr_eq(&self, other: &Sequence) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn attach_observer(&self, observer: Rc<Observer>) {
        *self.0.observer.borrow_mut() = Some(observer);
    }

    /// Observe inserted elements and notify the shape subject. Unobserved
    /// sequences mutate silently.
    fn after_mutation(&self, inserted: &[Value]) -> Result<(), ReactiveError> {
        let Some(observer) = self.observer() else {
            return Ok(());
        };
        observer::observe_all(inserted);
        observer.subject().notify()
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Vec<Value>> for Sequence {
    fn from(items: Vec<Value>) -> Self {
        Self(Rc::new(SequenceInner {
            items: RefCell::new(items),
            observer: RefCell::new(None),
            frozen: Cell::new(false),
            raw: Cell::new(false),
        }))
    }
}

impl<V: Into<Value>> FromIterator<V> for Sequence {
    fn from_iter<I: IntoIterator<Item = V>>(iter: I) -> Self {
        Self::from(iter.into_iter().map(Into::into).collect::<Vec<_>>())
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sequence")
            .field("len", &self.len())
            .field("observed", &self.observer().is_some())
            .finish()
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::Str(_) => 3,
        Value::Record(_) => 4,
        Value::Sequence(_) => 5,
        Value::Opaque(_) => 6,
        Value::Undefined => 7,
    }
}

/// Ordering used by [`Sequence::sort`]: values of different types order by
/// type, `Undefined` sorts last.
pub fn default_order(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => x.total_cmp(y),
        (Value::Str(x), Value::Str(y)) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

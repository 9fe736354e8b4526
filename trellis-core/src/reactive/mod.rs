//! Reactive Primitives
//!
//! This module implements dependency tracking over mutable state: plain
//! records and sequences become reactive when observed, and watchers
//! re-run when what they read changes.
//!
//! # Concepts
//!
//! ## Subjects
//!
//! A [`Subject`] stands for one observable location: a reactive field, or
//! the shape of an observed container. Reading the location inside a
//! computation subscribes the computation; writing it notifies every
//! subscriber.
//!
//! ## Observers
//!
//! An [`Observer`] is attached to a container by [`observe`]. It replaces
//! a record's fields with reactive cells and makes a sequence's mutators
//! notify. Observation is idempotent and recursive.
//!
//! ## Watchers
//!
//! A [`Watcher`] evaluates an expression inside a [`ReactiveContext`],
//! collecting the subjects it reads. Depending on its options it re-runs
//! through the scheduler, re-runs immediately, or (lazy) only marks itself
//! dirty until read.
//!
//! ## Owners and the Runtime
//!
//! An [`Owner`] groups watchers around a root state record; a [`Runtime`]
//! holds the scheduler and the tick host that drive them.
//!
//! # Implementation Notes
//!
//! Everything is single-threaded and uses `Rc`/`RefCell`. Subjects hold
//! their subscribers weakly and watchers hold their subjects weakly; only
//! an owner's registry keeps a watcher alive.

mod context;
mod observer;
mod owner;
mod path;
mod runtime;
mod subject;
mod traverse;
mod value;
mod watcher;

pub use context::{untracked, ReactiveContext};
pub use observer::{
    define_reactive_field, define_reactive_field_shallow, delete_field, is_observation_enabled,
    observe, observe_root, set_field, set_observation_enabled, Key, Observer, ReactiveCell,
    WriteHook, MAX_INDEX_GAP,
};
pub use owner::Owner;
pub use path::{is_valid_path, parse_path, resolve};
pub use runtime::{ErrorHandler, Runtime};
pub use subject::{Subject, SubjectId};
pub use traverse::touch;
pub use value::{default_order, Opaque, Record, Sequence, Value};
pub use watcher::{
    BeforeHook, Expression, Getter, Reaction, WatcherOptions, WeakWatcher, Watcher,
};

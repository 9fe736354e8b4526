//! Trellis Core
//!
//! This crate provides the core runtime for Trellis, a fine-grained
//! reactive state tracker. It implements:
//!
//! - Observation of plain records and sequences
//! - Automatic dependency tracking for computations (watchers)
//! - Batched, ordered re-runs through an update scheduler
//! - Lazy derived values that recompute only when read after a change
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: values, observers, subjects, watchers and the runtime
//! - `graph`: node identity, the update scheduler and tick hosts
//! - `config`, `error`, `diagnostics`: ambient configuration, error types
//!   and the warning channel
//!
//! # Example
//!
//! ```rust
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! use trellis_core::reactive::{Owner, Record, Runtime, Value, Watcher, WatcherOptions};
//!
//! let runtime = Runtime::new();
//! let state: Record = [("count", Value::from(1))].into_iter().collect();
//! let owner = Owner::new(&runtime, "Counter", state);
//!
//! let seen = Rc::new(RefCell::new(Vec::new()));
//! let sink = seen.clone();
//! let _watcher = Watcher::new(
//!     &owner,
//!     "count",
//!     move |new, _old| {
//!         sink.borrow_mut().push(new.clone());
//!         Ok(())
//!     },
//!     WatcherOptions::new(),
//! )
//! .unwrap();
//!
//! owner.state().set("count", 2).unwrap();
//! owner.state().set("count", 3).unwrap();
//! runtime.tick().unwrap();
//!
//! // Two writes, one batched re-run.
//! assert_eq!(*seen.borrow(), vec![Value::from(3)]);
//! ```

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod graph;
pub mod reactive;

pub use config::Config;
pub use error::{EvalError, Mutation, ReactiveError};

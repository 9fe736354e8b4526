//! Error Types
//!
//! Everything that can go wrong inside the reactive core is a
//! [`ReactiveError`]. User-supplied expressions and reaction callbacks
//! report failure with the lighter [`EvalError`], which the core wraps with
//! context (which expression, which owner) before reporting or propagating.
//!
//! # Taxonomy
//!
//! - Expression errors: [`ReactiveError::Getter`]
//! - Reaction-callback errors: [`ReactiveError::Callback`]
//! - Runaway updates: [`ReactiveError::RunawayUpdate`]
//! - Misuse: [`ReactiveError::InvalidTarget`], [`ReactiveError::RootStateField`],
//!   [`ReactiveError::RootStateDelete`], [`ReactiveError::InvalidPath`]

use std::fmt;

use thiserror::Error;

use crate::graph::NodeId;

/// Error returned by user expressions and reaction callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct EvalError {
    message: String,
}

impl EvalError {
    /// Create an error carrying the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<&str> for EvalError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for EvalError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// The mutation a misuse diagnostic refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    Set,
    Delete,
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mutation::Set => f.write_str("set"),
            Mutation::Delete => f.write_str("delete"),
        }
    }
}

/// Errors and diagnostics produced by the reactive core.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReactiveError {
    /// A watcher's tracked expression failed.
    #[error("error in getter for watcher \"{expression}\" in {owner}: {source}")]
    Getter {
        owner: String,
        expression: String,
        #[source]
        source: EvalError,
    },

    /// A watcher's reaction callback failed.
    #[error("error in callback for watcher \"{expression}\" in {owner}: {source}")]
    Callback {
        owner: String,
        expression: String,
        #[source]
        source: EvalError,
    },

    /// A watcher kept re-queueing itself within a single flush.
    #[error(
        "you may have an infinite update loop in watcher with expression \"{expression}\" \
         (re-queued {count} times in one flush)"
    )]
    RunawayUpdate {
        watcher: NodeId,
        expression: String,
        count: usize,
    },

    /// `set_field` / `delete_field` called on a non-container.
    #[error("cannot {mutation} reactive property on undefined, null, or primitive value: {found}")]
    InvalidTarget {
        mutation: Mutation,
        found: &'static str,
    },

    /// Adding a key to a record used as an owner's root state.
    #[error(
        "avoid adding reactive key \"{0}\" to a root state record at runtime - \
         declare it upfront instead"
    )]
    RootStateField(String),

    /// Deleting a key from a record used as an owner's root state.
    #[error("avoid deleting key \"{0}\" from a root state record - set it to null instead")]
    RootStateDelete(String),

    /// A watcher was created from a path that is not a simple dot path.
    #[error("failed watching path \"{0}\": only simple dot-delimited paths are accepted")]
    InvalidPath(String),
}

impl ReactiveError {
    /// Whether this error was raised by user code (getter or callback)
    /// rather than by the runtime itself.
    pub fn is_user_error(&self) -> bool {
        matches!(self, ReactiveError::Getter { .. } | ReactiveError::Callback { .. })
    }
}

//! Graph Nodes
//!
//! Identity and scheduling mode for computation nodes. The ids double as
//! the scheduler's sort key: nodes created earlier (parents, non-rendering
//! reactions of an owner) always carry smaller ids.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a computation node.
///
/// Ids are handed out from a process-wide monotonically increasing counter,
/// so ordering by id is ordering by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a node reacts when one of its dependencies notifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Re-run in the next scheduler flush (the default).
    Queued,

    /// Only mark dirty; recompute on the next read.
    Lazy,

    /// Re-run immediately, inside the writer's call stack.
    Immediate,
}

impl NodeKind {
    /// Resolve the kind from the `lazy` and `sync` option flags.
    /// `lazy` wins when both are set.
    pub fn from_flags(lazy: bool, sync: bool) -> Self {
        match (lazy, sync) {
            (true, _) => NodeKind::Lazy,
            (false, true) => NodeKind::Immediate,
            (false, false) => NodeKind::Queued,
        }
    }
}

//! Subject
//!
//! A Subject is the notification hub for one observable location: a
//! reactive field, or the shape of an observed container. It keeps the
//! ordered list of watchers currently interested in it.
//!
//! Subjects hold their subscribers weakly. A watcher is owned by its
//! [`Owner`](super::Owner); a subject only needs to reach it while it is
//! alive, and a dead entry is simply skipped.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;
use tracing::trace;

use super::context::ReactiveContext;
use super::watcher::{WeakWatcher, Watcher};
use crate::error::ReactiveError;
use crate::graph::NodeId;

/// Unique identifier for a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubjectId(u64);

impl SubjectId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

struct SubjectInner {
    id: SubjectId,
    subscribers: RefCell<Vec<(NodeId, WeakWatcher)>>,
}

/// Notification hub for one observable location.
///
/// Cloning a `Subject` yields another handle to the same hub.
#[derive(Clone)]
pub struct Subject {
    inner: Rc<SubjectInner>,
}

impl Subject {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(SubjectInner {
                id: SubjectId::next(),
                subscribers: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> SubjectId {
        self.inner.id
    }

    /// Add a subscriber. A watcher already subscribed is not added again.
    pub fn subscribe(&self, watcher: &Watcher) {
        let mut subscribers = self.inner.subscribers.borrow_mut();
        if subscribers.iter().any(|(id, _)| *id == watcher.id()) {
            return;
        }
        trace!(subject = %self.inner.id, watcher = %watcher.id(), "subscribe");
        subscribers.push((watcher.id(), watcher.downgrade()));
    }

    /// Remove a subscriber by id.
    pub fn unsubscribe(&self, watcher: NodeId) {
        self.inner
            .subscribers
            .borrow_mut()
            .retain(|(id, _)| *id != watcher);
    }

    /// Register this subject with the computation currently evaluating,
    /// if any.
    pub fn depend(&self) {
        if let Some(target) = ReactiveContext::current() {
            target.add_dep(self);
        }
    }

    /// Invalidate every subscriber, in subscription order.
    ///
    /// Works on a snapshot of the list: subscribers added or removed while
    /// notifying do not affect this round. Stops at the first error.
    ///
    /// A sync runtime flushes inside each invalidation, so no queue sorts
    /// its watchers; they are invalidated in id order instead.
    pub fn notify(&self) -> Result<(), ReactiveError> {
        let mut snapshot: SmallVec<[Watcher; 8]> = {
            let mut subscribers = self.inner.subscribers.borrow_mut();
            subscribers.retain(|(_, weak)| weak.is_alive());
            subscribers
                .iter()
                .filter_map(|(_, weak)| weak.upgrade())
                .collect()
        };
        if snapshot.iter().any(Watcher::in_sync_runtime) {
            snapshot.sort_by_key(|watcher| watcher.id());
        }
        for watcher in snapshot {
            watcher.invalidate()?;
        }
        Ok(())
    }

    /// Ids of the current subscribers, in order.
    pub fn subscriber_ids(&self) -> Vec<NodeId> {
        self.inner
            .subscribers
            .borrow()
            .iter()
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.borrow().len()
    }

    pub(crate) fn downgrade(&self) -> WeakSubject {
        WeakSubject {
            id: self.inner.id,
            inner: Rc::downgrade(&self.inner),
        }
    }
}

impl Default for Subject {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subject")
            .field("id", &self.inner.id)
            .field("subscribers", &self.subscriber_ids())
            .finish()
    }
}

/// Non-owning reference from a watcher back to a subject it depends on.
#[derive(Clone)]
pub(crate) struct WeakSubject {
    id: SubjectId,
    inner: Weak<SubjectInner>,
}

impl WeakSubject {
    pub(crate) fn id(&self) -> SubjectId {
        self.id
    }

    pub(crate) fn upgrade(&self) -> Option<Subject> {
        self.inner.upgrade().map(|inner| Subject { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_ids_are_unique() {
        let s1 = Subject::new();
        let s2 = Subject::new();
        assert_ne!(s1.id(), s2.id());
    }

    #[test]
    fn depend_outside_a_computation_is_a_noop() {
        let subject = Subject::new();
        subject.depend();
        assert_eq!(subject.subscriber_count(), 0);
        assert!(subject.notify().is_ok());
    }

    #[test]
    fn clone_shares_subscribers() {
        let subject = Subject::new();
        let other = subject.clone();
        assert_eq!(subject.id(), other.id());
    }

    #[test]
    fn weak_subject_dies_with_subject() {
        let subject = Subject::new();
        let weak = subject.downgrade();
        assert!(weak.upgrade().is_some());
        drop(subject);
        assert!(weak.upgrade().is_none());
    }
}

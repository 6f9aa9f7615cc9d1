//! Per-thread grey-object worklists.
//!
//! A worklist is an unordered bag behind its own lock. Collector threads
//! push and pop locally. Mutators only push: the push that takes a list from
//! empty to non-empty publishes it to the collector's registry, where an idle
//! collector thread steals the whole content with [`Worklist::move_work`].
//!
//! Lock order is worklist, then registry: publication happens while the list
//! lock is held, so a collector that finds the registry empty under the
//! registry lock knows no unpublished non-empty mutator list exists.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::tagged::ObjectRef;

/// A bag of discovered but unscanned objects.
#[derive(Default)]
pub struct Worklist {
    work: Mutex<Vec<ObjectRef>>,
}

impl Worklist {
    /// Creates an empty worklist.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes work found by a collector thread; never publishes.
    pub fn add_work_gc(&self, obj: ObjectRef) {
        self.work.lock().push(obj);
    }

    /// Pushes work found by a mutator.
    ///
    /// On the empty to non-empty transition `publish` is called with the
    /// list lock held. If it declines (marking already finished), the list is
    /// cleared: everything reachable has been marked by then.
    pub fn add_work_mutator(self: &Arc<Self>, obj: ObjectRef, publish: impl FnOnce(Arc<Self>) -> bool) {
        let mut work = self.work.lock();
        let was_empty = work.is_empty();
        work.push(obj);
        if was_empty && !publish(Arc::clone(self)) {
            work.clear();
        }
    }

    /// Pops one object.
    #[must_use]
    pub fn get_work(&self) -> Option<ObjectRef> {
        self.work.lock().pop()
    }

    /// Moves all work from `self` into `into`; returns how much moved.
    pub fn move_work(&self, into: &Self) -> usize {
        let taken = std::mem::take(&mut *self.work.lock());
        let moved = taken.len();
        if moved > 0 {
            into.work.lock().extend(taken);
        }
        moved
    }

    /// Whether no work is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.work.lock().is_empty()
    }

    /// Number of pending objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.work.lock().len()
    }
}

impl fmt::Debug for Worklist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worklist").field("len", &self.len()).finish()
    }
}

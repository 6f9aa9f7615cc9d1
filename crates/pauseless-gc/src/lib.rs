//! A concurrent, relocating, mostly pause-free garbage collector.
//!
//! `pauseless-gc` manages a heap of fixed-size pages shared by any number of
//! mutator threads and a pool of collector threads. Collection never stops
//! the world: mutators are asked, one at a time, to mark their roots, pass a
//! checkpoint and acknowledge relocation, and keep running in between.
//!
//! # How it works
//!
//! - **Paged heap**: objects are bump-allocated into pages owned by one
//!   thread at a time. A full page goes to a pool the collector picks from.
//! - **NMT read barrier**: every reference word carries a "not marked
//!   through" bit. Loading a reference whose bit differs from the thread's
//!   expectation queues the referent for marking and heals the word in place.
//! - **Checkpointed tracing**: collector threads drain and steal worklists;
//!   marking ends when every collector is idle and every mutator has passed
//!   a checkpoint without publishing new work.
//! - **Lazy relocation**: sparse pages are blocked and their live objects
//!   cloned out, by a collector thread or by whichever thread first loads a
//!   reference into them. A per-page side array makes the move idempotent.
//!
//! # Quick Start
//!
//! ```no_run
//! use pauseless_gc::{Heap, HeapConfig, ObjectShape, Value};
//!
//! let heap = Heap::new(HeapConfig::default().with_gc_threads(2))?;
//! let mut m = heap.mutator();
//!
//! // A two-element linked list.
//! let tail = m.allocate(ObjectShape::new(1, 1));
//! m.write_word(tail, 0, 2);
//! let head = m.allocate(ObjectShape::new(1, 1));
//! m.write_word(head, 0, 1);
//! m.write_field(head, 0, Value::Object(tail));
//! let root = m.push_root(Value::Object(head));
//!
//! m.collect();
//!
//! // References in locals are stale after a collection; reload from roots.
//! let head = m.root(root).as_object().unwrap();
//! let tail = m.read_field(head, 0).as_object().unwrap();
//! assert_eq!(m.read_word(tail, 0), 2);
//! # Ok::<(), pauseless_gc::HeapError>(())
//! ```
//!
//! # Threading
//!
//! A [`Mutator`] is `Send` and serves one thread at a time. It must call
//! [`Mutator::safepoint`] regularly and wrap long waits in
//! [`Mutator::blocking`]; a mutator that does neither stalls the collector.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod barrier;
mod collector;
mod config;
mod error;
mod heap;
mod metrics;
mod mutator;
mod object;
mod page;
mod paged_heap;
mod relocation;
mod rendezvous;
mod tagged;
mod verify;
mod worklist;

/// Structured tracing hooks.
pub mod tracing;

pub use config::{HeapConfig, MIN_PAGE_SIZE};
pub use error::HeapError;
pub use heap::Heap;
pub use metrics::{CycleMetrics, HeapStats};
pub use mutator::Mutator;
pub use object::{ObjectShape, HEADER_WORDS, MIN_OBJECT_SIZE};
pub use page::{PageId, PageInfo, PageState};
pub use tagged::{GcField, ObjectRef, Value, OBJECT_ALIGNMENT};
pub use verify::MarkingError;

#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod test_util {
    use crate::{Heap, Mutator, ObjectRef};

    pub use crate::worklist::Worklist;

    /// NMT bit of reference slot `index` of `obj`, or `None` if the slot
    /// holds no pointer. Reads the raw word without a barrier.
    #[must_use]
    pub fn slot_nmt(heap: &Heap, obj: ObjectRef, index: usize) -> Option<bool> {
        heap.inner().pages.object(obj).slot(index).load().as_pointer().map(|(_, nmt)| nmt)
    }

    /// Marks `m`'s roots if the collector asked for them, leaving other
    /// requests pending. Returns whether it did.
    pub fn mark_roots_only(m: &mut Mutator) -> bool {
        m.mark_roots_only()
    }

    /// Takes `m`'s pending checkpoint request without passing it.
    pub fn take_checkpoint(m: &Mutator) -> Option<u64> {
        m.take_checkpoint()
    }

    /// Counts `m` past checkpoint `id`.
    pub fn pass_checkpoint(m: &Mutator, id: u64) {
        m.pass_checkpoint(id);
    }

    /// Queues `obj` on `m`'s worklist the way a barrier does, publishing
    /// the list if it was empty.
    pub fn publish_work(m: &Mutator, obj: ObjectRef) {
        m.publish_work(obj);
    }

    /// Whether `m` has its GC trap enabled.
    #[must_use]
    pub fn gc_trap_enabled(m: &Mutator) -> bool {
        m.gc_trap_enabled()
    }

    /// NMT value mutators expect once cycle `cycle` has flipped them.
    #[must_use]
    pub const fn nmt_for_cycle(cycle: u64) -> bool {
        crate::tagged::nmt_for_cycle(cycle)
    }
}

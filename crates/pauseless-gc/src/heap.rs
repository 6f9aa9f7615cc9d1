//! The public heap facade.

use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::collector::{self, CollectorContext};
use crate::config::HeapConfig;
use crate::error::HeapError;
use crate::metrics::{CycleMetrics, HeapStats};
use crate::mutator::Mutator;
use crate::object::Slot;
use crate::page::{PageId, PageInfo};
use crate::paged_heap::PagedHeap;
use crate::tagged::{ObjectRef, RawRef};
use crate::verify::{verify_marking, MarkingError};

/// Everything a heap's threads share.
pub(crate) struct HeapInner {
    pub(crate) config: HeapConfig,
    pub(crate) pages: PagedHeap,
    pub(crate) collector: CollectorContext,
    /// Slots are shared out so a barrier never runs under this lock.
    pub(crate) globals: Mutex<Vec<Arc<Slot>>>,
}

impl HeapInner {
    pub(crate) fn new(config: HeapConfig) -> Result<Self, HeapError> {
        let pages = PagedHeap::new(&config)?;
        Ok(Self {
            collector: CollectorContext::new(config.gc_threads),
            pages,
            config,
            globals: Mutex::new(Vec::new()),
        })
    }

    /// Global slot `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub(crate) fn global_slot(&self, index: usize) -> Arc<Slot> {
        Arc::clone(&self.globals.lock()[index])
    }
}

/// A garbage-collected heap and its collector threads.
///
/// Dropping the heap lets any requested cycle finish and joins the
/// collector threads, so every [`Mutator`] should be dropped (or parked in a
/// blocking section) first.
///
/// ```no_run
/// use pauseless_gc::{Heap, HeapConfig, ObjectShape, Value};
///
/// let heap = Heap::new(HeapConfig::default())?;
/// let mut m = heap.mutator();
///
/// let list = m.allocate(ObjectShape::new(1, 1));
/// m.write_word(list, 0, 42);
/// let root = m.push_root(Value::Object(list));
///
/// m.collect();
///
/// let list = m.root(root).as_object().unwrap();
/// assert_eq!(m.read_word(list, 0), 42);
/// # Ok::<(), pauseless_gc::HeapError>(())
/// ```
pub struct Heap {
    inner: Arc<HeapInner>,
    collectors: Vec<JoinHandle<()>>,
}

impl Heap {
    /// Reserves the heap and starts `config.gc_threads` collector threads.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the address space
    /// cannot be reserved or a thread cannot be started.
    pub fn new(config: HeapConfig) -> Result<Self, HeapError> {
        let inner = Arc::new(HeapInner::new(config)?);
        let collectors = collector::spawn(&inner)?;
        Ok(Self { inner, collectors })
    }

    /// Registers a new mutator.
    ///
    /// The mutator may be moved to another thread but is used by one
    /// thread at a time.
    #[must_use]
    pub fn mutator(&self) -> Mutator {
        Mutator::register(Arc::clone(&self.inner))
    }

    /// Adds a global root slot, initially null; returns its index.
    ///
    /// Globals are read and written through a [`Mutator`].
    pub fn add_global(&self) -> usize {
        let mut globals = self.inner.globals.lock();
        globals.push(Arc::new(Slot::new(RawRef::NULL)));
        globals.len() - 1
    }

    /// Runs a full cycle that starts after this call and waits for it.
    ///
    /// Must not be called from a thread whose mutator is outside a blocking
    /// section; use [`Mutator::collect`] there.
    pub fn full_gc(&self) {
        self.inner.collector.full_gc();
    }

    /// Asks for a cycle without waiting for it.
    pub fn request_collection(&self) {
        self.inner.collector.request_collection();
    }

    /// Completed cycles.
    #[must_use]
    pub fn cycles(&self) -> u64 {
        self.inner.collector.completed()
    }

    /// Mark value of the running or next cycle.
    #[must_use]
    pub fn mark_value(&self) -> u64 {
        self.inner.collector.mark_value()
    }

    /// Metrics of the most recent completed cycle.
    #[must_use]
    pub fn last_cycle_metrics(&self) -> Option<CycleMetrics> {
        self.inner.collector.metrics.last()
    }

    /// Snapshot of page pools and cumulative counters.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let inner = &*self.inner;
        let metrics = &inner.collector.metrics;
        HeapStats {
            cycles: inner.collector.completed(),
            mark_value: inner.collector.mark_value(),
            mutators: inner.collector.registry.lock().mutators.len(),
            max_pages: inner.pages.max_pages(),
            pages_in_use: inner.pages.pages_in_use(),
            pages_available: inner.pages.available_page_count(),
            pages_full: inner.pages.full_page_count(),
            pages_non_relocatable: inner.pages.non_relocatable_page_count(),
            pages_parked: inner.pages.parked_page_count(),
            pages_materialized: inner.pages.materialized_pages(),
            barrier_heals: metrics.barrier_heals(),
            clones_installed: metrics.clones_installed(),
            clone_races_lost: metrics.clone_races_lost(),
        }
    }

    /// Snapshot of one page, or `None` if `id` is out of range.
    #[must_use]
    pub fn page_info(&self, id: PageId) -> Option<PageInfo> {
        self.inner.pages.page_info(id)
    }

    /// Page containing `obj`.
    ///
    /// # Panics
    ///
    /// Panics if `obj` does not point into this heap.
    #[must_use]
    pub fn page_of(&self, obj: ObjectRef) -> PageId {
        self.inner.pages.page_of(obj).id()
    }

    /// Checks that everything reachable from the roots carries the last
    /// completed cycle's stamp; returns how many objects were visited.
    ///
    /// Only meaningful while no mutator is running and no cycle is in
    /// progress.
    ///
    /// # Errors
    ///
    /// Returns the first reachable object with a different GC field.
    pub fn verify_marking(&self) -> Result<usize, MarkingError> {
        verify_marking(&self.inner)
    }

    #[cfg(any(test, feature = "test-util"))]
    pub(crate) fn inner(&self) -> &HeapInner {
        &self.inner
    }

    /// The configuration the heap was built with.
    #[must_use]
    pub fn config(&self) -> &HeapConfig {
        &self.inner.config
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        collector::shutdown(&self.inner, std::mem::take(&mut self.collectors));
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

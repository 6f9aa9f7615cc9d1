//! Mutator thread contexts.
//!
//! A [`Mutator`] is one thread's handle on a heap: it owns an allocation
//! page, a root stack and a worklist, and runs the read barrier on every
//! reference load. The collector talks to it through [`MutatorShared`], the
//! half that lives in the heap's registry.
//!
//! Requests from the collector (mark your roots, pass a checkpoint, enable
//! your GC trap) are queued under the shared state lock and serviced at the
//! next [`Mutator::safepoint`]. A mutator inside [`Mutator::blocking`]
//! cannot answer, so the collector does the work on its behalf instead.
//!
//! # Reference validity
//!
//! An [`ObjectRef`] held in a Rust local stays valid until the mutator's next
//! safepoint poll: [`safepoint`](Mutator::safepoint),
//! [`blocking`](Mutator::blocking) or [`collect`](Mutator::collect).
//! Anything needed across a poll belongs in a root slot.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::barrier::{read_barrier, resolve, write_barrier, GcThread};
use crate::collector::CollectorContext;
use crate::error::{fatal, HeapError};
use crate::heap::HeapInner;
use crate::object::{ObjectShape, Slot};
use crate::page::PageId;
use crate::paged_heap::PageAllocator;
use crate::tagged::{nmt_for_cycle, GcField, ObjectRef, RawRef, Value};
use crate::worklist::Worklist;

// ============================================================================
// MutatorShared - the collector-facing half
// ============================================================================

/// Requests waiting for the mutator's next poll.
#[derive(Debug, Default)]
struct Pending {
    root_mark: Option<u64>,
    safepoint: Option<u64>,
    enable_trap: bool,
}

#[derive(Debug, Default)]
struct MutatorState {
    blocked: bool,
    pending: Pending,
}

/// The part of a mutator the collector can reach.
pub(crate) struct MutatorShared {
    id: usize,
    expected_nmt: AtomicBool,
    alloc_epoch: AtomicU64,
    trap_enabled: AtomicBool,
    has_pending: AtomicBool,
    state: Mutex<MutatorState>,
    roots: Mutex<Vec<Slot>>,
    worklist: Arc<Worklist>,
}

impl MutatorShared {
    /// A mutator joining while `cycle` is the latest signalled cycle.
    fn new(id: usize, cycle: u64) -> Self {
        Self {
            id,
            expected_nmt: AtomicBool::new(nmt_for_cycle(cycle)),
            alloc_epoch: AtomicU64::new(cycle),
            trap_enabled: AtomicBool::new(true),
            has_pending: AtomicBool::new(false),
            state: Mutex::new(MutatorState::default()),
            roots: Mutex::new(Vec::new()),
            worklist: Arc::new(Worklist::new()),
        }
    }

    pub(crate) const fn id(&self) -> usize {
        self.id
    }

    fn queue(&self, state: &mut MutatorState, update: impl FnOnce(&mut Pending)) {
        update(&mut state.pending);
        self.has_pending.store(true, Ordering::Release);
    }

    fn take_pending(&self, state: &mut MutatorState) -> Pending {
        self.has_pending.store(false, Ordering::Relaxed);
        std::mem::take(&mut state.pending)
    }

    /// Asks for the root set to be marked for `cycle`.
    ///
    /// Returns `true` if the mutator is blocked and a collector thread must
    /// mark the roots on its behalf.
    pub(crate) fn trigger_mark_root_set(&self, cycle: u64) -> bool {
        let mut state = self.state.lock();
        debug_assert!(
            state.pending.root_mark.is_none(),
            "mutator {} asked to mark roots twice",
            self.id
        );
        if state.blocked {
            state.pending.root_mark = Some(cycle);
            true
        } else {
            self.queue(&mut state, |p| p.root_mark = Some(cycle));
            false
        }
    }

    /// Asks the mutator to pass checkpoint `id`; a blocked mutator counts
    /// as passed immediately.
    pub(crate) fn request_safe_point(&self, ctx: &CollectorContext, id: u64) {
        let mut state = self.state.lock();
        if state.blocked {
            drop(state);
            ctx.signal_safepoint_reached(id);
        } else {
            self.queue(&mut state, |p| p.safepoint = Some(id));
        }
    }

    pub(crate) fn disable_gc_trap(&self) {
        self.trap_enabled.store(false, Ordering::Release);
    }

    /// Asks the mutator to re-enable its GC trap and acknowledge.
    pub(crate) fn signal_enable_gc_trap(&self, ctx: &CollectorContext) {
        let mut state = self.state.lock();
        if state.blocked {
            self.trap_enabled.store(true, Ordering::Release);
            drop(state);
            ctx.trap_acks.arrive();
        } else {
            self.queue(&mut state, |p| p.enable_trap = true);
        }
    }

    /// Queues `obj` on the mutator's worklist, publishing the list to the
    /// collector if it was empty.
    pub(crate) fn add_gc_work(&self, heap: &HeapInner, obj: ObjectRef) {
        self.worklist
            .add_work_mutator(obj, |list| heap.collector.publish(list));
    }

    /// Marks the roots of a blocked mutator with `gc`'s barrier.
    ///
    /// Returns `false` if the mutator already did it itself. The state lock
    /// is held throughout, so a mutator leaving its blocking section waits.
    pub(crate) fn mark_roots_on_behalf<T: GcThread>(&self, heap: &HeapInner, gc: &mut T) -> bool {
        let mut state = self.state.lock();
        let Some(cycle) = state.pending.root_mark.take() else {
            return false;
        };
        self.flip(cycle);
        for slot in self.roots.lock().iter() {
            read_barrier(heap, gc, slot);
        }
        drop(state);
        heap.collector.root_sets.arrive();
        true
    }

    /// Adopts the NMT value and allocation colour of `cycle`.
    fn flip(&self, cycle: u64) {
        self.expected_nmt
            .store(nmt_for_cycle(cycle), Ordering::Relaxed);
        self.alloc_epoch.store(cycle, Ordering::Relaxed);
    }

    pub(crate) fn roots(&self) -> parking_lot::MutexGuard<'_, Vec<Slot>> {
        self.roots.lock()
    }
}

impl fmt::Debug for MutatorShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutatorShared")
            .field("id", &self.id)
            .field("expected_nmt", &self.expected_nmt.load(Ordering::Relaxed))
            .field("alloc_epoch", &self.alloc_epoch.load(Ordering::Relaxed))
            .field("trap_enabled", &self.trap_enabled.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// ============================================================================
// MutatorLocal - what the barrier sees
// ============================================================================

struct MutatorLocal {
    shared: Arc<MutatorShared>,
    alloc: PageAllocator,
}

impl GcThread for MutatorLocal {
    fn expected_nmt(&self) -> bool {
        self.shared.expected_nmt.load(Ordering::Relaxed)
    }

    fn gc_trap_enabled(&self) -> bool {
        self.shared.trap_enabled.load(Ordering::Acquire)
    }

    fn await_relocation(&self, heap: &HeapInner) {
        heap.collector.trap_acks.wait();
    }

    fn allocator(&mut self) -> &mut PageAllocator {
        &mut self.alloc
    }

    fn add_gc_work(&mut self, heap: &HeapInner, obj: ObjectRef) {
        self.shared.add_gc_work(heap, obj);
    }
}

// ============================================================================
// Mutator
// ============================================================================

/// A thread's handle for allocating and accessing objects in a
/// [`Heap`](crate::Heap).
///
/// Created with [`Heap::mutator`](crate::Heap::mutator); de-registers on drop.
/// A mutator must poll [`safepoint`](Self::safepoint) regularly, and wrap
/// anything that may block for long (I/O, locks, joins) in
/// [`blocking`](Self::blocking), or collection cycles stall.
pub struct Mutator {
    heap: Arc<HeapInner>,
    shared: Arc<MutatorShared>,
    local: MutatorLocal,
}

impl Mutator {
    pub(crate) fn register(heap: Arc<HeapInner>) -> Self {
        let alloc = PageAllocator::new(&heap.pages);
        let shared = {
            let mut registry = heap.collector.registry.lock();
            let shared = Arc::new(MutatorShared::new(alloc.owner(), registry.signalled_cycle));
            registry.mutators.push(Arc::clone(&shared));
            shared
        };
        Self {
            local: MutatorLocal {
                shared: Arc::clone(&shared),
                alloc,
            },
            heap,
            shared,
        }
    }

    /// Identifier unique within the heap.
    #[must_use]
    pub fn id(&self) -> usize {
        self.shared.id()
    }

    // ------------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------------

    /// Allocates a zeroed object; exhausting the heap is fatal.
    pub fn allocate(&mut self, shape: ObjectShape) -> ObjectRef {
        self.allocate_in(shape, false)
            .unwrap_or_else(|err| fatal(&err))
    }

    /// Allocates a zeroed object that will never be relocated.
    pub fn allocate_pinned(&mut self, shape: ObjectShape) -> ObjectRef {
        self.allocate_in(shape, true)
            .unwrap_or_else(|err| fatal(&err))
    }

    /// Allocates a zeroed object.
    ///
    /// # Errors
    ///
    /// Returns an error if the object exceeds a page or no page is left.
    pub fn try_allocate(&mut self, shape: ObjectShape) -> Result<ObjectRef, HeapError> {
        self.allocate_in(shape, false)
    }

    fn allocate_in(&mut self, shape: ObjectShape, non_relocatable: bool) -> Result<ObjectRef, HeapError> {
        let heap = &*self.heap;
        let epoch = self.shared.alloc_epoch.load(Ordering::Relaxed);
        let object = self.local.alloc.try_allocate(
            &heap.pages,
            shape,
            GcField::Stamp(epoch),
            non_relocatable,
        )?;
        let obj = object.object_ref();
        // Allocated during a cycle whose roots we already marked: born live.
        if epoch > heap.collector.completed() {
            heap.pages.page_of(obj).add_live_data(object.size_in_bytes());
        }
        if heap.pages.take_collection_request() {
            heap.collector.request_collection();
        }
        Ok(obj)
    }

    // ------------------------------------------------------------------------
    // Field access
    // ------------------------------------------------------------------------

    /// Loads reference slot `index` of `obj` through the read barrier.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a reference slot of `obj`.
    pub fn read_field(&mut self, obj: ObjectRef, index: usize) -> Value {
        let heap = &*self.heap;
        let holder = resolve(heap, &mut self.local, obj);
        read_barrier(heap, &mut self.local, heap.pages.object(holder).slot(index))
    }

    /// Stores `value` into reference slot `index` of `obj`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a reference slot of `obj`, or if `value` is
    /// an integer outside the small-integer range.
    pub fn write_field(&mut self, obj: ObjectRef, index: usize, value: Value) {
        let heap = &*self.heap;
        let holder = resolve(heap, &mut self.local, obj);
        write_barrier(heap, &mut self.local, heap.pages.object(holder).slot(index), value);
    }

    /// Loads payload word `index` of `obj`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a payload word of `obj`.
    pub fn read_word(&mut self, obj: ObjectRef, index: usize) -> usize {
        let heap = &*self.heap;
        let holder = resolve(heap, &mut self.local, obj);
        heap.pages.object(holder).data(index).load(Ordering::Acquire)
    }

    /// Stores payload word `index` of `obj`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a payload word of `obj`.
    pub fn write_word(&mut self, obj: ObjectRef, index: usize, word: usize) {
        let heap = &*self.heap;
        let holder = resolve(heap, &mut self.local, obj);
        heap.pages.object(holder).data(index).store(word, Ordering::Release);
    }

    /// Shape of `obj`.
    pub fn shape(&mut self, obj: ObjectRef) -> ObjectShape {
        let heap = &*self.heap;
        let holder = resolve(heap, &mut self.local, obj);
        heap.pages.object(holder).shape()
    }

    /// Current GC field of `obj`, after following any relocation.
    pub fn gc_field(&mut self, obj: ObjectRef) -> GcField {
        let heap = &*self.heap;
        let holder = resolve(heap, &mut self.local, obj);
        heap.pages.object(holder).gc_field()
    }

    /// Current address of `obj`, cloning it out of a page under relocation
    /// if needed.
    pub fn resolve(&mut self, obj: ObjectRef) -> ObjectRef {
        resolve(&self.heap, &mut self.local, obj)
    }

    // ------------------------------------------------------------------------
    // Roots
    // ------------------------------------------------------------------------

    /// Pushes a root slot holding `value`; returns its index.
    pub fn push_root(&mut self, value: Value) -> usize {
        let heap = &*self.heap;
        let slot = Slot::new(RawRef::NULL);
        write_barrier(heap, &mut self.local, &slot, value);
        let mut roots = self.shared.roots.lock();
        roots.push(slot);
        roots.len() - 1
    }

    /// Loads root `index` through the read barrier.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn root(&mut self, index: usize) -> Value {
        let heap = &*self.heap;
        let roots = self.shared.roots.lock();
        read_barrier(heap, &mut self.local, &roots[index])
    }

    /// Overwrites root `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn set_root(&mut self, index: usize, value: Value) {
        let heap = &*self.heap;
        let roots = self.shared.roots.lock();
        write_barrier(heap, &mut self.local, &roots[index], value);
    }

    /// Pops roots until `len` remain.
    pub fn truncate_roots(&mut self, len: usize) {
        self.shared.roots.lock().truncate(len);
    }

    /// Number of root slots.
    #[must_use]
    pub fn root_count(&self) -> usize {
        self.shared.roots.lock().len()
    }

    /// Loads global `index` through the read barrier.
    ///
    /// # Panics
    ///
    /// Panics if `index` was not returned by [`Heap::add_global`](crate::Heap::add_global).
    pub fn global(&mut self, index: usize) -> Value {
        let heap = &*self.heap;
        let slot = heap.global_slot(index);
        read_barrier(heap, &mut self.local, &slot)
    }

    /// Overwrites global `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` was not returned by [`Heap::add_global`](crate::Heap::add_global).
    pub fn set_global(&mut self, index: usize, value: Value) {
        let heap = &*self.heap;
        let slot = heap.global_slot(index);
        write_barrier(heap, &mut self.local, &slot, value);
    }

    // ------------------------------------------------------------------------
    // Safepoints
    // ------------------------------------------------------------------------

    /// Services pending collector requests.
    ///
    /// Cheap when nothing is pending. Invalidates every `ObjectRef` not
    /// reloaded from a root or field afterwards.
    pub fn safepoint(&mut self) {
        if self.shared.has_pending.load(Ordering::Acquire) {
            let pending = self.shared.take_pending(&mut self.shared.state.lock());
            self.service(pending);
        }
    }

    /// Runs `f` as a blocking section.
    ///
    /// The collector treats the mutator as parked for the duration and
    /// answers its requests on its behalf, so `f` may block indefinitely.
    /// `f` cannot touch the heap through this mutator.
    pub fn blocking<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.enter_blocking();
        let guard = BlockingSection(self);
        let result = f();
        drop(guard);
        result
    }

    /// Runs a full collection cycle that starts after this call.
    pub fn collect(&mut self) {
        let heap = Arc::clone(&self.heap);
        self.blocking(|| heap.collector.full_gc());
    }

    /// Page the mutator currently bump-allocates into.
    #[must_use]
    pub const fn current_page(&self) -> Option<PageId> {
        self.local.alloc.current_page()
    }

    /// Non-relocatable page the mutator currently allocates pinned objects into.
    #[must_use]
    pub const fn pinned_page(&self) -> Option<PageId> {
        self.local.alloc.non_relocatable_page()
    }

    /// Marks the roots if asked to, leaving every other request pending.
    #[cfg(any(test, feature = "test-util"))]
    pub(crate) fn mark_roots_only(&mut self) -> bool {
        let Some(cycle) = self.shared.state.lock().pending.root_mark.take() else {
            return false;
        };
        self.mark_own_roots(cycle);
        true
    }

    /// Takes a pending checkpoint request without answering it.
    #[cfg(any(test, feature = "test-util"))]
    pub(crate) fn take_checkpoint(&self) -> Option<u64> {
        self.shared.state.lock().pending.safepoint.take()
    }

    #[cfg(any(test, feature = "test-util"))]
    pub(crate) fn pass_checkpoint(&self, id: u64) {
        self.heap.collector.signal_safepoint_reached(id);
    }

    #[cfg(any(test, feature = "test-util"))]
    pub(crate) fn publish_work(&self, obj: ObjectRef) {
        self.shared.add_gc_work(&self.heap, obj);
    }

    #[cfg(any(test, feature = "test-util"))]
    pub(crate) fn gc_trap_enabled(&self) -> bool {
        self.local.gc_trap_enabled()
    }

    fn enter_blocking(&mut self) {
        let pending = {
            let mut state = self.shared.state.lock();
            debug_assert!(!state.blocked, "mutator {} is already blocked", self.id());
            state.blocked = true;
            self.shared.take_pending(&mut state)
        };
        self.service(pending);
    }

    fn leave_blocking(&mut self) {
        let root_mark = {
            let mut state = self.shared.state.lock();
            debug_assert!(state.blocked);
            state.blocked = false;
            state.pending.root_mark.take()
        };
        if let Some(cycle) = root_mark {
            self.mark_own_roots(cycle);
        }
    }

    fn service(&mut self, pending: Pending) {
        if let Some(cycle) = pending.root_mark {
            self.mark_own_roots(cycle);
        }
        if let Some(id) = pending.safepoint {
            self.heap.collector.signal_safepoint_reached(id);
        }
        if pending.enable_trap {
            self.shared.trap_enabled.store(true, Ordering::Release);
            self.heap.collector.trap_acks.arrive();
        }
    }

    fn mark_own_roots(&mut self, cycle: u64) {
        self.shared.flip(cycle);
        let heap = &*self.heap;
        for slot in self.shared.roots.lock().iter() {
            read_barrier(heap, &mut self.local, slot);
        }
        heap.collector.root_sets.arrive();
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.enter_blocking();
        self.heap
            .collector
            .registry
            .lock()
            .mutators
            .retain(|m| !Arc::ptr_eq(m, &self.shared));
        self.shared.roots.lock().clear();
        self.local.alloc.park(&self.heap.pages);
    }
}

impl fmt::Debug for Mutator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutator")
            .field("id", &self.id())
            .field("roots", &self.root_count())
            .field("current_page", &self.current_page())
            .finish_non_exhaustive()
    }
}

/// Leaves the blocking section on drop, including on unwind.
struct BlockingSection<'a>(&'a mut Mutator);

impl Drop for BlockingSection<'_> {
    fn drop(&mut self) {
        self.0.leave_blocking();
    }
}

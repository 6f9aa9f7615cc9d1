//! The NMT read barrier.
//!
//! Every reference load from a heap slot or root slot goes through
//! [`read_barrier`]. The barrier has a one-compare fast path (the NMT bit
//! matches and the referent's page is not being evacuated) and a slow path
//! that resolves forwarding, queues stale referents for marking and heals
//! the slot with a CAS so the next load takes the fast path.
//!
//! Mutators and collector threads run the same code; the differences live
//! behind [`GcThread`].

use crossbeam::utils::Backoff;

use crate::heap::HeapInner;
use crate::metrics::bump;
use crate::object::Slot;
use crate::paged_heap::PageAllocator;
use crate::relocation::{lookup_new_address, CloneOutcome};
use crate::tagged::{ObjectRef, RawRef, Value};

/// What the barrier needs from the thread executing it.
pub(crate) trait GcThread {
    /// NMT value a healed reference carries for this thread.
    fn expected_nmt(&self) -> bool;

    /// Whether references into blocked pages must be resolved.
    fn gc_trap_enabled(&self) -> bool;

    /// Blocks until forwarding lookups are allowed to clone.
    fn await_relocation(&self, heap: &HeapInner);

    /// The pages clones are written into.
    fn allocator(&mut self) -> &mut PageAllocator;

    /// Queues a referent whose reference had a stale NMT bit.
    fn add_gc_work(&mut self, heap: &HeapInner, obj: ObjectRef);
}

/// Loads `slot`, resolving, queueing and healing as needed.
///
/// Work is queued before the healing CAS: a healed slot therefore implies
/// its referent is already visible to the collector, which is what lets a
/// checkpoint conclude that marking is complete.
pub(crate) fn read_barrier<T: GcThread>(heap: &HeapInner, thread: &mut T, slot: &Slot) -> Value {
    let backoff = Backoff::new();
    loop {
        let raw = slot.load();
        let Some((obj, nmt)) = raw.as_pointer() else {
            return raw.value();
        };

        let expected = thread.expected_nmt();
        let target = resolve(heap, thread, obj);
        if nmt == expected && target == obj {
            return Value::Object(obj);
        }

        if nmt != expected {
            thread.add_gc_work(heap, target);
        }
        if slot.compare_exchange(raw, RawRef::pointer(target, expected)).is_ok() {
            bump(&heap.collector.metrics.cumulative.barrier_heals, 1);
            return Value::Object(target);
        }
        backoff.spin();
    }
}

/// Returns the current address of `obj`, cloning it out of a blocked page
/// if nobody has yet.
pub(crate) fn resolve<T: GcThread>(heap: &HeapInner, thread: &mut T, obj: ObjectRef) -> ObjectRef {
    // Traps are disabled before pages are blocked, so a thread that sees a
    // fresh block with its trap still on has already acknowledged it.
    let page = heap.pages.page_of(obj);
    if !page.is_blocked() || !thread.gc_trap_enabled() {
        return obj;
    }

    thread.await_relocation(heap);
    let (new, outcome) = lookup_new_address(&heap.pages, page, obj, thread.allocator());
    let counters = &heap.collector.metrics.cumulative;
    match outcome {
        CloneOutcome::Existing => {}
        CloneOutcome::Won => bump(&counters.clones_installed, 1),
        CloneOutcome::Lost => bump(&counters.clone_races_lost, 1),
    }
    new
}

/// Resolves `obj` without cloning, returning it unchanged when no clone
/// has been installed.
///
/// Only meaningful once relocation of its page has finished.
pub(crate) fn forwarded_address(heap: &HeapInner, obj: ObjectRef) -> ObjectRef {
    let page = heap.pages.page_of(obj);
    if page.is_blocked() {
        page.forwarded(obj).unwrap_or(obj)
    } else {
        obj
    }
}

/// Encodes `value` for a store by `thread`.
///
/// An object reference is resolved first and written with the thread's
/// expected NMT: the storing thread holds it, so it is already marked
/// through or queued.
pub(crate) fn write_barrier<T: GcThread>(heap: &HeapInner, thread: &mut T, slot: &Slot, value: Value) {
    let raw = match value {
        Value::Object(obj) => RawRef::pointer(resolve(heap, thread, obj), thread.expected_nmt()),
        other => RawRef::encode(other, thread.expected_nmt()),
    };
    slot.store(raw);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use crate::config::HeapConfig;
    use crate::object::ObjectShape;
    use crate::tagged::{stamp_bits, GcField};
    use crate::worklist::Worklist;

    /// Minimal thread for driving the barrier directly.
    struct TestThread {
        nmt: bool,
        trap: bool,
        alloc: PageAllocator,
        work: Worklist,
    }

    impl TestThread {
        fn new(heap: &HeapInner, nmt: bool) -> Self {
            Self {
                nmt,
                trap: true,
                alloc: PageAllocator::new(&heap.pages),
                work: Worklist::new(),
            }
        }
    }

    impl GcThread for TestThread {
        fn expected_nmt(&self) -> bool {
            self.nmt
        }

        fn gc_trap_enabled(&self) -> bool {
            self.trap
        }

        fn await_relocation(&self, _heap: &HeapInner) {}

        fn allocator(&mut self) -> &mut PageAllocator {
            &mut self.alloc
        }

        fn add_gc_work(&mut self, _heap: &HeapInner, obj: ObjectRef) {
            self.work.add_work_gc(obj);
        }
    }

    fn heap() -> HeapInner {
        HeapInner::new(HeapConfig::new(4096, 16 * 4096)).unwrap()
    }

    fn object(heap: &HeapInner, thread: &mut TestThread) -> ObjectRef {
        thread
            .alloc
            .try_allocate(&heap.pages, ObjectShape::new(1, 1), GcField::Stamp(0), false)
            .unwrap()
            .object_ref()
    }

    #[test]
    fn test_fast_path_leaves_slot_alone() {
        let heap = heap();
        let mut thread = TestThread::new(&heap, true);
        let obj = object(&heap, &mut thread);
        let slot = Slot::new(RawRef::pointer(obj, true));

        assert_eq!(read_barrier(&heap, &mut thread, &slot), Value::Object(obj));
        assert!(thread.work.is_empty());
        assert_eq!(slot.load(), RawRef::pointer(obj, true));
        assert_eq!(heap.collector.metrics.barrier_heals(), 0);
    }

    #[test]
    fn test_stale_nmt_queues_and_heals() {
        let heap = heap();
        let mut thread = TestThread::new(&heap, true);
        let obj = object(&heap, &mut thread);
        let slot = Slot::new(RawRef::pointer(obj, false));

        assert_eq!(read_barrier(&heap, &mut thread, &slot), Value::Object(obj));
        assert_eq!(thread.work.get_work(), Some(obj));
        assert_eq!(slot.load(), RawRef::pointer(obj, true));

        // Healed: the second load queues nothing.
        read_barrier(&heap, &mut thread, &slot);
        assert!(thread.work.is_empty());
        assert_eq!(heap.collector.metrics.barrier_heals(), 1);
    }

    #[test]
    fn test_non_pointers_pass_through() {
        let heap = heap();
        let mut thread = TestThread::new(&heap, true);
        for value in [Value::Null, Value::Int(-3), Value::Int(Value::INT_MAX)] {
            let slot = Slot::new(RawRef::encode(value, false));
            assert_eq!(read_barrier(&heap, &mut thread, &slot), value);
        }
        assert!(thread.work.is_empty());
    }

    #[test]
    fn test_blocked_referent_is_forwarded() {
        let heap = heap();
        let mut thread = TestThread::new(&heap, false);
        let obj = object(&heap, &mut thread);
        heap.pages.object(obj).data(0).store(41, Ordering::Relaxed);
        heap.pages.object(obj).set_gc_field(GcField::Stamp(1));
        thread.alloc.release(&heap.pages);
        for id in heap.pages.take_full_pages() {
            heap.pages.page(id).block();
        }

        let slot = Slot::new(RawRef::pointer(obj, false));
        let Value::Object(new) = read_barrier(&heap, &mut thread, &slot) else {
            panic!("expected an object");
        };
        assert_ne!(new, obj);
        assert_eq!(heap.pages.object(new).data(0).load(Ordering::Acquire), 41);
        assert_eq!(slot.load(), RawRef::pointer(new, false));
        assert_eq!(heap.pages.object(new).gc_field_bits(), stamp_bits(1));
        assert_eq!(forwarded_address(&heap, obj), new);
        assert!(thread.work.is_empty());
        assert_eq!(heap.collector.metrics.clones_installed(), 1);
    }

    #[test]
    fn test_disabled_trap_sees_old_address() {
        let heap = heap();
        let mut thread = TestThread::new(&heap, false);
        let obj = object(&heap, &mut thread);
        thread.alloc.release(&heap.pages);
        for id in heap.pages.take_full_pages() {
            heap.pages.page(id).block();
        }
        thread.trap = false;

        let slot = Slot::new(RawRef::pointer(obj, false));
        assert_eq!(read_barrier(&heap, &mut thread, &slot), Value::Object(obj));
        assert_eq!(heap.pages.page_of(obj).forwarded(obj), None);
    }

    #[test]
    fn test_write_barrier_uses_expected_nmt() {
        let heap = heap();
        let mut thread = TestThread::new(&heap, true);
        let obj = object(&heap, &mut thread);
        let slot = Slot::new(RawRef::NULL);

        write_barrier(&heap, &mut thread, &slot, Value::Object(obj));
        assert_eq!(slot.load(), RawRef::pointer(obj, true));
        write_barrier(&heap, &mut thread, &slot, Value::Int(5));
        assert_eq!(slot.load().value(), Value::Int(5));
    }
}

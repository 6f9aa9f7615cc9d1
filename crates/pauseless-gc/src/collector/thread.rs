//! The collector thread and its per-cycle phase machine.
//!
//! ```text
//!   idle ──request──▶ RootMarking ──▶ Tracing ──▶ Relocating ──▶ EndOfCycle ──▶ idle
//!                     (roots,         (drain,     (select,        (rendezvous,
//!                      globals)        steal,      flip traps,     epoch + 1)
//!                                      checkpoint) copy)
//! ```
//!
//! Every collector thread walks every phase of every cycle. Work that must
//! happen once per cycle (signalling root marking, marking globals,
//! selecting pages) goes to whichever thread wins the matching claim in
//! [`CollectorContext`](super::CollectorContext).

use std::sync::Arc;

use crate::barrier::{read_barrier, GcThread};
use crate::heap::HeapInner;
use crate::metrics::bump;
use crate::paged_heap::PageAllocator;
use crate::relocation::relocate_page;
use crate::tagged::{nmt_for_cycle, stamp_bits, GcField, ObjectRef};
use crate::tracing::{internal, Phase};
use crate::worklist::Worklist;

/// The barrier-facing state of a collector thread.
pub(crate) struct CollectorLocal {
    expected_nmt: bool,
    cycle: u64,
    alloc: PageAllocator,
    worklist: Worklist,
    objects_marked: usize,
    bytes_marked: usize,
}

impl GcThread for CollectorLocal {
    fn expected_nmt(&self) -> bool {
        self.expected_nmt
    }

    fn gc_trap_enabled(&self) -> bool {
        true
    }

    // Collector threads only meet blocked pages once copying is open.
    fn await_relocation(&self, _heap: &HeapInner) {}

    fn allocator(&mut self) -> &mut PageAllocator {
        &mut self.alloc
    }

    fn add_gc_work(&mut self, _heap: &HeapInner, obj: ObjectRef) {
        self.worklist.add_work_gc(obj);
    }
}

impl CollectorLocal {
    fn new(heap: &HeapInner) -> Self {
        Self {
            expected_nmt: false,
            cycle: 0,
            alloc: PageAllocator::new(&heap.pages),
            worklist: Worklist::new(),
            objects_marked: 0,
            bytes_marked: 0,
        }
    }

    // ------------------------------------------------------------------------
    // Root marking
    // ------------------------------------------------------------------------

    fn mark_roots(&mut self, heap: &HeapInner) {
        let ctx = &heap.collector;
        if ctx.claim_root_marking() {
            heap.pages.reset_live_data();
            ctx.signal_root_marking(self.cycle);
        } else {
            ctx.await_root_signalling();
        }

        while let Some(mutator) = ctx.pop_blocked_root_set() {
            if mutator.mark_roots_on_behalf(heap, self) {
                bump(&ctx.metrics.cycle.root_sets_on_behalf, 1);
            }
        }
        ctx.root_sets.wait();

        // Globals go last: every mutator has flipped, so no store with the
        // previous NMT can land in a global after this scan.
        if ctx.claim_globals() {
            for slot in heap.globals.lock().iter() {
                read_barrier(heap, self, slot);
            }
        }
        ctx.metrics.roots_marked();
    }

    // ------------------------------------------------------------------------
    // Tracing
    // ------------------------------------------------------------------------

    fn trace(&mut self, heap: &HeapInner) {
        let ctx = &heap.collector;
        loop {
            while let Some(obj) = self.worklist.get_work() {
                self.mark_object(heap, obj);
            }
            match ctx.find_work() {
                Some(list) => {
                    list.move_work(&self.worklist);
                }
                None => break,
            }
        }
        debug_assert!(self.worklist.is_empty());

        let counters = &ctx.metrics.cycle;
        bump(&counters.objects_marked, std::mem::take(&mut self.objects_marked));
        bump(&counters.bytes_marked, std::mem::take(&mut self.bytes_marked));
    }

    /// Stamps `obj` with this cycle's mark value and scans its slots.
    ///
    /// The stamp decides who accounts the object's live bytes. The scan runs
    /// every time the object is popped: a mutator that had not yet flipped
    /// may have stored into it after an earlier scan.
    fn mark_object(&mut self, heap: &HeapInner, obj: ObjectRef) {
        let object = heap.pages.object(obj);
        let stamp = stamp_bits(self.cycle);
        let current = object.gc_field_bits();
        debug_assert!(
            !matches!(GcField::from_bits(current), GcField::Forwarded(_)),
            "{obj:?} was queued after being relocated"
        );
        if current != stamp && object.cas_gc_field(current, GcField::Stamp(self.cycle)) {
            let size = object.size_in_bytes();
            heap.pages.page_of(obj).add_live_data(size);
            self.objects_marked += 1;
            self.bytes_marked += size;
        }
        object.walk_objects(|slot| {
            read_barrier(heap, self, slot);
        });
    }

    // ------------------------------------------------------------------------
    // Relocation
    // ------------------------------------------------------------------------

    fn relocate(&mut self, heap: &HeapInner) {
        let ctx = &heap.collector;
        if ctx.claim_relocation() {
            select_pages(heap);
            ctx.trap_acks.wait();
            ctx.open_relocation();
        } else {
            ctx.await_relocation_start();
        }

        while let Some(id) = ctx.pages_to_relocate.pop() {
            let totals = relocate_page(&heap.pages, heap.pages.page(id), self.cycle, &mut self.alloc);
            bump(&ctx.metrics.cycle.objects_relocated, totals.objects);
            bump(&ctx.metrics.cycle.bytes_relocated, totals.bytes);
            internal::log_page_relocated(id.index(), totals.marked, totals.objects, totals.bytes);
        }
    }
}

/// Chooses this cycle's pages to evacuate and flips every GC trap.
///
/// Holds the registry lock throughout, so the set of mutators whose traps
/// were disabled is exactly the set asked to re-enable them.
fn select_pages(heap: &HeapInner) {
    let ctx = &heap.collector;
    let pages = &heap.pages;
    let registry = ctx.registry.lock();
    for mutator in &registry.mutators {
        mutator.disable_gc_trap();
    }

    // Marking has healed every reference into last cycle's pages.
    let unblocked = std::mem::take(&mut *ctx.pages_to_unblock.lock());
    for &id in &unblocked {
        pages.add_empty_page(id);
    }

    #[allow(clippy::cast_precision_loss)]
    let keep_above = heap.config.evacuation_live_ratio * pages.page_size() as f64;
    let (mut kept, mut selected, mut freed) = (Vec::new(), Vec::new(), 0);
    for id in pages.take_full_pages() {
        let page = pages.page(id);
        let live = page.amount_live_data();
        #[allow(clippy::cast_precision_loss)]
        let dense = live as f64 > keep_above;
        if live == 0 {
            pages.add_empty_page(id);
            freed += 1;
        } else if dense {
            page.reset_live_data();
            kept.push(id);
        } else {
            selected.push(id);
        }
    }
    // Fullest pages first: they free the most once copied.
    selected.sort_by_key(|&id| !pages.page(id).past_threshold());
    for &id in &selected {
        pages.page(id).block();
        ctx.pages_to_relocate.push(id);
    }

    let counters = &ctx.metrics.cycle;
    bump(&counters.pages_blocked, selected.len());
    bump(&counters.pages_kept, kept.len());
    bump(&counters.pages_freed, freed);
    bump(&counters.pages_unblocked, unblocked.len());
    internal::log_page_selection(selected.len(), kept.len(), freed, unblocked.len());

    pages.return_full_pages(kept);
    ctx.pages_to_unblock.lock().extend(selected);

    ctx.trap_acks.reset(registry.mutators.len());
    for mutator in &registry.mutators {
        mutator.signal_enable_gc_trap(ctx);
    }
}

/// One of a heap's collector threads.
pub(crate) struct CollectorThread {
    index: usize,
    heap: Arc<HeapInner>,
    local: CollectorLocal,
}

impl CollectorThread {
    pub(crate) fn new(index: usize, heap: Arc<HeapInner>) -> Self {
        let local = CollectorLocal::new(&heap);
        Self { index, heap, local }
    }

    /// Runs cycles until the heap shuts down.
    pub(crate) fn run(mut self) {
        while let Some(cycle) = self.heap.collector.wait_for_cycle() {
            self.run_cycle(cycle);
        }
        self.local.alloc.release(&self.heap.pages);
    }

    fn run_cycle(&mut self, cycle: u64) {
        let heap = &*self.heap;
        let local = &mut self.local;
        let _cycle = internal::trace_cycle(cycle, self.index);
        local.cycle = cycle;
        local.expected_nmt = nmt_for_cycle(cycle);

        run_phase(Phase::RootMarking, || local.mark_roots(heap));
        run_phase(Phase::Tracing, || local.trace(heap));
        run_phase(Phase::Relocating, || local.relocate(heap));
        run_phase(Phase::EndOfCycle, || heap.collector.end_cycle(cycle));
    }
}

fn run_phase(phase: Phase, body: impl FnOnce()) {
    let _span = internal::trace_phase(phase);
    internal::log_phase_start(phase);
    body();
    internal::log_phase_end(phase);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::object::ObjectShape;
    use crate::tagged::{RawRef, Value};

    fn heap() -> HeapInner {
        HeapInner::new(HeapConfig::new(4096, 16 * 4096).with_gc_threads(1)).unwrap()
    }

    fn chain(heap: &HeapInner, alloc: &mut PageAllocator, len: usize) -> Vec<ObjectRef> {
        let objects: Vec<_> = (0..len)
            .map(|_| {
                alloc
                    .try_allocate(&heap.pages, ObjectShape::new(1, 0), GcField::Stamp(0), false)
                    .unwrap()
                    .object_ref()
            })
            .collect();
        for pair in objects.windows(2) {
            heap.pages
                .object(pair[0])
                .slot(0)
                .store(RawRef::encode(Value::Object(pair[1]), false));
        }
        objects
    }

    #[test]
    fn test_mark_object_stamps_reachable_chain() {
        let heap = heap();
        let mut local = CollectorLocal::new(&heap);
        local.cycle = 1;
        local.expected_nmt = nmt_for_cycle(1);
        let objects = chain(&heap, &mut local.alloc, 3);

        local.worklist.add_work_gc(objects[0]);
        while let Some(obj) = local.worklist.get_work() {
            local.mark_object(&heap, obj);
        }

        for &obj in &objects {
            assert_eq!(heap.pages.object(obj).gc_field(), GcField::Stamp(1));
        }
        assert_eq!(local.objects_marked, 3);
        let live: usize = objects
            .iter()
            .map(|&o| heap.pages.object(o).size_in_bytes())
            .sum();
        assert_eq!(heap.pages.page_of(objects[0]).amount_live_data(), live);
    }

    #[test]
    fn test_mark_object_twice_counts_once() {
        let heap = heap();
        let mut local = CollectorLocal::new(&heap);
        local.cycle = 1;
        local.expected_nmt = true;
        let objects = chain(&heap, &mut local.alloc, 1);

        local.mark_object(&heap, objects[0]);
        local.mark_object(&heap, objects[0]);
        assert_eq!(local.objects_marked, 1);
        assert_eq!(
            heap.pages.page_of(objects[0]).amount_live_data(),
            ObjectShape::new(1, 0).size_in_bytes()
        );
    }

    #[test]
    fn test_select_pages_partitions_full_pool() {
        let heap = HeapInner::new(
            HeapConfig::new(4096, 16 * 4096)
                .with_gc_threads(1)
                .with_evacuation_live_ratio(0.5),
        )
        .unwrap();
        let mut alloc = PageAllocator::new(&heap.pages);
        let shape = ObjectShape::new(0, 62);
        let mut pages = Vec::new();
        for _ in 0..3 {
            for _ in 0..8 {
                alloc.try_allocate(&heap.pages, shape, GcField::Stamp(1), false).unwrap();
            }
            pages.push(alloc.current_page().unwrap());
            alloc.release(&heap.pages);
        }
        // Empty, sparse and dense.
        heap.pages.page(pages[1]).add_live_data(512);
        heap.pages.page(pages[2]).add_live_data(3584);

        select_pages(&heap);

        assert_eq!(heap.pages.page(pages[0]).state(), crate::page::PageState::Available);
        assert!(heap.pages.page(pages[1]).is_blocked());
        assert_eq!(heap.pages.page(pages[2]).state(), crate::page::PageState::Full);
        assert_eq!(heap.collector.pages_to_relocate.pop(), Some(pages[1]));
        assert!(heap.collector.pages_to_relocate.is_empty());
        assert_eq!(*heap.collector.pages_to_unblock.lock(), vec![pages[1]]);
        assert_eq!(heap.pages.full_page_count(), 1);
    }
}

//! Page relocation and forwarding.
//!
//! Objects in a blocked page are moved lazily: whichever thread first needs
//! the new address clones the object into its own current page and races to
//! publish the clone in the page's side array. Collector threads drive the
//! same path eagerly for every still-marked object of a page.

use crate::page::Page;
use crate::paged_heap::{PageAllocator, PagedHeap};
use crate::tagged::{stamp_bits, GcField, ObjectRef};

/// How a forwarding lookup was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloneOutcome {
    /// The side array already held an address.
    Existing,
    /// This thread's clone was installed.
    Won,
    /// Another thread installed first; this thread's clone was rolled back.
    Lost,
}

/// Resolves `old`, which lives in the blocked `page`, to its relocated address.
///
/// Idempotent and safe under any number of concurrent callers: every caller
/// observes the same address and exactly one clone survives.
pub(crate) fn lookup_new_address(
    heap: &PagedHeap,
    page: &Page,
    old: ObjectRef,
    alloc: &mut PageAllocator,
) -> (ObjectRef, CloneOutcome) {
    if let Some(new) = page.forwarded(old) {
        return (new, CloneOutcome::Existing);
    }

    let original = heap.object(old);
    let words = alloc.allocate_words(heap, original.shape().words());
    original.copy_into(words);
    let clone = heap.object(
        ObjectRef::from_addr(words.as_ptr() as usize)
            .unwrap_or_else(|| unreachable!("heap words are aligned and non-null")),
    );
    let clone_ref = clone.object_ref();

    match page.install_forwarding(old, clone_ref) {
        Ok(()) => {
            original.set_gc_field(GcField::Forwarded(clone_ref));
            heap.page_of(clone_ref).add_live_data(clone.size_in_bytes());
            (clone_ref, CloneOutcome::Won)
        }
        Err(winner) => {
            alloc.rollback(heap, clone_ref.addr());
            (winner, CloneOutcome::Lost)
        }
    }
}

/// Totals for one relocated page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PageRelocation {
    /// Objects this thread cloned.
    pub objects: usize,
    /// Bytes this thread cloned.
    pub bytes: usize,
    /// Marked objects found in the page, cloned by anyone.
    pub marked: usize,
}

/// Moves every object of `page` stamped with `epoch` out of the page.
pub(crate) fn relocate_page(
    heap: &PagedHeap,
    page: &Page,
    epoch: u64,
    alloc: &mut PageAllocator,
) -> PageRelocation {
    debug_assert!(page.is_blocked());
    let stamp = stamp_bits(epoch);
    let mut totals = PageRelocation::default();

    page.for_each_object(|object| {
        let obj = object.object_ref();
        let marked = object.gc_field_bits() == stamp;
        let forwarded = page.forwarded(obj).is_some();
        if !marked && !forwarded {
            return;
        }
        totals.marked += 1;
        if forwarded {
            return;
        }
        if let (_, CloneOutcome::Won) = lookup_new_address(heap, page, obj, alloc) {
            totals.objects += 1;
            totals.bytes += object.size_in_bytes();
        }
    });

    page.reset_live_data();
    totals
}

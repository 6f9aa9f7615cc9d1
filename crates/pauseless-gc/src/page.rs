//! Fixed-size, address-aligned pages.
//!
//! A page is bump-allocated by exactly one owning thread. Once full it is
//! handed back to the heap, where the collector may block it for relocation.
//! A blocked page carries a side array with one forwarding slot per 8-byte
//! offset; every read of an object in a blocked page resolves through it.
//!
//! # Lifecycle
//!
//! ```text
//! Unused -> Available -> Owned -> Full -> Blocked -> Available
//!                        |  ^  |     \_________________^  (no live data)
//!                        |  |  +-> NonRelocatable
//!                        v  |
//!                       Parked
//! ```
//!
//! A page is never `Owned` and `Blocked` at once. A departing thread parks
//! a page below its relocation threshold; the next owner continues bumping
//! where it stopped.
//!
//! The side array is published once per blocking and read without locks.

use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};

use crate::object::ObjectView;
use crate::tagged::{ObjectRef, OBJECT_ALIGNMENT};

// ============================================================================
// PageId / PageState
// ============================================================================

/// Index of a page within its heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(pub(crate) usize);

impl PageId {
    /// Position of the page in the heap's page table.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page#{}", self.0)
    }
}

/// Where a page is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageState {
    /// Address space reserved, never handed out.
    Unused = 0,
    /// Zeroed and in the available pool.
    Available = 1,
    /// Bump-allocated by one thread.
    Owned = 2,
    /// Yielded by its owner; candidate for relocation.
    Full = 3,
    /// Yielded non-relocatable page; never blocked.
    NonRelocatable = 4,
    /// Blocked for relocation.
    Blocked = 5,
    /// Partly used, unowned, waiting for a new owner.
    Parked = 6,
}

impl PageState {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Available,
            2 => Self::Owned,
            3 => Self::Full,
            4 => Self::NonRelocatable,
            5 => Self::Blocked,
            6 => Self::Parked,
            _ => Self::Unused,
        }
    }
}

/// Snapshot of one page for statistics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    /// Page identity.
    pub id: PageId,
    /// Lifecycle state.
    pub state: PageState,
    /// Bytes handed out by the bump pointer.
    pub used_bytes: usize,
    /// Bytes of objects marked live in the running or last cycle.
    pub live_bytes: usize,
    /// Whether the bump pointer crossed the relocation threshold.
    pub past_threshold: bool,
    /// Whether a side array is attached.
    pub has_side_array: bool,
    /// Whether every byte of the buffer is zero.
    pub zeroed: bool,
}

// ============================================================================
// Page
// ============================================================================

/// Metadata for one page of the heap.
///
/// The buffer itself lives in the heap's reservation; the page only records
/// its bounds. Pages are owned by the heap and borrowed by threads through
/// [`PageId`]s.
pub(crate) struct Page {
    id: PageId,
    start: *const AtomicUsize,
    size: usize,
    threshold: usize,
    /// Bump pointer, as a byte offset from `start`.
    next_free: AtomicUsize,
    state: AtomicU8,
    /// Thread id of the owner, 0 when unowned.
    owner: AtomicUsize,
    non_relocatable: AtomicU8,
    live_bytes: AtomicUsize,
    /// Forwarding slots, one per word; null unless blocked. Set by `block`
    /// and freed by `reset`.
    side_array: AtomicPtr<AtomicUsize>,
}

// SAFETY: `start` points into the heap reservation, which outlives every page
// and is only accessed through atomics.
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Page {
    pub(crate) fn new(id: PageId, start: *mut u8, size: usize, threshold: usize) -> Self {
        debug_assert_eq!(start as usize % OBJECT_ALIGNMENT, 0);
        Self {
            id,
            start: start.cast::<AtomicUsize>(),
            size,
            threshold,
            next_free: AtomicUsize::new(0),
            state: AtomicU8::new(PageState::Unused as u8),
            owner: AtomicUsize::new(0),
            non_relocatable: AtomicU8::new(0),
            live_bytes: AtomicUsize::new(0),
            side_array: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub(crate) const fn id(&self) -> PageId {
        self.id
    }

    pub(crate) fn start_addr(&self) -> usize {
        self.start as usize
    }

    /// The page buffer as words.
    pub(crate) fn words(&self) -> &[AtomicUsize] {
        // SAFETY: the buffer is mapped, zero-initialised memory of `size`
        // bytes that lives as long as the heap owning this page.
        unsafe { std::slice::from_raw_parts(self.start, self.size / OBJECT_ALIGNMENT) }
    }

    pub(crate) fn state(&self) -> PageState {
        PageState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: PageState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn owner(&self) -> usize {
        self.owner.load(Ordering::Acquire)
    }

    /// Hands the page to thread `owner` for bump allocation.
    pub(crate) fn take_ownership(&self, owner: usize, non_relocatable: bool) {
        debug_assert_ne!(owner, 0);
        debug_assert!(
            !self.is_blocked(),
            "{} handed out for allocation while blocked",
            self.id
        );
        self.non_relocatable
            .store(u8::from(non_relocatable), Ordering::Relaxed);
        self.owner.store(owner, Ordering::Release);
        self.set_state(PageState::Owned);
    }

    /// Ends the current owner's tenure; the page becomes full or non-relocatable.
    pub(crate) fn yield_ownership(&self) -> PageState {
        let next = if self.is_non_relocatable() {
            PageState::NonRelocatable
        } else {
            PageState::Full
        };
        self.owner.store(0, Ordering::Release);
        self.set_state(next);
        next
    }

    /// Ends the current owner's tenure without filling the page.
    pub(crate) fn park(&self) {
        debug_assert_eq!(self.state(), PageState::Owned);
        self.owner.store(0, Ordering::Release);
        self.set_state(PageState::Parked);
    }

    pub(crate) fn is_non_relocatable(&self) -> bool {
        self.non_relocatable.load(Ordering::Relaxed) != 0
    }

    // ------------------------------------------------------------------------
    // Bump allocation (owner only)
    // ------------------------------------------------------------------------

    /// Carves `size` bytes off the bump pointer.
    ///
    /// Returns `None` without side effects if the page cannot hold them.
    pub(crate) fn try_bump(&self, size: usize) -> Option<&[AtomicUsize]> {
        debug_assert_eq!(size % OBJECT_ALIGNMENT, 0);
        debug_assert_eq!(self.state(), PageState::Owned);
        let offset = self.next_free.load(Ordering::Relaxed);
        let end = offset.checked_add(size).filter(|&end| end <= self.size)?;
        self.next_free.store(end, Ordering::Release);
        Some(&self.words()[offset / OBJECT_ALIGNMENT..end / OBJECT_ALIGNMENT])
    }

    /// Gives back the most recent allocation, which started at `addr`.
    pub(crate) fn rollback_to(&self, addr: usize) {
        debug_assert_eq!(self.state(), PageState::Owned);
        let offset = addr - self.start_addr();
        let end = self.next_free.load(Ordering::Relaxed);
        debug_assert!(offset <= end, "rollback past the bump pointer");
        for word in &self.words()[offset / OBJECT_ALIGNMENT..end / OBJECT_ALIGNMENT] {
            word.store(0, Ordering::Relaxed);
        }
        self.next_free.store(offset, Ordering::Release);
    }

    pub(crate) fn used_bytes(&self) -> usize {
        self.next_free.load(Ordering::Acquire)
    }

    /// Whether allocation has crossed the relocation threshold.
    pub(crate) fn past_threshold(&self) -> bool {
        self.used_bytes() >= self.threshold
    }

    // ------------------------------------------------------------------------
    // Live data accounting
    // ------------------------------------------------------------------------

    pub(crate) fn amount_live_data(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn add_live_data(&self, bytes: usize) {
        self.live_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn reset_live_data(&self) {
        self.live_bytes.store(0, Ordering::Relaxed);
    }

    /// Walks every object between the page start and the bump pointer.
    pub(crate) fn for_each_object(&self, mut f: impl FnMut(ObjectView<'_>)) {
        let words = self.words();
        let end = self.used_bytes() / OBJECT_ALIGNMENT;
        let mut offset = 0;
        while offset < end {
            let object = ObjectView::at(words, offset);
            offset += object.shape().words();
            f(object);
        }
    }

    // ------------------------------------------------------------------------
    // Blocking and forwarding
    // ------------------------------------------------------------------------

    pub(crate) fn is_blocked(&self) -> bool {
        self.state() == PageState::Blocked
    }

    /// Attaches a fresh side array and blocks the page.
    pub(crate) fn block(&self) {
        debug_assert_eq!(
            self.state(),
            PageState::Full,
            "only yielded pages may be blocked"
        );
        debug_assert_eq!(self.owner(), 0, "{} is still owned", self.id);
        let slots: Box<[AtomicUsize]> = (0..self.slot_count())
            .map(|_| AtomicUsize::new(0))
            .collect();
        let slots = Box::into_raw(slots).cast::<AtomicUsize>();
        if self
            .side_array
            .compare_exchange(ptr::null_mut(), slots, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            unreachable!("{} blocked twice without a reset", self.id);
        }
        self.set_state(PageState::Blocked);
    }

    /// Detaches the side array and resets the bump pointer and counters.
    ///
    /// The caller zeroes the buffer, and no thread may still resolve through
    /// the side array: every reference into the page has been healed.
    pub(crate) fn reset(&self) {
        self.free_side_array();
        self.next_free.store(0, Ordering::Release);
        self.reset_live_data();
        self.non_relocatable.store(0, Ordering::Relaxed);
    }

    pub(crate) fn has_side_array(&self) -> bool {
        !self.side_array.load(Ordering::Acquire).is_null()
    }

    const fn slot_count(&self) -> usize {
        self.size / OBJECT_ALIGNMENT
    }

    fn side_slots(&self) -> Option<&[AtomicUsize]> {
        let slots = self.side_array.load(Ordering::Acquire);
        // SAFETY: a non-null pointer came from `block` with `slot_count`
        // slots and stays allocated until `reset`, which only runs once no
        // thread can reach the page.
        (!slots.is_null()).then(|| unsafe { std::slice::from_raw_parts(slots, self.slot_count()) })
    }

    fn free_side_array(&self) {
        let slots = self.side_array.swap(ptr::null_mut(), Ordering::AcqRel);
        if !slots.is_null() {
            // SAFETY: the pointer was produced by `Box::into_raw` in `block`
            // and has just been unpublished.
            drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(slots, self.slot_count())) });
        }
    }

    fn side_index(&self, obj: ObjectRef) -> usize {
        let offset = obj.addr() - self.start_addr();
        debug_assert!(offset < self.size, "{obj:?} is not in {}", self.id);
        offset / OBJECT_ALIGNMENT
    }

    /// Returns the installed forwarding address of `obj`, if any.
    pub(crate) fn forwarded(&self, obj: ObjectRef) -> Option<ObjectRef> {
        let index = self.side_index(obj);
        let slot = self.side_slots()?.get(index)?;
        ObjectRef::from_addr(slot.load(Ordering::Acquire))
    }

    /// Publishes `clone` as the new address of `obj` unless another thread
    /// got there first; returns the address that won.
    pub(crate) fn install_forwarding(&self, obj: ObjectRef, clone: ObjectRef) -> Result<(), ObjectRef> {
        let index = self.side_index(obj);
        let Some(slots) = self.side_slots() else {
            unreachable!("forwarding installed into {} without a side array", self.id)
        };
        match slots[index].compare_exchange(0, clone.addr(), Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Ok(()),
            Err(winner) => Err(ObjectRef::from_addr(winner)
                .unwrap_or_else(|| unreachable!("forwarding slot holds a non-address"))),
        }
    }

    pub(crate) fn info(&self) -> PageInfo {
        PageInfo {
            id: self.id,
            state: self.state(),
            used_bytes: self.used_bytes(),
            live_bytes: self.amount_live_data(),
            past_threshold: self.past_threshold(),
            has_side_array: self.has_side_array(),
            zeroed: self.words().iter().all(|w| w.load(Ordering::Relaxed) == 0),
        }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        self.free_side_array();
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("used_bytes", &self.used_bytes())
            .field("live_bytes", &self.amount_live_data())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectShape;
    use crate::tagged::GcField;

    struct Buffer(Box<[AtomicUsize]>);

    impl Buffer {
        fn new(bytes: usize) -> Self {
            Self((0..bytes / 8).map(|_| AtomicUsize::new(0)).collect())
        }

        fn page(&self) -> Page {
            Page::new(PageId(0), self.0.as_ptr().cast_mut().cast(), self.0.len() * 8, 900)
        }
    }

    fn owned(buffer: &Buffer) -> Page {
        let page = buffer.page();
        page.take_ownership(1, false);
        page
    }

    #[test]
    fn test_bump_until_full() {
        let buffer = Buffer::new(1024);
        let page = owned(&buffer);

        for _ in 0..4 {
            assert!(page.try_bump(256).is_some());
        }
        assert!(page.try_bump(8).is_none());
        assert_eq!(page.used_bytes(), 1024);
        assert!(page.past_threshold());
    }

    #[test]
    fn test_threshold_is_accounting_only() {
        let buffer = Buffer::new(1024);
        let page = owned(&buffer);

        assert!(page.try_bump(896).is_some());
        assert!(!page.past_threshold());
        assert!(page.try_bump(16).is_some());
        assert!(page.past_threshold());
        assert!(page.try_bump(112).is_some());
    }

    #[test]
    fn test_rollback_zeroes_and_rewinds() {
        let buffer = Buffer::new(512);
        let page = owned(&buffer);

        let first = page.try_bump(64).unwrap();
        ObjectView::init(first, ObjectShape::new(0, 6), GcField::Fresh);
        let second = page.try_bump(32).unwrap();
        let second_addr = second.as_ptr() as usize;
        ObjectView::init(second, ObjectShape::new(1, 1), GcField::Fresh);

        page.rollback_to(second_addr);
        assert_eq!(page.used_bytes(), 64);
        assert!(page.words()[8..].iter().all(|w| w.load(Ordering::Relaxed) == 0));
        assert_eq!(page.try_bump(32).unwrap().as_ptr() as usize, second_addr);
    }

    #[test]
    fn test_for_each_object_walks_in_order() {
        let buffer = Buffer::new(512);
        let page = owned(&buffer);
        let shapes = [ObjectShape::new(1, 0), ObjectShape::new(0, 4), ObjectShape::new(2, 2)];
        for shape in shapes {
            let words = page.try_bump(shape.size_in_bytes()).unwrap();
            ObjectView::init(words, shape, GcField::Fresh);
        }

        let mut seen = Vec::new();
        page.for_each_object(|obj| seen.push(obj.shape()));
        assert_eq!(seen, shapes);
    }

    #[test]
    fn test_block_attaches_side_array() {
        let buffer = Buffer::new(256);
        let page = owned(&buffer);
        let obj = page.try_bump(16).unwrap().as_ptr() as usize;
        assert_eq!(page.yield_ownership(), PageState::Full);

        page.block();
        assert!(page.is_blocked());
        assert!(page.has_side_array());

        let obj = ObjectRef::from_addr(obj).unwrap();
        assert_eq!(page.forwarded(obj), None);

        let first = ObjectRef::from_addr(0x9000).unwrap();
        let second = ObjectRef::from_addr(0xA000).unwrap();
        assert_eq!(page.install_forwarding(obj, first), Ok(()));
        assert_eq!(page.install_forwarding(obj, second), Err(first));
        assert_eq!(page.forwarded(obj), Some(first));

        page.reset();
        assert!(!page.has_side_array());
        assert_eq!(page.used_bytes(), 0);
    }

    #[test]
    fn test_side_array_is_fresh_after_reblock() {
        let buffer = Buffer::new(256);
        let page = owned(&buffer);
        let obj = ObjectRef::from_addr(page.try_bump(16).unwrap().as_ptr() as usize).unwrap();
        page.yield_ownership();
        page.block();
        page.install_forwarding(obj, ObjectRef::from_addr(0x9000).unwrap()).unwrap();

        page.reset();
        page.set_state(PageState::Available);
        assert_eq!(page.forwarded(obj), None);
        page.take_ownership(2, false);
        let obj = ObjectRef::from_addr(page.try_bump(16).unwrap().as_ptr() as usize).unwrap();
        page.yield_ownership();
        page.block();
        assert_eq!(page.forwarded(obj), None);
    }

    #[test]
    fn test_parked_page_keeps_bump_pointer() {
        let buffer = Buffer::new(256);
        let page = owned(&buffer);
        page.try_bump(64).unwrap();
        page.park();
        assert_eq!(page.state(), PageState::Parked);
        assert_eq!(page.owner(), 0);

        page.take_ownership(7, false);
        assert_eq!(page.try_bump(16).unwrap().as_ptr() as usize, page.start_addr() + 64);
    }

    #[test]
    fn test_non_relocatable_yields_to_own_state() {
        let buffer = Buffer::new(256);
        let page = buffer.page();
        page.take_ownership(3, true);
        assert_eq!(page.owner(), 3);
        assert_eq!(page.yield_ownership(), PageState::NonRelocatable);
        assert_eq!(page.owner(), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "only yielded pages may be blocked")]
    fn test_owned_page_cannot_be_blocked() {
        let buffer = Buffer::new(256);
        let page = owned(&buffer);
        page.block();
    }
}

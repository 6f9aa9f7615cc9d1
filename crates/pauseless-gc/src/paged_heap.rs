//! The page pool.
//!
//! [`PagedHeap`] reserves one aligned region for the configured page ceiling
//! and tracks where every page is: in the available pool, owned by a thread,
//! in the full pool waiting for the collector, or blocked for relocation.
//! Each pool sits behind its own mutex.
//!
//! Ownership is strictly heap-owns-pages: threads hold [`PageId`]s through a
//! [`PageAllocator`] and never keep page metadata alive themselves.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use sys_alloc::{Mmap, MmapOptions};

use crate::config::HeapConfig;
use crate::error::{fatal, HeapError};
use crate::object::{ObjectShape, ObjectView};
use crate::page::{Page, PageId, PageInfo, PageState};
use crate::tagged::{GcField, ObjectRef, OBJECT_ALIGNMENT};

#[derive(Debug, Default)]
struct AvailablePool {
    free: Vec<PageId>,
    materialized: usize,
}

/// Partly used pages left behind by departed threads, by kind.
#[derive(Debug, Default)]
struct ParkedPool {
    relocatable: Vec<PageId>,
    non_relocatable: Vec<PageId>,
}

impl ParkedPool {
    fn of_kind(&mut self, non_relocatable: bool) -> &mut Vec<PageId> {
        if non_relocatable {
            &mut self.non_relocatable
        } else {
            &mut self.relocatable
        }
    }
}

/// Owner of every page in one heap.
pub(crate) struct PagedHeap {
    region: Mmap,
    base: usize,
    page_size: usize,
    page_shift: u32,
    pages: Box<[Page]>,
    trigger_pages: usize,
    available: Mutex<AvailablePool>,
    parked: Mutex<ParkedPool>,
    full: Mutex<Vec<PageId>>,
    non_relocatable_full: Mutex<Vec<PageId>>,
    in_use: AtomicUsize,
    collection_requested: AtomicBool,
    next_owner: AtomicUsize,
}

impl PagedHeap {
    /// Reserves address space for `config.max_pages()` pages.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the OS refuses
    /// the reservation.
    pub(crate) fn new(config: &HeapConfig) -> Result<Self, HeapError> {
        config.validate()?;
        let page_size = config.page_size;
        let max_pages = config.max_pages();

        let region = unsafe {
            MmapOptions::new()
                .len(max_pages * page_size)
                .align(page_size)
                .populate(config.prefault)
                .no_reserve(!config.prefault)
                .map_anon()?
        };
        let base = region.ptr() as usize;

        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let (threshold, trigger_pages) = (
            ((page_size as f64 * config.relocation_threshold) as usize) & !(OBJECT_ALIGNMENT - 1),
            (max_pages as f64 * config.collection_trigger) as usize,
        );

        let pages = (0..max_pages)
            .map(|i| Page::new(PageId(i), region.ptr().wrapping_add(i * page_size), page_size, threshold))
            .collect();

        Ok(Self {
            region,
            base,
            page_size,
            page_shift: page_size.trailing_zeros(),
            pages,
            trigger_pages,
            available: Mutex::new(AvailablePool::default()),
            parked: Mutex::new(ParkedPool::default()),
            full: Mutex::new(Vec::new()),
            non_relocatable_full: Mutex::new(Vec::new()),
            in_use: AtomicUsize::new(0),
            collection_requested: AtomicBool::new(false),
            next_owner: AtomicUsize::new(1),
        })
    }

    pub(crate) const fn page_size(&self) -> usize {
        self.page_size
    }

    pub(crate) fn max_pages(&self) -> usize {
        self.pages.len()
    }

    /// Hands out a unique, non-zero owner id for a new thread.
    pub(crate) fn next_owner_id(&self) -> usize {
        self.next_owner.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn page(&self, id: PageId) -> &Page {
        &self.pages[id.0]
    }

    pub(crate) fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.pages.len() * self.page_size
    }

    /// Page containing `obj`, found by masking the address.
    ///
    /// # Panics
    ///
    /// Panics if `obj` does not point into this heap.
    pub(crate) fn page_of(&self, obj: ObjectRef) -> &Page {
        assert!(
            self.contains(obj.addr()),
            "{obj:?} does not point into this heap"
        );
        &self.pages[(obj.addr() - self.base) >> self.page_shift]
    }

    /// Borrows the object at `obj`.
    pub(crate) fn object(&self, obj: ObjectRef) -> ObjectView<'_> {
        let page = self.page_of(obj);
        ObjectView::at(page.words(), (obj.addr() - page.start_addr()) / OBJECT_ALIGNMENT)
    }

    // ------------------------------------------------------------------------
    // Page pools
    // ------------------------------------------------------------------------

    /// Takes a parked page of the right kind, else a page from the available
    /// pool, materialising a new one while under the page ceiling.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::OutOfPages`] once all three are exhausted.
    pub(crate) fn try_request_page(
        &self,
        owner: usize,
        non_relocatable: bool,
    ) -> Result<PageId, HeapError> {
        if let Some(id) = self.parked.lock().of_kind(non_relocatable).pop() {
            let page = self.page(id);
            debug_assert_eq!(page.state(), PageState::Parked);
            page.take_ownership(owner, non_relocatable);
            return Ok(id);
        }

        let id = {
            let mut pool = self.available.lock();
            if let Some(id) = pool.free.pop() {
                id
            } else if pool.materialized < self.pages.len() {
                pool.materialized += 1;
                PageId(pool.materialized - 1)
            } else {
                return Err(HeapError::OutOfPages {
                    max_pages: self.pages.len(),
                });
            }
        };

        let page = self.page(id);
        debug_assert!(matches!(page.state(), PageState::Available | PageState::Unused));
        page.take_ownership(owner, non_relocatable);

        let in_use = self.in_use.fetch_add(1, Ordering::Relaxed) + 1;
        if in_use > self.trigger_pages {
            self.collection_requested.store(true, Ordering::Release);
        }
        Ok(id)
    }

    /// Like [`try_request_page`](Self::try_request_page), but exhaustion is fatal.
    pub(crate) fn request_page(&self, owner: usize, non_relocatable: bool) -> PageId {
        self.try_request_page(owner, non_relocatable)
            .unwrap_or_else(|err| fatal(&err))
    }

    /// Returns a page its departing owner may not have filled.
    ///
    /// A page still below its relocation threshold is parked for the next
    /// thread to continue; anything fuller is relinquished.
    pub(crate) fn park_page(&self, id: PageId) {
        let page = self.page(id);
        if page.past_threshold() {
            self.relinquish_page(id);
            return;
        }
        let non_relocatable = page.is_non_relocatable();
        page.park();
        self.parked.lock().of_kind(non_relocatable).push(id);
    }

    /// Returns a page its owner can no longer allocate into.
    pub(crate) fn relinquish_page(&self, id: PageId) {
        match self.page(id).yield_ownership() {
            PageState::NonRelocatable => self.non_relocatable_full.lock().push(id),
            _ => self.full.lock().push(id),
        }
    }

    /// Zeroes a page and returns it to the available pool.
    pub(crate) fn add_empty_page(&self, id: PageId) {
        let page = self.page(id);
        debug_assert_ne!(page.state(), PageState::Owned, "{id} is still owned");
        page.reset();
        // SAFETY: the page is unowned and unreachable, so no thread reads
        // its buffer while it is discarded.
        if unsafe { self.region.discard(id.0 * self.page_size, self.page_size) }.is_err() {
            for word in page.words() {
                word.store(0, Ordering::Relaxed);
            }
        }
        page.set_state(PageState::Available);
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        self.available.lock().free.push(id);
    }

    /// Takes the whole full pool.
    pub(crate) fn take_full_pages(&self) -> Vec<PageId> {
        std::mem::take(&mut *self.full.lock())
    }

    /// Puts pages back into the full pool.
    pub(crate) fn return_full_pages(&self, ids: impl IntoIterator<Item = PageId>) {
        self.full.lock().extend(ids);
    }

    pub(crate) fn full_page_count(&self) -> usize {
        self.full.lock().len()
    }

    pub(crate) fn non_relocatable_page_count(&self) -> usize {
        self.non_relocatable_full.lock().len()
    }

    pub(crate) fn parked_page_count(&self) -> usize {
        let parked = self.parked.lock();
        parked.relocatable.len() + parked.non_relocatable.len()
    }

    pub(crate) fn available_page_count(&self) -> usize {
        let pool = self.available.lock();
        pool.free.len() + (self.pages.len() - pool.materialized)
    }

    /// Pages ever taken from the unused tail of the reservation.
    pub(crate) fn materialized_pages(&self) -> usize {
        self.available.lock().materialized
    }

    pub(crate) fn pages_in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Clears and returns the pending page-pressure signal.
    pub(crate) fn take_collection_request(&self) -> bool {
        self.collection_requested.load(Ordering::Relaxed)
            && self.collection_requested.swap(false, Ordering::AcqRel)
    }

    /// Zeroes the live-data counter of every page not currently blocked.
    pub(crate) fn reset_live_data(&self) {
        for page in self.pages.iter().filter(|p| !p.is_blocked()) {
            page.reset_live_data();
        }
    }

    pub(crate) fn page_info(&self, id: PageId) -> Option<PageInfo> {
        self.pages.get(id.0).map(Page::info)
    }
}

// ============================================================================
// PageAllocator - a thread's view of its current pages
// ============================================================================

/// The pages one thread currently bump-allocates into.
///
/// A thread owns at most one relocatable and one non-relocatable page at a
/// time. Full pages are relinquished to the heap and a successor is requested
/// transparently, so an allocation never comes back short.
#[derive(Debug)]
pub(crate) struct PageAllocator {
    owner: usize,
    current: Option<PageId>,
    non_relocatable: Option<PageId>,
}

impl PageAllocator {
    pub(crate) fn new(heap: &PagedHeap) -> Self {
        Self {
            owner: heap.next_owner_id(),
            current: None,
            non_relocatable: None,
        }
    }

    pub(crate) const fn owner(&self) -> usize {
        self.owner
    }

    pub(crate) const fn current_page(&self) -> Option<PageId> {
        self.current
    }

    pub(crate) const fn non_relocatable_page(&self) -> Option<PageId> {
        self.non_relocatable
    }

    /// Bump-allocates `words` zeroed words.
    ///
    /// # Errors
    ///
    /// Returns an error if the request exceeds a page or no page is left.
    pub(crate) fn try_allocate_words<'h>(
        &mut self,
        heap: &'h PagedHeap,
        words: usize,
        non_relocatable: bool,
    ) -> Result<&'h [AtomicUsize], HeapError> {
        let size = words * OBJECT_ALIGNMENT;
        if size > heap.page_size() {
            return Err(HeapError::ObjectTooLarge {
                size,
                max: heap.page_size(),
            });
        }

        self.bump(heap, size, non_relocatable, PagedHeap::try_request_page)
    }

    /// Bump-allocates from the current page or successors obtained through
    /// `request`.
    fn bump<'h>(
        &mut self,
        heap: &'h PagedHeap,
        size: usize,
        non_relocatable: bool,
        request: impl Fn(&PagedHeap, usize, bool) -> Result<PageId, HeapError>,
    ) -> Result<&'h [AtomicUsize], HeapError> {
        let owner = self.owner;
        let slot = if non_relocatable {
            &mut self.non_relocatable
        } else {
            &mut self.current
        };
        loop {
            let id = match *slot {
                Some(id) => id,
                None => *slot.insert(request(heap, owner, non_relocatable)?),
            };
            if let Some(region) = heap.page(id).try_bump(size) {
                return Ok(region);
            }
            heap.relinquish_page(id);
            *slot = None;
        }
    }

    /// Allocates and initialises an object.
    pub(crate) fn try_allocate<'h>(
        &mut self,
        heap: &'h PagedHeap,
        shape: ObjectShape,
        gc_field: GcField,
        non_relocatable: bool,
    ) -> Result<ObjectView<'h>, HeapError> {
        let words = self.try_allocate_words(heap, shape.words(), non_relocatable)?;
        Ok(ObjectView::init(words, shape, gc_field))
    }

    /// Like [`try_allocate_words`](Self::try_allocate_words), but successor
    /// pages come from [`PagedHeap::request_page`] and failure is fatal.
    pub(crate) fn allocate_words<'h>(&mut self, heap: &'h PagedHeap, words: usize) -> &'h [AtomicUsize] {
        let size = words * OBJECT_ALIGNMENT;
        if size > heap.page_size() {
            fatal(&HeapError::ObjectTooLarge {
                size,
                max: heap.page_size(),
            });
        }
        self.bump(heap, size, false, |heap, owner, non_relocatable| {
            Ok(heap.request_page(owner, non_relocatable))
        })
        .unwrap_or_else(|err| fatal(&err))
    }

    /// Undoes the most recent allocation, which started at `addr`.
    pub(crate) fn rollback(&self, heap: &PagedHeap, addr: usize) {
        let page = heap.page_of(
            ObjectRef::from_addr(addr).unwrap_or_else(|| unreachable!("rollback of a non-address")),
        );
        debug_assert_eq!(Some(page.id()), self.current, "rollback outside the current page");
        page.rollback_to(addr);
    }

    /// Parks or relinquishes both pages as the owning thread departs.
    pub(crate) fn park(&mut self, heap: &PagedHeap) {
        if let Some(id) = self.current.take() {
            heap.park_page(id);
        }
        if let Some(id) = self.non_relocatable.take() {
            heap.park_page(id);
        }
    }

    /// Hands both pages back to the heap.
    pub(crate) fn release(&mut self, heap: &PagedHeap) {
        if let Some(id) = self.current.take() {
            heap.relinquish_page(id);
        }
        if let Some(id) = self.non_relocatable.take() {
            heap.relinquish_page(id);
        }
    }
}

//! Object layout beyond the tagged word.
//!
//! ```text
//! word 0   GC field (mark stamp, forwarding address or sentinel)
//! word 1   shape: reference count in the low half, data words in the high half
//! word 2.. `refs` reference slots, then `data_words` payload words
//! ```
//!
//! Every word is accessed atomically so mutators, collector threads and
//! cloning threads may touch the same object without data races.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::tagged::{GcField, ObjectRef, RawRef, OBJECT_ALIGNMENT};

/// Number of header words preceding the reference slots.
pub const HEADER_WORDS: usize = 2;

/// Smallest object: a bare header.
pub const MIN_OBJECT_SIZE: usize = HEADER_WORDS * OBJECT_ALIGNMENT;

const HALF_BITS: u32 = usize::BITS / 2;
const HALF_MASK: usize = (1 << HALF_BITS) - 1;

/// Number of reference slots and payload words of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectShape {
    refs: usize,
    data_words: usize,
}

impl ObjectShape {
    /// Largest count for either half of a shape.
    pub const MAX_FIELDS: usize = HALF_MASK;

    /// Creates a shape with `refs` reference slots and `data_words` payload words.
    ///
    /// # Panics
    ///
    /// Panics if either count exceeds [`Self::MAX_FIELDS`].
    #[must_use]
    pub const fn new(refs: usize, data_words: usize) -> Self {
        assert!(refs <= Self::MAX_FIELDS && data_words <= Self::MAX_FIELDS);
        Self { refs, data_words }
    }

    /// Number of reference slots.
    #[must_use]
    pub const fn refs(self) -> usize {
        self.refs
    }

    /// Number of untraced payload words.
    #[must_use]
    pub const fn data_words(self) -> usize {
        self.data_words
    }

    /// Total words including the header.
    #[must_use]
    pub const fn words(self) -> usize {
        HEADER_WORDS + self.refs + self.data_words
    }

    /// Total bytes including the header.
    #[must_use]
    pub const fn size_in_bytes(self) -> usize {
        self.words() * OBJECT_ALIGNMENT
    }

    const fn to_bits(self) -> usize {
        self.refs | (self.data_words << HALF_BITS)
    }

    const fn from_bits(bits: usize) -> Self {
        Self {
            refs: bits & HALF_MASK,
            data_words: bits >> HALF_BITS,
        }
    }
}

/// Storage for one reference word.
#[derive(Debug, Default)]
#[repr(transparent)]
pub(crate) struct Slot(AtomicUsize);

impl Slot {
    pub(crate) const fn new(raw: RawRef) -> Self {
        Self(AtomicUsize::new(raw.bits()))
    }

    pub(crate) fn from_word(word: &AtomicUsize) -> &Self {
        // SAFETY: Slot is repr(transparent) over AtomicUsize.
        unsafe { &*std::ptr::from_ref(word).cast::<Self>() }
    }

    pub(crate) fn load(&self) -> RawRef {
        RawRef::from_bits(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, raw: RawRef) {
        self.0.store(raw.bits(), Ordering::Release);
    }

    /// Replaces `current` with `new`; returns the value actually found on failure.
    pub(crate) fn compare_exchange(&self, current: RawRef, new: RawRef) -> Result<(), RawRef> {
        self.0
            .compare_exchange(current.bits(), new.bits(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(RawRef::from_bits)
    }
}

/// Borrowed view of one object's words.
#[derive(Clone, Copy)]
pub(crate) struct ObjectView<'h> {
    words: &'h [AtomicUsize],
}

impl<'h> ObjectView<'h> {
    /// Reads the object whose header starts at `page[offset]`.
    ///
    /// # Panics
    ///
    /// Panics if the recorded shape runs past the end of the page.
    pub(crate) fn at(page: &'h [AtomicUsize], offset: usize) -> Self {
        let shape = ObjectShape::from_bits(page[offset + 1].load(Ordering::Acquire));
        let end = offset + shape.words();
        assert!(
            end <= page.len(),
            "object at word {offset} with {shape:?} overruns its page"
        );
        Self {
            words: &page[offset..end],
        }
    }

    /// Writes a fresh header into zeroed memory.
    pub(crate) fn init(words: &'h [AtomicUsize], shape: ObjectShape, gc_field: GcField) -> Self {
        debug_assert_eq!(words.len(), shape.words());
        debug_assert!(
            words.iter().all(|w| w.load(Ordering::Relaxed) == 0),
            "allocation handed out memory that is not zeroed"
        );
        words[1].store(shape.to_bits(), Ordering::Relaxed);
        words[0].store(gc_field.to_bits(), Ordering::Release);
        Self { words }
    }

    pub(crate) fn object_ref(self) -> ObjectRef {
        // A slice into the heap is never null and always word aligned.
        ObjectRef::from_addr(self.words.as_ptr() as usize)
            .unwrap_or_else(|| unreachable!("heap words are aligned and non-null"))
    }

    pub(crate) fn shape(self) -> ObjectShape {
        ObjectShape::from_bits(self.words[1].load(Ordering::Relaxed))
    }

    pub(crate) fn size_in_bytes(self) -> usize {
        self.words.len() * OBJECT_ALIGNMENT
    }

    pub(crate) fn gc_field(self) -> GcField {
        GcField::from_bits(self.words[0].load(Ordering::Acquire))
    }

    pub(crate) fn gc_field_bits(self) -> usize {
        self.words[0].load(Ordering::Acquire)
    }

    pub(crate) fn set_gc_field(self, field: GcField) {
        self.words[0].store(field.to_bits(), Ordering::Release);
    }

    /// Installs `new` if the GC field still holds `current`.
    pub(crate) fn cas_gc_field(self, current: usize, new: GcField) -> bool {
        self.words[0]
            .compare_exchange(current, new.to_bits(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns reference slot `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below the shape's reference count.
    pub(crate) fn slot(self, index: usize) -> &'h Slot {
        let refs = self.shape().refs();
        assert!(index < refs, "reference index {index} out of range for {refs} slots");
        Slot::from_word(&self.words[HEADER_WORDS + index])
    }

    /// Returns payload word `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below the shape's data word count.
    pub(crate) fn data(self, index: usize) -> &'h AtomicUsize {
        let shape = self.shape();
        assert!(
            index < shape.data_words(),
            "data index {index} out of range for {} words",
            shape.data_words()
        );
        &self.words[HEADER_WORDS + shape.refs() + index]
    }

    /// Calls `visit` on every outgoing reference slot.
    ///
    /// The visitor may rewrite the slot it is handed; walking is restartable
    /// and a slot is never visited twice in one walk.
    pub(crate) fn walk_objects(self, mut visit: impl FnMut(&'h Slot)) {
        let refs = self.shape().refs();
        for word in &self.words[HEADER_WORDS..HEADER_WORDS + refs] {
            visit(Slot::from_word(word));
        }
    }

    /// Copies every word of this object into `dst`.
    pub(crate) fn copy_into(self, dst: &[AtomicUsize]) {
        debug_assert_eq!(dst.len(), self.words.len());
        for (from, to) in self.words.iter().zip(dst).skip(1) {
            to.store(from.load(Ordering::Acquire), Ordering::Relaxed);
        }
        dst[0].store(self.words[0].load(Ordering::Acquire), Ordering::Release);
    }
}

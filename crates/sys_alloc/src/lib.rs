//! Page arena primitives.
//!
//! A garbage-collected heap reserves one contiguous, aligned region up front
//! and carves fixed-size pages out of it. This crate provides the two OS
//! services that layout needs: an anonymous mapping whose start is aligned to
//! an arbitrary power of two, and `discard`, which returns a sub-range to the
//! zero-filled state without unmapping it.

use std::io;
use std::ptr;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is the system page size.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// A handle to an aligned anonymous memory region.
///
/// The region is unmapped when this handle is dropped.
pub struct Mmap {
    inner: os::MmapInner,
    offset: usize,
    len: usize,
}

impl Mmap {
    /// Returns a pointer to the aligned start of the region.
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr().wrapping_add(self.offset)
    }

    /// Returns the usable length of the region in bytes.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the usable region is empty.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns `[offset, offset + len)` of the region to zero.
    ///
    /// The OS-page-aligned middle of the range is handed back to the OS, the
    /// unaligned edges are cleared by hand.
    ///
    /// # Safety
    ///
    /// No other thread may access the range during the call.
    ///
    /// # Panics
    ///
    /// Panics if the range does not lie inside the region.
    pub unsafe fn discard(&self, offset: usize, len: usize) -> io::Result<()> {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "discard range {offset:#x}+{len:#x} outside region of {:#x} bytes",
            self.len
        );
        let start = self.ptr() as usize + offset;
        let end = start + len;
        let os_page = page_size();
        let inner_start = (start + os_page - 1) & !(os_page - 1);
        let inner_end = end & !(os_page - 1);

        let base = self.ptr();
        if inner_start >= inner_end {
            unsafe { ptr::write_bytes(base.add(offset), 0, len) };
            return Ok(());
        }
        unsafe {
            ptr::write_bytes(base.add(offset), 0, inner_start - start);
            ptr::write_bytes(base.add(inner_end - base as usize), 0, end - inner_end);
            self.inner
                .discard(base.add(inner_start - base as usize), inner_end - inner_start)
        }
    }
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

/// Configuration for creating a memory mapping.
#[derive(Debug, Clone)]
pub struct MmapOptions {
    len: usize,
    align: usize,
    populate: bool,
    no_reserve: bool,
}

impl MmapOptions {
    /// Creates a new `MmapOptions` with default settings (length 0).
    /// You must set a length before mapping.
    pub const fn new() -> Self {
        Self {
            len: 0,
            align: 1,
            populate: false,
            no_reserve: false,
        }
    }

    /// Sets the usable length of the mapping in bytes.
    #[must_use]
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Requires the start of the usable region to be a multiple of `align`.
    ///
    /// Alignments above the allocation granularity are met by over-reserving
    /// and skipping the unaligned head.
    #[must_use]
    pub const fn align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }

    /// Sets whether to pre-populate (prefault) the page tables.
    ///
    /// On Linux, this adds `MAP_POPULATE`.
    #[must_use]
    pub const fn populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// Sets whether to skip reserving swap space (on supported platforms).
    ///
    /// On Linux, this adds `MAP_NORESERVE`.
    #[must_use]
    pub const fn no_reserve(mut self, no_reserve: bool) -> Self {
        self.no_reserve = no_reserve;
        self
    }

    /// Creates the anonymous mapping.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a zero length or a non power-of-two
    /// alignment, and the OS error if the mapping fails.
    ///
    /// # Safety
    ///
    /// The returned pointer is raw memory: it stays valid only while the
    /// `Mmap` is alive.
    pub unsafe fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        if !self.align.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "alignment must be a power of two",
            ));
        }

        let slack = if self.align > allocation_granularity() {
            self.align
        } else {
            0
        };
        let total = self
            .len
            .checked_add(slack)
            .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;

        let inner = unsafe { os::MmapInner::map_anon(total, self.populate, self.no_reserve)? };
        let raw = inner.ptr() as usize;
        let offset = ((raw + self.align - 1) & !(self.align - 1)) - raw;

        Ok(Mmap {
            inner,
            offset,
            len: self.len,
        })
    }
}

impl Default for MmapOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "Page size should be power of 2");
    }

    #[test]
    fn test_allocation_granularity() {
        let ag = allocation_granularity();
        assert!(ag > 0);
        assert!(ag >= page_size());
    }

    #[test]
    fn test_zero_length_rejected() {
        let result = unsafe { MmapOptions::new().map_anon() };
        assert!(result.is_err());
    }

    #[test]
    fn test_aligned_reservation() {
        let align = 1 << 20;
        let mmap = unsafe {
            MmapOptions::new()
                .len(4 * align)
                .align(align)
                .no_reserve(true)
                .map_anon()
                .expect("failed to map")
        };

        assert_eq!(mmap.ptr() as usize % align, 0);
        assert_eq!(mmap.len(), 4 * align);

        let last = unsafe { mmap.ptr().add(mmap.len() - 1) };
        unsafe {
            ptr::write_volatile(last, 7);
            assert_eq!(ptr::read_volatile(last), 7);
        }
    }

    #[test]
    fn test_discard_zeroes_whole_pages() {
        let os_page = page_size();
        let mmap = unsafe {
            MmapOptions::new()
                .len(4 * os_page)
                .map_anon()
                .expect("failed to map")
        };

        unsafe {
            ptr::write_bytes(mmap.ptr(), 0xAB, 4 * os_page);
            mmap.discard(os_page, 2 * os_page).expect("discard failed");

            assert_eq!(ptr::read_volatile(mmap.ptr()), 0xAB);
            assert_eq!(ptr::read_volatile(mmap.ptr().add(os_page)), 0);
            assert_eq!(ptr::read_volatile(mmap.ptr().add(3 * os_page - 1)), 0);
            assert_eq!(ptr::read_volatile(mmap.ptr().add(3 * os_page)), 0xAB);
        }
    }

    #[test]
    fn test_discard_unaligned_range() {
        let os_page = page_size();
        let mmap = unsafe {
            MmapOptions::new()
                .len(2 * os_page)
                .map_anon()
                .expect("failed to map")
        };

        unsafe {
            ptr::write_bytes(mmap.ptr(), 0xCD, 2 * os_page);
            mmap.discard(100, 256).expect("discard failed");

            assert_eq!(ptr::read_volatile(mmap.ptr().add(99)), 0xCD);
            assert_eq!(ptr::read_volatile(mmap.ptr().add(100)), 0);
            assert_eq!(ptr::read_volatile(mmap.ptr().add(355)), 0);
            assert_eq!(ptr::read_volatile(mmap.ptr().add(356)), 0xCD);
        }
    }

    #[test]
    #[should_panic(expected = "outside region")]
    fn test_discard_out_of_bounds_panics() {
        let mmap = unsafe {
            MmapOptions::new()
                .len(page_size())
                .map_anon()
                .expect("failed to map")
        };
        unsafe {
            let _ = mmap.discard(0, 2 * page_size());
        }
    }
}

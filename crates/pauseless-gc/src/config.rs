//! Heap construction parameters.

use crate::error::HeapError;
use crate::object::MIN_OBJECT_SIZE;

/// Smallest supported page size in bytes.
pub const MIN_PAGE_SIZE: usize = 256;

/// Configuration for a [`Heap`](crate::Heap).
#[derive(Debug, Clone, PartialEq)]
pub struct HeapConfig {
    /// Size of one page in bytes. Must be a power of two.
    pub page_size: usize,
    /// Upper bound on the heap in bytes; the page-count ceiling is
    /// `max_heap_size / page_size`.
    pub max_heap_size: usize,
    /// Number of collector threads.
    pub gc_threads: usize,
    /// Fill fraction after which a page counts as past its relocation threshold.
    pub relocation_threshold: f64,
    /// Fraction of the page ceiling in use that requests a collection.
    pub collection_trigger: f64,
    /// Full pages whose live fraction exceeds this stay in place for a cycle.
    pub evacuation_live_ratio: f64,
    /// Prefault the whole reservation at construction.
    pub prefault: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            page_size: 32 * 1024,
            max_heap_size: 4 * 1024 * 1024,
            gc_threads: 2,
            relocation_threshold: 0.9,
            collection_trigger: 0.9,
            evacuation_live_ratio: 1.0,
            prefault: false,
        }
    }
}

impl HeapConfig {
    /// Create a configuration with the given page size and heap ceiling.
    #[must_use]
    pub fn new(page_size: usize, max_heap_size: usize) -> Self {
        Self {
            page_size,
            max_heap_size,
            ..Default::default()
        }
    }

    /// Set the number of collector threads.
    #[must_use]
    pub const fn with_gc_threads(mut self, threads: usize) -> Self {
        self.gc_threads = threads;
        self
    }

    /// Set the fraction of pages in use that requests a collection.
    #[must_use]
    pub const fn with_collection_trigger(mut self, fraction: f64) -> Self {
        self.collection_trigger = fraction;
        self
    }

    /// Set the live fraction above which a full page is not evacuated.
    #[must_use]
    pub const fn with_evacuation_live_ratio(mut self, ratio: f64) -> Self {
        self.evacuation_live_ratio = ratio;
        self
    }

    /// Set the relocation threshold fraction.
    #[must_use]
    pub const fn with_relocation_threshold(mut self, fraction: f64) -> Self {
        self.relocation_threshold = fraction;
        self
    }

    /// Prefault the reservation.
    #[must_use]
    pub const fn with_prefault(mut self, prefault: bool) -> Self {
        self.prefault = prefault;
        self
    }

    /// Page-count ceiling.
    #[must_use]
    pub const fn max_pages(&self) -> usize {
        self.max_heap_size / self.page_size
    }

    /// Largest single object in bytes.
    #[must_use]
    pub const fn max_object_size(&self) -> usize {
        self.page_size
    }

    /// Checks the configuration for consistency.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<(), HeapError> {
        let invalid = |reason: &str| Err(HeapError::InvalidConfig(reason.to_owned()));

        if !self.page_size.is_power_of_two() || self.page_size < MIN_PAGE_SIZE {
            return invalid("page_size must be a power of two of at least 256 bytes");
        }
        if self.page_size < 2 * MIN_OBJECT_SIZE {
            return invalid("page_size cannot hold two minimal objects");
        }
        if self.max_pages() == 0 {
            return invalid("max_heap_size is smaller than one page");
        }
        if self.gc_threads == 0 {
            return invalid("gc_threads must be at least 1");
        }
        for (name, value) in [
            ("relocation_threshold", self.relocation_threshold),
            ("collection_trigger", self.collection_trigger),
            ("evacuation_live_ratio", self.evacuation_live_ratio),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(HeapError::InvalidConfig(format!(
                    "{name} must lie in 0.0..=1.0, got {value}"
                )));
            }
        }
        Ok(())
    }
}

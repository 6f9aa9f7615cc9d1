//! Collector metrics and statistics.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Statistics for one completed collection cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleMetrics {
    /// Epoch of the cycle; its objects were stamped with this mark value.
    pub cycle: u64,
    /// Wall time from root-marking start to the end-of-cycle barrier.
    pub duration: Duration,
    /// Time until every root set was marked.
    pub root_marking: Duration,
    /// Time from the end of root marking to the successful checkpoint.
    pub tracing: Duration,
    /// Time from the checkpoint to the end-of-cycle barrier.
    pub relocation: Duration,
    /// Objects stamped by collector threads.
    pub objects_marked: usize,
    /// Bytes stamped by collector threads.
    pub bytes_marked: usize,
    /// Root sets marked by a collector thread for a blocked mutator.
    pub root_sets_on_behalf: usize,
    /// Checkpoints requested.
    pub checkpoints_requested: usize,
    /// Checkpoints aborted by a late publication.
    pub checkpoint_aborts: usize,
    /// Full pages blocked for relocation.
    pub pages_blocked: usize,
    /// Full pages with no live data returned without copying.
    pub pages_freed: usize,
    /// Full pages left in place by the evacuation policy.
    pub pages_kept: usize,
    /// Pages blocked in the previous cycle and returned to the pool.
    pub pages_unblocked: usize,
    /// Objects cloned by collector threads during relocation.
    pub objects_relocated: usize,
    /// Bytes cloned by collector threads during relocation.
    pub bytes_relocated: usize,
}

/// Point-in-time view of a heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Completed cycles.
    pub cycles: u64,
    /// Mark value of the next (or running) cycle.
    pub mark_value: u64,
    /// Registered mutators.
    pub mutators: usize,
    /// Page ceiling.
    pub max_pages: usize,
    /// Pages not in the available pool.
    pub pages_in_use: usize,
    /// Pages in the available pool.
    pub pages_available: usize,
    /// Relocatable pages waiting for the collector.
    pub pages_full: usize,
    /// Filled non-relocatable pages.
    pub pages_non_relocatable: usize,
    /// Partly used pages left by departed mutators, waiting for a new owner.
    pub pages_parked: usize,
    /// Pages ever taken from the unused tail of the reservation.
    pub pages_materialized: usize,
    /// Successful barrier CAS heals.
    pub barrier_heals: usize,
    /// Clones installed by a forwarding lookup, by any thread.
    pub clones_installed: usize,
    /// Clones rolled back after losing the installation race.
    pub clone_races_lost: usize,
}

/// Counters reset at every end-of-cycle barrier.
#[derive(Debug, Default)]
pub(crate) struct CycleCounters {
    pub(crate) objects_marked: AtomicUsize,
    pub(crate) bytes_marked: AtomicUsize,
    pub(crate) root_sets_on_behalf: AtomicUsize,
    pub(crate) checkpoints_requested: AtomicUsize,
    pub(crate) checkpoint_aborts: AtomicUsize,
    pub(crate) pages_blocked: AtomicUsize,
    pub(crate) pages_freed: AtomicUsize,
    pub(crate) pages_kept: AtomicUsize,
    pub(crate) pages_unblocked: AtomicUsize,
    pub(crate) objects_relocated: AtomicUsize,
    pub(crate) bytes_relocated: AtomicUsize,
}

/// Counters that live as long as the heap.
#[derive(Debug, Default)]
pub(crate) struct CumulativeCounters {
    pub(crate) barrier_heals: AtomicUsize,
    pub(crate) clones_installed: AtomicUsize,
    pub(crate) clone_races_lost: AtomicUsize,
}

/// Adds `n` to a counter.
#[inline]
pub(crate) fn bump(counter: &AtomicUsize, n: usize) {
    if n > 0 {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

fn take(counter: &AtomicUsize) -> usize {
    counter.swap(0, Ordering::Relaxed)
}

/// First-arrival timestamps of each phase boundary.
#[derive(Debug, Default, Clone, Copy)]
struct PhaseClock {
    started: Option<Instant>,
    roots_marked: Option<Instant>,
    traced: Option<Instant>,
}

/// Everything the collector records about itself.
#[derive(Debug, Default)]
pub(crate) struct CollectorMetrics {
    pub(crate) cycle: CycleCounters,
    pub(crate) cumulative: CumulativeCounters,
    clock: Mutex<PhaseClock>,
    last: Mutex<Option<CycleMetrics>>,
}

impl CollectorMetrics {
    pub(crate) fn cycle_started(&self) {
        *self.clock.lock() = PhaseClock {
            started: Some(Instant::now()),
            ..PhaseClock::default()
        };
    }

    pub(crate) fn roots_marked(&self) {
        self.clock.lock().roots_marked.get_or_insert_with(Instant::now);
    }

    pub(crate) fn tracing_finished(&self) {
        self.clock.lock().traced.get_or_insert_with(Instant::now);
    }

    /// Folds the per-cycle counters into a record for `cycle`.
    ///
    /// Runs under the end-of-cycle barrier, so no collector thread is still
    /// counting.
    pub(crate) fn finish_cycle(&self, cycle: u64) -> CycleMetrics {
        let clock = *self.clock.lock();
        let now = Instant::now();
        let since = |from: Option<Instant>, to: Option<Instant>| match (from, to) {
            (Some(from), Some(to)) => to.saturating_duration_since(from),
            _ => Duration::ZERO,
        };
        let c = &self.cycle;
        let metrics = CycleMetrics {
            cycle,
            duration: since(clock.started, Some(now)),
            root_marking: since(clock.started, clock.roots_marked),
            tracing: since(clock.roots_marked, clock.traced),
            relocation: since(clock.traced, Some(now)),
            objects_marked: take(&c.objects_marked),
            bytes_marked: take(&c.bytes_marked),
            root_sets_on_behalf: take(&c.root_sets_on_behalf),
            checkpoints_requested: take(&c.checkpoints_requested),
            checkpoint_aborts: take(&c.checkpoint_aborts),
            pages_blocked: take(&c.pages_blocked),
            pages_freed: take(&c.pages_freed),
            pages_kept: take(&c.pages_kept),
            pages_unblocked: take(&c.pages_unblocked),
            objects_relocated: take(&c.objects_relocated),
            bytes_relocated: take(&c.bytes_relocated),
        };
        *self.last.lock() = Some(metrics);
        metrics
    }

    pub(crate) fn last(&self) -> Option<CycleMetrics> {
        *self.last.lock()
    }

    pub(crate) fn barrier_heals(&self) -> usize {
        self.cumulative.barrier_heals.load(Ordering::Relaxed)
    }

    pub(crate) fn clones_installed(&self) -> usize {
        self.cumulative.clones_installed.load(Ordering::Relaxed)
    }

    pub(crate) fn clone_races_lost(&self) -> usize {
        self.cumulative.clone_races_lost.load(Ordering::Relaxed)
    }
}

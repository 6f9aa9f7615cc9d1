//! Shared state of one heap's collector.
//!
//! [`CollectorContext`] owns every lock, counter and condition variable the
//! collector threads and mutators coordinate through. Each concern sits
//! behind its own mutex:
//!
//! | State            | Lock                  | Waiters                         |
//! |------------------|-----------------------|---------------------------------|
//! | cycle control    | `control`             | `full_gc` callers, idle threads |
//! | mutator registry | `registry`            | none                            |
//! | blocked roots    | `roots`               | non-winning collector threads   |
//! | tracing          | `tracing`             | idle collector threads          |
//!
//! Lock order: `registry`, then a mutator's state lock, then a mutator's
//! roots. A worklist lock may be followed by `tracing`. `registry` and
//! `tracing` are never held together, and rendezvous locks are leaves.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};

use crate::metrics::{bump, CollectorMetrics};
use crate::mutator::MutatorShared;
use crate::page::PageId;
use crate::rendezvous::Rendezvous;
use crate::tracing::internal;
use crate::worklist::Worklist;

// ============================================================================
// Cycle control
// ============================================================================

#[derive(Debug, Default)]
struct CycleControl {
    /// Highest cycle anyone asked for.
    requested: u64,
    /// Highest cycle whose root marking began.
    started: u64,
    /// Cycles finished.
    completed: u64,
    shutdown: bool,
}

// ============================================================================
// Mutator registry
// ============================================================================

/// Every registered mutator, plus the cycle new registrants join in.
#[derive(Debug, Default)]
pub(crate) struct MutatorRegistry {
    pub(crate) mutators: Vec<Arc<MutatorShared>>,
    /// Latest cycle whose root-marking request went out.
    pub(crate) signalled_cycle: u64,
}

// ============================================================================
// Root marking
// ============================================================================

#[derive(Debug, Default)]
struct BlockedRoots {
    /// Mutators that were blocked when root marking was requested.
    pending: Vec<Arc<MutatorShared>>,
    done_signalling: bool,
}

// ============================================================================
// Tracing and checkpoints
// ============================================================================

#[derive(Debug, Default)]
struct Checkpoint {
    id: u64,
    requested: bool,
    /// Set once the requester knows how many mutators to wait for.
    armed: bool,
    target: usize,
    passed: usize,
}

#[derive(Debug, Default)]
struct TracingState {
    /// Published mutator worklists waiting to be stolen.
    non_empty: Vec<Arc<Worklist>>,
    /// Collector threads with nothing to do.
    idle: usize,
    checkpoint: Checkpoint,
    /// Marking for this cycle is over; late publications are declined.
    finished: bool,
}

/// Shared state of a heap's collector.
#[derive(Debug)]
pub(crate) struct CollectorContext {
    gc_threads: usize,

    control: Mutex<CycleControl>,
    control_cv: Condvar,
    completed: AtomicU64,

    pub(crate) registry: Mutex<MutatorRegistry>,

    root_marking_claimed: AtomicBool,
    globals_claimed: AtomicBool,
    roots: Mutex<BlockedRoots>,
    roots_cv: Condvar,
    /// One arrival per registered mutator's root set.
    pub(crate) root_sets: Rendezvous,

    tracing: Mutex<TracingState>,
    tracing_cv: Condvar,

    relocation_claimed: AtomicBool,
    /// One arrival per mutator that enabled its GC trap.
    pub(crate) trap_acks: Rendezvous,
    relocation_start: Rendezvous,
    pub(crate) pages_to_relocate: SegQueue<PageId>,
    /// Pages blocked this cycle, unblocked at the next relocation.
    pub(crate) pages_to_unblock: Mutex<Vec<PageId>>,

    end_of_cycle: Rendezvous,

    pub(crate) metrics: CollectorMetrics,
}

impl CollectorContext {
    pub(crate) fn new(gc_threads: usize) -> Self {
        Self {
            gc_threads,
            control: Mutex::new(CycleControl::default()),
            control_cv: Condvar::new(),
            completed: AtomicU64::new(0),
            registry: Mutex::new(MutatorRegistry::default()),
            root_marking_claimed: AtomicBool::new(false),
            globals_claimed: AtomicBool::new(false),
            roots: Mutex::new(BlockedRoots::default()),
            roots_cv: Condvar::new(),
            root_sets: Rendezvous::new("root sets", 0),
            tracing: Mutex::new(TracingState::default()),
            tracing_cv: Condvar::new(),
            relocation_claimed: AtomicBool::new(false),
            trap_acks: Rendezvous::new("trap acks", 0),
            relocation_start: Rendezvous::new("relocation start", 1),
            pages_to_relocate: SegQueue::new(),
            pages_to_unblock: Mutex::new(Vec::new()),
            end_of_cycle: Rendezvous::new("end of cycle", gc_threads),
            metrics: CollectorMetrics::default(),
        }
    }

    pub(crate) const fn gc_threads(&self) -> usize {
        self.gc_threads
    }

    // ------------------------------------------------------------------------
    // Cycle control
    // ------------------------------------------------------------------------

    /// Cycles finished so far.
    pub(crate) fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Mark value of the running or next cycle.
    pub(crate) fn mark_value(&self) -> u64 {
        self.completed() + 1
    }

    /// Asks for one more cycle unless one is already pending.
    pub(crate) fn request_collection(&self) {
        let mut control = self.control.lock();
        if control.shutdown {
            return;
        }
        if control.requested <= control.completed {
            control.requested = control.completed + 1;
            self.control_cv.notify_all();
        }
    }

    /// Requests a cycle that starts after this call and waits for it.
    ///
    /// If a cycle is already running its root sets may have been marked
    /// before the call, so the one after it is awaited instead.
    pub(crate) fn full_gc(&self) {
        let mut control = self.control.lock();
        if control.shutdown {
            return;
        }
        let target = if control.started > control.completed {
            control.completed + 2
        } else {
            control.completed + 1
        };
        control.requested = control.requested.max(target);
        self.control_cv.notify_all();
        while control.completed < target {
            self.control_cv.wait(&mut control);
        }
    }

    /// Blocks a collector thread until there is a cycle to run.
    ///
    /// Returns `None` on shutdown once no requested cycle is outstanding.
    /// Every collector thread evaluates the same predicate on the same
    /// state, so either all of them run the cycle or none does.
    pub(crate) fn wait_for_cycle(&self) -> Option<u64> {
        let mut control = self.control.lock();
        loop {
            if control.requested > control.completed {
                return Some(control.completed + 1);
            }
            if control.shutdown {
                return None;
            }
            self.control_cv.wait(&mut control);
        }
    }

    /// Stops accepting requests and wakes idle collector threads.
    pub(crate) fn shutdown(&self) {
        self.control.lock().shutdown = true;
        self.control_cv.notify_all();
    }

    fn mark_started(&self, cycle: u64) {
        let mut control = self.control.lock();
        debug_assert_eq!(control.completed + 1, cycle, "cycle {cycle} started out of order");
        control.started = cycle;
    }

    // ------------------------------------------------------------------------
    // Root marking
    // ------------------------------------------------------------------------

    /// Elects the collector thread that signals root marking.
    pub(crate) fn claim_root_marking(&self) -> bool {
        !self.root_marking_claimed.swap(true, Ordering::AcqRel)
    }

    /// Asks every mutator to mark its roots for `cycle`.
    ///
    /// Run by the elected thread. Mutators that are blocked cannot answer,
    /// so they are parked in a list the collector threads drain.
    pub(crate) fn signal_root_marking(&self, cycle: u64) {
        self.metrics.cycle_started();
        self.mark_started(cycle);

        let mut blocked = Vec::new();
        {
            let mut registry = self.registry.lock();
            registry.signalled_cycle = cycle;
            self.root_sets.reset(registry.mutators.len());
            for mutator in &registry.mutators {
                if mutator.trigger_mark_root_set(cycle) {
                    blocked.push(Arc::clone(mutator));
                }
            }
        }

        let mut roots = self.roots.lock();
        roots.pending = blocked;
        roots.done_signalling = true;
        self.roots_cv.notify_all();
    }

    /// Waits until the elected thread has signalled every mutator.
    pub(crate) fn await_root_signalling(&self) {
        let mut roots = self.roots.lock();
        while !roots.done_signalling {
            self.roots_cv.wait(&mut roots);
        }
    }

    /// Elects the collector thread that marks the globals.
    pub(crate) fn claim_globals(&self) -> bool {
        !self.globals_claimed.swap(true, Ordering::AcqRel)
    }

    /// Takes one blocked mutator whose roots still need marking.
    pub(crate) fn pop_blocked_root_set(&self) -> Option<Arc<MutatorShared>> {
        self.roots.lock().pending.pop()
    }

    // ------------------------------------------------------------------------
    // Tracing
    // ------------------------------------------------------------------------

    /// Publishes a mutator worklist that just became non-empty.
    ///
    /// Called with the worklist lock held. Returns `false` once marking has
    /// finished for the cycle. A publication while a checkpoint is pending
    /// aborts it.
    pub(crate) fn publish(&self, list: Arc<Worklist>) -> bool {
        let mut state = self.tracing.lock();
        if state.finished {
            return false;
        }
        state.non_empty.push(list);
        if state.checkpoint.requested {
            state.checkpoint.requested = false;
            state.checkpoint.armed = false;
            bump(&self.metrics.cycle.checkpoint_aborts, 1);
            internal::log_checkpoint_aborted(state.checkpoint.id);
        }
        self.tracing_cv.notify_all();
        true
    }

    /// Counts one mutator past checkpoint `id`; stale ids are ignored.
    pub(crate) fn signal_safepoint_reached(&self, id: u64) {
        let mut state = self.tracing.lock();
        if state.checkpoint.requested && state.checkpoint.id == id {
            state.checkpoint.passed += 1;
            self.tracing_cv.notify_all();
        }
    }

    /// Blocks an out-of-work collector thread until it can steal a
    /// published worklist (`Some`) or marking is complete (`None`).
    ///
    /// Marking is complete when every collector thread is idle, no
    /// published list is waiting and every mutator has passed a checkpoint
    /// requested after the last publication.
    pub(crate) fn find_work(&self) -> Option<Arc<Worklist>> {
        let mut state = self.tracing.lock();
        state.idle += 1;
        loop {
            if let Some(list) = state.non_empty.pop() {
                state.idle -= 1;
                return Some(list);
            }
            if state.finished {
                return None;
            }
            if state.idle == self.gc_threads {
                if !state.checkpoint.requested {
                    let id = state.checkpoint.id + 1;
                    state.checkpoint = Checkpoint {
                        id,
                        requested: true,
                        ..Checkpoint::default()
                    };
                    drop(state);
                    self.request_checkpoint(id);
                    state = self.tracing.lock();
                    continue;
                }
                let checkpoint = &state.checkpoint;
                if checkpoint.armed && checkpoint.passed >= checkpoint.target {
                    state.finished = true;
                    self.metrics.tracing_finished();
                    self.tracing_cv.notify_all();
                    return None;
                }
            }
            self.tracing_cv.wait(&mut state);
        }
    }

    /// Asks every registered mutator to pass checkpoint `id`.
    fn request_checkpoint(&self, id: u64) {
        bump(&self.metrics.cycle.checkpoints_requested, 1);
        let mutators = self.registry.lock().mutators.clone();
        internal::log_checkpoint_requested(id, mutators.len());
        {
            let mut state = self.tracing.lock();
            if state.checkpoint.requested && state.checkpoint.id == id {
                state.checkpoint.target = mutators.len();
                state.checkpoint.armed = true;
            }
        }
        for mutator in &mutators {
            mutator.request_safe_point(self, id);
        }
    }

    // ------------------------------------------------------------------------
    // Relocation
    // ------------------------------------------------------------------------

    /// Elects the collector thread that selects pages and flips GC traps.
    pub(crate) fn claim_relocation(&self) -> bool {
        !self.relocation_claimed.swap(true, Ordering::AcqRel)
    }

    /// Lets the other collector threads start relocating.
    pub(crate) fn open_relocation(&self) {
        self.relocation_start.arrive();
    }

    pub(crate) fn await_relocation_start(&self) {
        self.relocation_start.wait();
    }

    // ------------------------------------------------------------------------
    // End of cycle
    // ------------------------------------------------------------------------

    /// Meets every other collector thread at the end of `cycle`.
    ///
    /// The last arriver resets the per-cycle state and publishes the cycle
    /// as completed before anyone is released.
    pub(crate) fn end_cycle(&self, cycle: u64) {
        self.end_of_cycle.arrive_and_wait(|| {
            self.root_marking_claimed.store(false, Ordering::Release);
            self.globals_claimed.store(false, Ordering::Release);
            *self.roots.lock() = BlockedRoots::default();
            {
                let mut state = self.tracing.lock();
                debug_assert!(state.finished, "cycle {cycle} ended before marking finished");
                state.idle = 0;
                state.finished = false;
                state.checkpoint.requested = false;
                state.checkpoint.armed = false;
            }
            self.relocation_claimed.store(false, Ordering::Release);
            self.relocation_start.reset(1);
            debug_assert!(self.pages_to_relocate.is_empty());

            internal::log_cycle_complete(&self.metrics.finish_cycle(cycle));

            let mut control = self.control.lock();
            control.completed = cycle;
            self.completed.store(cycle, Ordering::Release);
            self.control_cv.notify_all();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_request_collection_is_idempotent() {
        let ctx = CollectorContext::new(1);
        ctx.request_collection();
        ctx.request_collection();
        assert_eq!(ctx.wait_for_cycle(), Some(1));
        assert_eq!(ctx.control.lock().requested, 1);
    }

    #[test]
    fn test_shutdown_without_request_stops_threads() {
        let ctx = CollectorContext::new(1);
        ctx.shutdown();
        assert_eq!(ctx.wait_for_cycle(), None);
        ctx.request_collection();
        assert_eq!(ctx.wait_for_cycle(), None);
    }

    #[test]
    fn test_requested_cycle_outlives_shutdown() {
        let ctx = CollectorContext::new(1);
        ctx.request_collection();
        ctx.shutdown();
        assert_eq!(ctx.wait_for_cycle(), Some(1));
    }

    #[test]
    fn test_publish_after_finish_is_declined() {
        let ctx = CollectorContext::new(1);
        // No mutators and one idle thread: the first checkpoint succeeds.
        assert!(ctx.find_work().is_none());
        assert!(!ctx.publish(Arc::new(Worklist::new())));
    }

    #[test]
    fn test_publication_wakes_idle_thread() {
        let ctx = Arc::new(CollectorContext::new(2));
        let stealer = {
            let ctx = Arc::clone(&ctx);
            thread::spawn(move || ctx.find_work().is_some())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(ctx.publish(Arc::new(Worklist::new())));
        assert!(stealer.join().unwrap());
    }

    #[test]
    fn test_publication_aborts_pending_checkpoint() {
        let ctx = CollectorContext::new(1);
        {
            let mut state = ctx.tracing.lock();
            state.checkpoint = Checkpoint {
                id: 7,
                requested: true,
                armed: true,
                target: 1,
                passed: 0,
            };
        }
        assert!(ctx.publish(Arc::new(Worklist::new())));
        // A signal for the aborted checkpoint no longer counts.
        ctx.signal_safepoint_reached(7);
        let state = ctx.tracing.lock();
        assert!(!state.checkpoint.requested);
        assert_eq!(state.checkpoint.passed, 0);
        drop(state);
        assert_eq!(
            ctx.metrics
                .cycle
                .checkpoint_aborts
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_end_cycle_advances_mark_value() {
        let ctx = CollectorContext::new(1);
        ctx.request_collection();
        let cycle = ctx.wait_for_cycle().unwrap();
        assert!(ctx.claim_root_marking());
        ctx.signal_root_marking(cycle);
        assert!(!ctx.claim_root_marking());
        assert!(ctx.find_work().is_none());
        ctx.end_cycle(cycle);

        assert_eq!(ctx.completed(), 1);
        assert_eq!(ctx.mark_value(), 2);
        assert!(ctx.claim_root_marking());
        assert_eq!(ctx.metrics.last().map(|m| m.cycle), Some(1));
    }

    #[test]
    fn test_full_gc_waits_for_cycle_after_running_one() {
        let ctx = Arc::new(CollectorContext::new(1));
        ctx.request_collection();
        let first = ctx.wait_for_cycle().unwrap();
        ctx.mark_started(first);

        let waiter = {
            let ctx = Arc::clone(&ctx);
            thread::spawn(move || {
                ctx.full_gc();
                ctx.completed()
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(ctx.control.lock().requested, 2);

        for cycle in [first, first + 1] {
            assert!(ctx.find_work().is_none());
            ctx.end_cycle(cycle);
            if cycle == first {
                assert_eq!(ctx.wait_for_cycle(), Some(2));
                ctx.mark_started(2);
            }
        }
        assert_eq!(waiter.join().unwrap(), 2);
    }
}

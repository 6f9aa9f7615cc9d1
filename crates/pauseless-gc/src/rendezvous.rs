//! A reusable N-party rendezvous barrier.
//!
//! The collector meets at several points per cycle. One primitive covers all
//! of them, used in one of two modes:
//!
//! | Mode   | Calls                           | Used for                                  |
//! |--------|---------------------------------|-------------------------------------------|
//! | latch  | `reset(n)`, `arrive()`, `wait()` | root sets marked, GC trap acknowledgements, relocation start |
//! | cyclic | `arrive_and_wait(on_last)`       | end of cycle                              |
//!
//! In latch mode arrivals and waiters are different parties: mutators (or
//! collector threads on their behalf) arrive, collector threads wait. In
//! cyclic mode every party both arrives and waits, and the last one runs a
//! closure under the barrier lock before releasing the rest.

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct State {
    target: usize,
    arrived: usize,
    generation: u64,
}

/// Counting barrier built on one mutex and one condition variable.
#[derive(Debug)]
pub(crate) struct Rendezvous {
    name: &'static str,
    state: Mutex<State>,
    cv: Condvar,
}

impl Rendezvous {
    /// Creates a barrier expecting `parties` arrivals.
    pub(crate) const fn new(name: &'static str, parties: usize) -> Self {
        Self {
            name,
            state: Mutex::new(State {
                target: parties,
                arrived: 0,
                generation: 0,
            }),
            cv: Condvar::new(),
        }
    }

    /// Re-arms a latch for `target` arrivals.
    pub(crate) fn reset(&self, target: usize) {
        let mut state = self.state.lock();
        state.target = target;
        state.arrived = 0;
        state.generation += 1;
        if target == 0 {
            self.cv.notify_all();
        }
    }

    /// Records one arrival without waiting; returns `true` for the last one.
    pub(crate) fn arrive(&self) -> bool {
        let mut state = self.state.lock();
        state.arrived += 1;
        debug_assert!(
            state.arrived <= state.target,
            "{}: {} arrivals for {} parties",
            self.name,
            state.arrived,
            state.target
        );
        let complete = state.arrived == state.target;
        if complete {
            self.cv.notify_all();
        }
        complete
    }

    /// Blocks until the current latch is complete.
    pub(crate) fn wait(&self) {
        let mut state = self.state.lock();
        while state.arrived < state.target {
            self.cv.wait(&mut state);
        }
    }

    /// Whether every expected party has arrived.
    #[cfg(test)]
    pub(crate) fn is_complete(&self) -> bool {
        let state = self.state.lock();
        state.arrived >= state.target
    }

    /// Cyclic mode: arrives and waits for the other parties.
    ///
    /// The last party runs `on_last` while holding the barrier lock, re-arms
    /// the barrier and wakes everybody. Returns `true` for that party.
    pub(crate) fn arrive_and_wait(&self, on_last: impl FnOnce()) -> bool {
        let mut state = self.state.lock();
        state.arrived += 1;
        if state.arrived == state.target {
            on_last();
            state.arrived = 0;
            state.generation += 1;
            self.cv.notify_all();
            return true;
        }
        let generation = state.generation;
        while state.generation == generation {
            self.cv.wait(&mut state);
        }
        false
    }
}

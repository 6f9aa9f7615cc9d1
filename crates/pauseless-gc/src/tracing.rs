//! Collector tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! spans and events for collection cycles. Without it every helper compiles
//! to nothing, so call sites need no `cfg`.

use std::fmt;

/// Phases of a collection cycle as seen by one collector thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Mark globals and every mutator's root set.
    RootMarking,
    /// Drain worklists until a checkpoint finds none.
    Tracing,
    /// Block sparse pages and move their live objects.
    Relocating,
    /// Wait for every collector thread to finish the cycle.
    EndOfCycle,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RootMarking => "root_marking",
            Self::Tracing => "tracing",
            Self::Relocating => "relocating",
            Self::EndOfCycle => "end_of_cycle",
        };
        f.write_str(name)
    }
}

#[cfg(feature = "tracing")]
pub(crate) mod internal {
    use super::Phase;
    use crate::metrics::CycleMetrics;
    use tracing::{span, Level};

    pub(crate) type SpanGuard = span::EnteredSpan;

    /// Span covering one collector thread's share of a cycle.
    pub(crate) fn trace_cycle(cycle: u64, thread: usize) -> SpanGuard {
        span!(Level::DEBUG, "gc_cycle", cycle, thread).entered()
    }

    /// Span for a phase, nested in the cycle span.
    pub(crate) fn trace_phase(phase: Phase) -> SpanGuard {
        span!(Level::DEBUG, "gc_phase", phase = %phase).entered()
    }

    pub(crate) fn log_phase_start(phase: Phase) {
        tracing::debug!(phase = %phase, "phase_start");
    }

    pub(crate) fn log_phase_end(phase: Phase) {
        tracing::debug!(phase = %phase, "phase_end");
    }

    pub(crate) fn log_checkpoint_requested(id: u64, mutators: usize) {
        tracing::debug!(checkpoint = id, mutators, "checkpoint_requested");
    }

    pub(crate) fn log_checkpoint_aborted(id: u64) {
        tracing::debug!(checkpoint = id, "checkpoint_aborted");
    }

    pub(crate) fn log_page_selection(blocked: usize, kept: usize, freed: usize, unblocked: usize) {
        tracing::debug!(blocked, kept, freed, unblocked, "page_selection");
    }

    pub(crate) fn log_page_relocated(page: usize, live: usize, objects: usize, bytes: usize) {
        tracing::trace!(page, live, objects, bytes, "page_relocated");
    }

    pub(crate) fn log_cycle_complete(metrics: &CycleMetrics) {
        tracing::debug!(
            cycle = metrics.cycle,
            duration = ?metrics.duration,
            objects_marked = metrics.objects_marked,
            bytes_marked = metrics.bytes_marked,
            pages_blocked = metrics.pages_blocked,
            pages_freed = metrics.pages_freed,
            "cycle_complete"
        );
    }
}

#[cfg(not(feature = "tracing"))]
#[allow(clippy::missing_const_for_fn)]
pub(crate) mod internal {
    use super::Phase;
    use crate::metrics::CycleMetrics;

    /// Stub guard when tracing is disabled.
    pub(crate) struct SpanGuard;

    #[inline]
    pub(crate) fn trace_cycle(_cycle: u64, _thread: usize) -> SpanGuard {
        SpanGuard
    }

    #[inline]
    pub(crate) fn trace_phase(_phase: Phase) -> SpanGuard {
        SpanGuard
    }

    #[inline]
    pub(crate) fn log_phase_start(_phase: Phase) {}

    #[inline]
    pub(crate) fn log_phase_end(_phase: Phase) {}

    #[inline]
    pub(crate) fn log_checkpoint_requested(_id: u64, _mutators: usize) {}

    #[inline]
    pub(crate) fn log_checkpoint_aborted(_id: u64) {}

    #[inline]
    pub(crate) fn log_page_selection(_blocked: usize, _kept: usize, _freed: usize, _unblocked: usize) {}

    #[inline]
    pub(crate) fn log_page_relocated(_page: usize, _live: usize, _objects: usize, _bytes: usize) {}

    #[inline]
    pub(crate) fn log_cycle_complete(_metrics: &CycleMetrics) {}
}

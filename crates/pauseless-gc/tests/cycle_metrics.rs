//! Integration tests for per-cycle metrics and heap statistics.

use std::time::Duration;

use pauseless_gc::{Heap, HeapConfig, ObjectShape, Value};

const NODE: ObjectShape = ObjectShape::new(1, 1);

fn heap() -> Heap {
    Heap::new(HeapConfig::new(4096, 64 * 4096).with_gc_threads(2)).unwrap()
}

#[test]
fn test_no_metrics_before_first_cycle() {
    let heap = heap();
    assert!(heap.last_cycle_metrics().is_none());

    let stats = heap.stats();
    assert_eq!(stats.cycles, 0);
    assert_eq!(stats.mark_value, 1);
    assert_eq!(stats.max_pages, 64);
    assert_eq!(stats.pages_in_use, 0);
    assert_eq!(stats.pages_available, 64);
}

/// Marked object and byte counts match the live graph exactly.
#[test]
fn test_marking_counts_match_live_graph() {
    let heap = heap();
    let mut m = heap.mutator();
    let a = m.allocate(NODE);
    let b = m.allocate(NODE);
    let c = m.allocate(NODE);
    m.write_field(a, 0, Value::Object(b));
    m.write_field(b, 0, Value::Object(c));
    m.push_root(Value::Object(a));
    m.allocate(NODE);

    m.collect();

    let metrics = heap.last_cycle_metrics().unwrap();
    assert_eq!(metrics.cycle, 1);
    assert_eq!(metrics.objects_marked, 3);
    assert_eq!(metrics.bytes_marked, 3 * NODE.size_in_bytes());
    // `collect` parks the calling mutator, so its roots are marked for it.
    assert_eq!(metrics.root_sets_on_behalf, 1);
    assert!(metrics.checkpoints_requested >= 1);
}

/// Phase timings never add up to more than the whole cycle.
#[test]
fn test_phase_timing_fits_in_cycle() {
    let heap = heap();
    let mut m = heap.mutator();
    for _ in 0..100 {
        let obj = m.allocate(NODE);
        m.push_root(Value::Object(obj));
    }

    m.collect();

    let metrics = heap.last_cycle_metrics().unwrap();
    let phases = metrics.root_marking + metrics.tracing + metrics.relocation;
    assert!(
        phases <= metrics.duration + Duration::from_micros(100),
        "phases took {phases:?} in a {:?} cycle",
        metrics.duration
    );
}

/// Counters start from zero every cycle.
#[test]
fn test_counters_reset_between_cycles() {
    let heap = heap();
    let mut m = heap.mutator();
    for _ in 0..10 {
        let obj = m.allocate(NODE);
        m.push_root(Value::Object(obj));
    }

    m.collect();
    assert_eq!(heap.last_cycle_metrics().unwrap().objects_marked, 10);

    m.truncate_roots(4);
    m.collect();
    let metrics = heap.last_cycle_metrics().unwrap();
    assert_eq!(metrics.cycle, 2);
    assert_eq!(metrics.objects_marked, 4);
}

#[test]
fn test_stats_track_page_pools() {
    let heap = heap();
    let mut m = heap.mutator();
    let quarter = ObjectShape::new(0, 126);
    for _ in 0..5 {
        m.allocate(quarter);
    }
    m.allocate_pinned(NODE);

    let stats = heap.stats();
    assert_eq!(stats.mutators, 1);
    assert_eq!(stats.pages_in_use, 3);
    assert_eq!(stats.pages_full, 1);
    assert_eq!(stats.pages_materialized, 3);
    assert_eq!(stats.pages_available, 61);

    let pinned_page = m.pinned_page();
    drop(m);
    let stats = heap.stats();
    assert_eq!(stats.mutators, 0);
    assert_eq!(stats.pages_full, 1);
    assert_eq!(stats.pages_parked, 2);
    assert_eq!(stats.pages_non_relocatable, 0);
    assert_eq!(stats.pages_in_use, 3);

    // The next mutator continues the parked pinned page.
    let mut m = heap.mutator();
    m.allocate_pinned(NODE);
    assert_eq!(m.pinned_page(), pinned_page);
    assert_eq!(heap.stats().pages_parked, 1);
}

/// Flipping the expected NMT makes the next cycle heal every live slot once.
#[test]
fn test_barrier_heals_accumulate() {
    let heap = heap();
    let mut m = heap.mutator();
    let a = m.allocate(NODE);
    let b = m.allocate(NODE);
    m.write_field(a, 0, Value::Object(b));
    m.push_root(Value::Object(a));

    m.collect();
    let after_first = heap.stats().barrier_heals;
    assert!(after_first >= 2, "root and field should both heal, got {after_first}");

    m.collect();
    assert!(heap.stats().barrier_heals >= after_first + 2);
}

#[test]
fn test_relocation_counters() {
    let heap = heap();
    let mut m = heap.mutator();
    let quarter = ObjectShape::new(0, 126);
    let keep = m.allocate(quarter);
    m.push_root(Value::Object(keep));
    for _ in 0..4 {
        m.allocate(quarter);
    }

    m.collect();
    let metrics = heap.last_cycle_metrics().unwrap();
    assert_eq!(metrics.pages_blocked, 1);
    assert_eq!(metrics.objects_relocated, 1);
    assert_eq!(metrics.bytes_relocated, quarter.size_in_bytes());

    m.collect();
    assert_eq!(heap.last_cycle_metrics().unwrap().pages_unblocked, 1);
}

//! Checkpoint tests: marking does not end, and relocation does not begin,
//! while a mutator holds back its checkpoint or has just published work.

#![cfg(feature = "test-util")]

use std::thread;
use std::time::{Duration, Instant};

use pauseless_gc::test_util::{gc_trap_enabled, mark_roots_only, pass_checkpoint, publish_work, take_checkpoint};
use pauseless_gc::{Heap, HeapConfig, Mutator, ObjectRef, ObjectShape, PageId, PageState, Value};

const PAGE: usize = 4096;

/// A quarter of a page.
const QUARTER: ObjectShape = ObjectShape::new(1, 125);

fn heap() -> Heap {
    Heap::new(HeapConfig::new(PAGE, 32 * PAGE).with_gc_threads(1)).unwrap()
}

/// Yields a page holding one rooted and three dead objects, which the
/// next relocation will block.
fn sparse_page(m: &mut Mutator, heap: &Heap) -> (PageId, ObjectRef) {
    let objects: Vec<_> = (0..4).map(|_| m.allocate(QUARTER)).collect();
    m.write_word(objects[0], 0, 21);
    m.push_root(Value::Object(objects[0]));
    m.allocate(QUARTER);
    let page = heap.page_of(objects[0]);
    assert_eq!(heap.page_info(page).unwrap().state, PageState::Full);
    (page, objects[0])
}

fn until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::yield_now();
    }
}

/// Nothing past marking has happened: no trap flip, no blocked page, no
/// completed cycle.
fn assert_still_marking(heap: &Heap, m: &Mutator, page: PageId) {
    thread::sleep(Duration::from_millis(30));
    assert!(gc_trap_enabled(m));
    assert_eq!(heap.page_info(page).unwrap().state, PageState::Full);
    assert_eq!(heap.cycles(), 0);
}

/// A mutator that marked its roots but holds back its checkpoint keeps the
/// cycle in marking until it passes.
#[test]
fn test_withheld_checkpoint_holds_back_relocation() {
    let heap = heap();
    let mut m = heap.mutator();
    let (page, _) = sparse_page(&mut m, &heap);

    thread::scope(|s| {
        let waiter = s.spawn(|| heap.full_gc());

        until("root marking request", || mark_roots_only(&mut m));
        let mut checkpoint = None;
        until("checkpoint request", || {
            checkpoint = take_checkpoint(&m);
            checkpoint.is_some()
        });
        assert_still_marking(&heap, &m, page);
        assert!(!waiter.is_finished());

        pass_checkpoint(&m, checkpoint.unwrap());
        until("cycle end", || {
            m.safepoint();
            waiter.is_finished()
        });
    });

    assert_eq!(heap.cycles(), 1);
    assert_eq!(heap.page_info(page).unwrap().state, PageState::Blocked);
    let metrics = heap.last_cycle_metrics().unwrap();
    assert_eq!(metrics.checkpoints_requested, 1);
    assert_eq!(metrics.checkpoint_aborts, 0);
}

/// Publishing a worklist while a checkpoint is pending aborts it: passing
/// the aborted checkpoint afterwards does not end marking, and only the
/// next checkpoint does.
#[test]
fn test_publication_aborts_pending_checkpoint() {
    let heap = heap();
    let mut m = heap.mutator();
    let (page, live) = sparse_page(&mut m, &heap);
    let root = m.root_count() - 1;

    thread::scope(|s| {
        let waiter = s.spawn(|| heap.full_gc());

        until("root marking request", || mark_roots_only(&mut m));
        let mut first = None;
        until("first checkpoint request", || {
            first = take_checkpoint(&m);
            first.is_some()
        });
        let first = first.unwrap();

        publish_work(&m, live);
        pass_checkpoint(&m, first);
        assert_still_marking(&heap, &m, page);

        let mut second = None;
        until("second checkpoint request", || {
            second = take_checkpoint(&m);
            second.is_some()
        });
        let second = second.unwrap();
        assert!(second > first);
        assert_still_marking(&heap, &m, page);

        pass_checkpoint(&m, second);
        until("cycle end", || {
            m.safepoint();
            waiter.is_finished()
        });
    });

    let metrics = heap.last_cycle_metrics().unwrap();
    assert_eq!(metrics.checkpoint_aborts, 1);
    assert_eq!(metrics.checkpoints_requested, 2);
    assert_eq!(heap.page_info(page).unwrap().state, PageState::Blocked);

    let moved = m.root(root).as_object().unwrap();
    assert_ne!(heap.page_of(moved), page);
    assert_eq!(m.read_word(moved, 0), 21);
}

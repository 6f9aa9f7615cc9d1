//! Marking verification.

use std::collections::HashSet;
use std::fmt;

use crate::barrier::forwarded_address;
use crate::heap::HeapInner;
use crate::object::Slot;
use crate::tagged::{GcField, ObjectRef};

/// A reachable object whose GC field is not the expected mark stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkingError {
    /// The offending object, after following relocation.
    pub object: ObjectRef,
    /// Its GC field.
    pub found: GcField,
    /// The epoch every reachable object should carry.
    pub expected: u64,
}

impl fmt::Display for MarkingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reachable object {:?} has GC field {:?}, expected a stamp for epoch {}",
            self.object, self.found, self.expected
        )
    }
}

impl std::error::Error for MarkingError {}

fn push_referent(slot: &Slot, heap: &HeapInner, stack: &mut Vec<ObjectRef>) {
    if let Some((obj, _)) = slot.load().as_pointer() {
        stack.push(forwarded_address(heap, obj));
    }
}

/// Walks everything reachable from globals and root sets without barriers
/// and checks each object carries the last completed epoch's stamp.
pub(crate) fn verify_marking(heap: &HeapInner) -> Result<usize, MarkingError> {
    let expected = heap.collector.completed();
    let mut stack = Vec::new();
    for slot in heap.globals.lock().iter() {
        push_referent(slot, heap, &mut stack);
    }
    for mutator in heap.collector.registry.lock().mutators.iter() {
        for slot in mutator.roots().iter() {
            push_referent(slot, heap, &mut stack);
        }
    }

    let mut seen = HashSet::new();
    while let Some(obj) = stack.pop() {
        if !seen.insert(obj) {
            continue;
        }
        let object = heap.pages.object(obj);
        let found = object.gc_field();
        if found != GcField::Stamp(expected) {
            return Err(MarkingError {
                object: obj,
                found,
                expected,
            });
        }
        object.walk_objects(|slot| push_referent(slot, heap, &mut stack));
    }
    Ok(seen.len())
}

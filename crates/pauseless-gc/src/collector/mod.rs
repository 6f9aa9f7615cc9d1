//! The concurrent collector.
//!
//! - [`context`]: the shared state every collector thread and mutator
//!   coordinates through.
//! - [`thread`]: the per-thread phase machine.

mod context;
mod thread;

use std::sync::Arc;
use std::thread::JoinHandle;

pub(crate) use context::CollectorContext;

use crate::error::HeapError;
use crate::heap::HeapInner;
use thread::CollectorThread;

/// Starts the heap's collector threads.
///
/// # Errors
///
/// Returns [`HeapError::ThreadSpawn`] if the OS refuses a thread; any
/// threads already started are shut down and joined first.
pub(crate) fn spawn(heap: &Arc<HeapInner>) -> Result<Vec<JoinHandle<()>>, HeapError> {
    let mut handles = Vec::with_capacity(heap.collector.gc_threads());
    for index in 0..heap.collector.gc_threads() {
        let thread = CollectorThread::new(index, Arc::clone(heap));
        let spawned = std::thread::Builder::new()
            .name(format!("gc-{index}"))
            .spawn(move || thread.run());
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                shutdown(heap, handles);
                return Err(HeapError::ThreadSpawn(err));
            }
        }
    }
    Ok(handles)
}

/// Stops the collector threads after any requested cycle and joins them.
pub(crate) fn shutdown(heap: &HeapInner, handles: Vec<JoinHandle<()>>) {
    heap.collector.shutdown();
    for handle in handles {
        if handle.join().is_err() {
            eprintln!("[GC] collector thread panicked");
        }
    }
}

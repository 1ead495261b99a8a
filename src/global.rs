//! Global heap instance. This module allows a process to own a single
//! collector and reach it from anywhere without threading a handle through.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::heap::{Config, Heap};

static mut HEAP: Option<Box<Heap>> = None;
static INIT: AtomicBool = AtomicBool::new(false);

/// Initialize the process-global heap. Must run before the first managed
/// operation.
///
/// # Panics
/// Panics if the global heap is already initialized.
pub fn global_initialize(config: Config) -> &'static Heap {
    if INIT
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        panic!("global heap is already initialized");
    }
    unsafe {
        HEAP = Some(Heap::new(config));
        heap()
    }
}

/// Get the global heap.
///
/// # Safety
///
/// Unsafe because it does not check that [`global_initialize`] has run.
pub unsafe fn heap() -> &'static Heap {
    match &HEAP {
        Some(heap) => heap,
        None => std::hint::unreachable_unchecked(),
    }
}

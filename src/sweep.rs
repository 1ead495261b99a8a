//! Sweep: free every allocation whose used bit survives `used & !mark`,
//! computed a bitmap word (or 128-bit pair) at a time. If the mark phase saw
//! fewer finalizer-flagged objects than are registered, exactly one pending
//! finalizer runs instead and nothing is freed: the object is implicitly
//! resurrected for this cycle and reclaimed normally on a later one.
//!
//! In threads builds sweep runs on a dedicated worker so mutators resume
//! while the previous cycle's garbage is still being released; the collector
//! hands the worker the allocator lock it already holds.

#[cfg(feature = "threads")]
use std::sync::atomic::Ordering;

#[cfg(feature = "threads")]
use parking_lot::{Condvar, Mutex};

use crate::allocator::FlatAllocator;
use crate::heap::Heap;
use crate::table::{unflagged, AllocTable, FINALIZER_BIT};

#[cfg(feature = "threads")]
pub(crate) struct Semaphore {
    count: Mutex<u32>,
    available: Condvar,
}

#[cfg(feature = "threads")]
impl Semaphore {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            available: Condvar::new(),
        }
    }

    pub fn release(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.available.notify_one();
    }

    pub fn acquire(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.available.wait(&mut count);
        }
        *count -= 1;
    }
}

#[cfg(feature = "threads")]
pub(crate) fn sweep_worker_main(heap: &Heap) {
    heap.sweep_worker_running.store(true, Ordering::SeqCst);
    loop {
        heap.sweep_command.acquire();
        if heap.sweep_worker_quit.load(Ordering::SeqCst) {
            break;
        }
        unsafe {
            heap.sweep();
        }
    }
    heap.sweep_worker_running.store(false, Ordering::SeqCst);
}

unsafe fn free_word(
    table: &mut AllocTable,
    alloc: &mut FlatAllocator,
    mut garbage: u64,
    bit_base: u32,
) {
    while garbage != 0 {
        let offset = garbage.trailing_zeros();
        table.free_slot(bit_base + offset, alloc);
        garbage ^= 1u64 << offset;
    }
}

impl Heap {
    /// Full sweep pass. The caller must hold the allocator lock; it is
    /// released on return, which is what lets a delegated sweep overlap
    /// resumed mutators.
    pub(crate) unsafe fn sweep(&self) {
        let table = self.table_mut();
        let alloc = self.alloc_mut();

        let pending = self.finalizers_marked() < self.finalizers_shared().num_finalizers();
        let live_before = table.num_allocs();
        if !pending || !self.run_one_finalizer(table) {
            let words = table.bitmap_words();
            #[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "sse4.2"))]
            {
                let used = table.used_bits();
                let mark = table.mark_bits();
                let mut w = 0;
                while w + 2 <= words {
                    let (lo, hi) = crate::simd::garbage_pair(used, mark, w * 8);
                    free_word(table, alloc, lo, (w * 64) as u32);
                    free_word(table, alloc, hi, (w * 64 + 64) as u32);
                    w += 2;
                }
                if w < words {
                    free_word(
                        table,
                        alloc,
                        table.used_word(w) & !table.mark_word(w),
                        (w * 64) as u32,
                    );
                }
            }
            #[cfg(not(all(feature = "simd", target_arch = "x86_64", target_feature = "sse4.2")))]
            {
                for w in 0..words {
                    free_word(
                        table,
                        alloc,
                        table.used_word(w) & !table.mark_word(w),
                        (w * 64) as u32,
                    );
                }
            }
        }

        // Compact the index if it is now oversized; rebuilding leaves a
        // fresh zeroed mark bitmap, otherwise clear the bitmap in place.
        // Either way the next collection starts with clean marks without
        // extra synchronization.
        if !table.shrink_if_oversized(alloc) {
            table.clear_marks();
        }

        logln_if!(
            self.config().verbose,
            "sweep: freed {} of {} allocations, table size {}",
            live_before - table.num_allocs(),
            live_before,
            table.mask() as usize + 1
        );

        self.unlock_allocator();
    }

    /// Find the first unreachable allocation still carrying the finalizer
    /// flag, clear the flag, and invoke its callback. The callback runs with
    /// the allocator lock held and must not allocate managed memory.
    unsafe fn run_one_finalizer(&self, table: &mut AllocTable) -> bool {
        let words = table.bitmap_words();
        for w in 0..words {
            let mut bits = table.used_word(w) & !table.mark_word(w);
            while bits != 0 {
                let offset = bits.trailing_zeros();
                let i = (w * 64) as u32 + offset;
                let slot = table.slot(i);
                if slot & FINALIZER_BIT != 0 {
                    table.set_slot(i, slot ^ FINALIZER_BIT);
                    let base = unflagged(slot);
                    if let Some(func) = self.finalizers_mut().take(base) {
                        func(base as *mut u8);
                    }
                    return true;
                }
                bits ^= 1u64 << offset;
            }
        }
        false
    }
}

//! Conservative mark engine. Ranges of word-aligned memory are scanned for
//! values that pass the pointer filter and hit the allocation index; every
//! fresh hit is marked and, unless the allocation is a leaf, queued for its
//! own scan. Traversal uses an explicit worklist per marker, never native
//! recursion; in threads builds the shared ring lets every rendezvoused
//! thread steal scanning work from the others.

#[cfg(feature = "threads")]
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::heap::Heap;
use crate::stack_bounds::approximate_stack_pointer;
#[cfg(not(all(feature = "simd", target_arch = "x86_64", target_feature = "sse4.2")))]
use crate::table::looks_like_ptr;
use crate::table::{FINALIZER_BIT, LEAF_BIT};
use crate::utils::align_up;

/// Bounded single-ring work queue. Producers grab a slot by advancing
/// `producer_head`, write it, then commit by advancing `consumer_head` once
/// their slot is the next uncommitted one, so consumers only ever observe
/// contiguous committed slots. Consumers race on `queue_tail`.
#[cfg(feature = "threads")]
pub(crate) struct MarkQueue {
    slots: Box<[AtomicUsize]>,
    mask: u32,
    producer_head: AtomicU32,
    consumer_head: AtomicU32,
    queue_tail: AtomicU32,
}

#[cfg(feature = "threads")]
impl MarkQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "mark queue capacity must be a power of two");
        let slots = (0..capacity).map(|_| AtomicUsize::new(0)).collect();
        Self {
            slots,
            mask: capacity as u32 - 1,
            producer_head: AtomicU32::new(0),
            consumer_head: AtomicU32::new(0),
            queue_tail: AtomicU32::new(0),
        }
    }

    /// Reset between collections; never called while markers are running.
    pub fn reset(&self) {
        self.producer_head.store(0, Ordering::SeqCst);
        self.consumer_head.store(0, Ordering::SeqCst);
        self.queue_tail.store(0, Ordering::SeqCst);
    }

    /// False when the ring is full; the caller falls back to its own
    /// worklist.
    pub fn push(&self, ptr: usize) -> bool {
        let mut head = self.producer_head.load(Ordering::SeqCst);
        loop {
            if head.wrapping_sub(self.queue_tail.load(Ordering::SeqCst)) >= self.mask {
                return false;
            }
            match self.producer_head.compare_exchange(
                head,
                head.wrapping_add(1),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
        self.slots[(head & self.mask) as usize].store(ptr, Ordering::SeqCst);
        while self
            .consumer_head
            .compare_exchange(
                head,
                head.wrapping_add(1),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            core::hint::spin_loop();
        }
        true
    }

    pub fn pop(&self) -> Option<usize> {
        let mut tail = self.queue_tail.load(Ordering::SeqCst);
        loop {
            if tail == self.consumer_head.load(Ordering::SeqCst) {
                return None;
            }
            let ptr = self.slots[(tail & self.mask) as usize].load(Ordering::SeqCst);
            match self.queue_tail.compare_exchange(
                tail,
                tail.wrapping_add(1),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some(ptr),
                Err(actual) => tail = actual,
            }
        }
    }
}

pub(crate) struct Marker<'a> {
    heap: &'a Heap,
    heap_base: usize,
    heap_extent: usize,
    worklist: Vec<usize>,
}

impl<'a> Marker<'a> {
    pub fn new(heap: &'a Heap) -> Self {
        let (heap_base, heap_extent) = heap.heap_bounds();
        Self {
            heap,
            heap_base,
            heap_extent,
            worklist: vec![],
        }
    }

    /// Scan `[start, end)` as an array of potential pointers.
    pub unsafe fn mark_range(&mut self, start: usize, end: usize) {
        debug_assert!(start & 7 == 0, "scan range must be word aligned");
        #[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "sse4.2"))]
        {
            let (base, extent) = (self.heap_base, self.heap_extent);
            crate::simd::scan_range(start, end, base, extent, &mut |value| unsafe {
                self.visit_candidate(value)
            });
        }
        #[cfg(not(all(feature = "simd", target_arch = "x86_64", target_feature = "sse4.2")))]
        {
            let mut p = start;
            while p + 8 <= end {
                self.visit(*(p as *const usize));
                p += 8;
            }
        }
    }

    #[cfg(not(all(feature = "simd", target_arch = "x86_64", target_feature = "sse4.2")))]
    #[inline]
    unsafe fn visit(&mut self, value: usize) {
        if !looks_like_ptr(value, self.heap_base, self.heap_extent) {
            return;
        }
        self.visit_candidate(value);
    }

    /// `value` already passed the pointer filter.
    #[inline]
    unsafe fn visit_candidate(&mut self, value: usize) {
        let table = self.heap.table_shared();
        if let Some(i) = table.find(value) {
            if table.try_set_mark(i) {
                let slot = table.slot(i);
                if slot & FINALIZER_BIT != 0 {
                    self.heap.note_finalizer_marked();
                }
                if slot & LEAF_BIT == 0 {
                    self.push(value);
                }
            }
        }
    }

    #[cfg(feature = "threads")]
    #[inline]
    fn push(&mut self, base: usize) {
        if !self.heap.mark_queue().push(base) {
            self.worklist.push(base);
        }
    }

    #[cfg(not(feature = "threads"))]
    #[inline]
    fn push(&mut self, base: usize) {
        self.worklist.push(base);
    }

    unsafe fn scan_allocation(&mut self, base: usize) {
        let bytes = self.heap.usable_size_unlocked(base);
        self.mark_range(base, base + bytes);
    }

    unsafe fn drain_local(&mut self) {
        while let Some(base) = self.worklist.pop() {
            self.scan_allocation(base);
        }
    }

    /// Drain this marker's worklist and the shared ring until both are
    /// empty. Another thread may still be producing; whoever is last drains
    /// the remainder before reaching the end-of-mark barrier.
    #[cfg(feature = "threads")]
    pub unsafe fn drain(&mut self) {
        loop {
            self.drain_local();
            match self.heap.mark_queue().pop() {
                Some(base) => self.scan_allocation(base),
                None => break,
            }
        }
    }

    #[cfg(not(feature = "threads"))]
    pub unsafe fn drain(&mut self) {
        self.drain_local();
    }

    /// Scan the caller's stack. In fenced builds only the frames pushed
    /// since the outermost fence entry can hold managed pointers; otherwise
    /// the whole thread stack is scanned.
    pub unsafe fn mark_current_thread_stack(&mut self) {
        let sp = align_up(approximate_stack_pointer() as usize, 8);
        #[cfg(any(feature = "threads", feature = "fenced"))]
        {
            if let Some(top) = crate::safepoint::fenced_stack_top() {
                self.mark_range(sp, top);
            }
        }
        #[cfg(not(any(feature = "threads", feature = "fenced")))]
        {
            let origin = crate::stack_bounds::StackBounds::current_thread_stack_bounds().origin;
            self.mark_range(sp, crate::utils::align_down(origin as usize, 8));
        }
    }
}

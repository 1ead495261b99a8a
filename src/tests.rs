use std::hint::black_box;
use std::ptr::{null_mut, write_bytes, write_volatile};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::heap::{Config, Heap};
use crate::table::unflagged;
use crate::weak;

fn test_heap() -> Box<Heap> {
    Heap::new(Config {
        reserve_size: 64 * 1024 * 1024,
        scan_static: false,
        ..Config::default()
    })
}

/// Overwrite the region of stack left behind by dead frames so stale copies
/// of managed pointers cannot act as false roots.
#[inline(never)]
fn clobber_stack() {
    let mut sink = [0u8; 8192];
    black_box(&mut sink);
}

#[test]
fn stack_slot_keeps_allocation_alive() {
    #[inline(never)]
    fn live_phase(heap: &Heap) {
        let mut p = heap.alloc(1024);
        assert!(!p.is_null());
        unsafe { write_bytes(p, 0, 1024) };
        let mut slot = [p];
        black_box(&mut slot);
        heap.collect();
        assert_eq!(heap.num_ptrs(), 1);
        unsafe {
            write_volatile(&mut slot[0], null_mut());
            write_volatile(&mut p, null_mut());
        }
        black_box(&mut slot);
    }
    let heap = test_heap();
    heap.enter(|| {
        live_phase(&heap);
        clobber_stack();
        heap.collect();
        assert_eq!(heap.num_ptrs(), 0);
    });
}

#[test]
fn reachability_is_transitive() {
    #[inline(never)]
    fn build_pair(heap: &Heap) -> *mut u8 {
        let a = heap.alloc(1024);
        unsafe {
            write_bytes(a, 0, 1024);
            let mut b = heap.alloc(1024);
            write_bytes(b, 0, 1024);
            *(a as *mut *mut u8) = b;
            write_volatile(&mut b, null_mut());
        }
        heap.make_root(a);
        a
    }
    let heap = test_heap();
    heap.enter(|| {
        let mut a = build_pair(&heap);
        clobber_stack();
        heap.collect();
        assert_eq!(heap.num_ptrs(), 2);

        heap.unmake_root(a);
        unsafe { write_volatile(&mut a, null_mut()) };
        clobber_stack();
        heap.collect();
        assert_eq!(heap.num_ptrs(), 0);
    });
}

#[test]
fn roots_pin_allocations() {
    #[inline(never)]
    fn live_phase(heap: &Heap) -> *mut u8 {
        let mut p = heap.alloc(4096);
        unsafe { write_bytes(p, 0, 4096) };
        heap.make_root(p);
        let root = p;
        unsafe { write_volatile(&mut p, null_mut()) };
        root
    }
    let heap = test_heap();
    heap.enter(|| {
        let mut root = live_phase(&heap);
        clobber_stack();
        heap.collect();
        assert_eq!(heap.num_ptrs(), 1);

        heap.unmake_root(root);
        unsafe { write_volatile(&mut root, null_mut()) };
        clobber_stack();
        heap.collect();
        assert_eq!(heap.num_ptrs(), 0);
    });
}

static FINALIZED: AtomicUsize = AtomicUsize::new(0);

fn count_finalization(_ptr: *mut u8) {
    FINALIZED.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn finalizer_runs_once_and_object_survives_one_cycle() {
    #[inline(never)]
    fn live_phase(heap: &Heap) {
        let mut p = heap.alloc(64);
        unsafe { write_bytes(p, 0, 64) };
        heap.register_finalizer(p, count_finalization);
        unsafe { write_volatile(&mut p, null_mut()) };
    }
    let heap = test_heap();
    heap.enter(|| {
        live_phase(&heap);
        clobber_stack();
        heap.collect();
        // num_ptrs waits out the delegated sweep, so the finalizer has run
        // by the time it returns; the object is implicitly resurrected for
        // this cycle.
        assert_eq!(heap.num_ptrs(), 1);
        assert_eq!(FINALIZED.load(Ordering::SeqCst), 1);

        clobber_stack();
        heap.collect();
        assert_eq!(heap.num_ptrs(), 0);
        assert_eq!(FINALIZED.load(Ordering::SeqCst), 1);
    });
}

#[test]
fn leaf_contents_are_not_scanned() {
    #[inline(never)]
    fn live_phase(heap: &Heap) {
        let leaf = heap.alloc_root(100);
        heap.make_leaf(leaf);
        unsafe {
            let mut inner = heap.alloc(100);
            write_bytes(inner, 0, 100);
            *(leaf as *mut *mut u8) = inner;
            write_volatile(&mut inner, null_mut());
        }
    }
    let heap = test_heap();
    heap.enter(|| {
        live_phase(&heap);
        clobber_stack();
        heap.collect();
        // The pointer stored inside the leaf did not keep its target alive.
        assert_eq!(heap.num_ptrs(), 1);
    });
}

#[test]
fn weak_pointers_do_not_pin() {
    #[inline(never)]
    fn live_phase(heap: &Heap) -> *mut u8 {
        let mut p = heap.alloc(1024);
        unsafe { write_bytes(p, 0, 1024) };
        let weak = heap.get_weak_ptr(p);
        assert_eq!(heap.acquire_strong_ptr(weak), p);
        unsafe { write_volatile(&mut p, null_mut()) };
        weak
    }
    let heap = test_heap();
    heap.enter(|| {
        let weak = live_phase(&heap);
        clobber_stack();
        heap.collect();
        assert_eq!(heap.num_ptrs(), 0);
        assert_eq!(heap.acquire_strong_ptr(weak), null_mut());
    });
}

#[test]
fn weak_encoding_round_trips() {
    let heap = test_heap();
    heap.enter(|| {
        let p = heap.alloc_root(64);
        let w = heap.get_weak_ptr(p);
        assert!(heap.is_weak_ptr(w));
        assert!(heap.is_strong_ptr(p));
        assert_eq!(heap.get_weak_ptr(w), w);
        assert_eq!(heap.acquire_strong_ptr(w), p);
        assert!(heap.weak_ptr_equals(w, heap.get_weak_ptr(p)));
        assert!(weak::is_weak_ptr(0));
        assert_eq!(heap.acquire_strong_ptr(null_mut()), null_mut());
    });
}

#[test]
fn dead_weak_pointers_compare_equal() {
    #[inline(never)]
    fn live_phase(heap: &Heap) -> (*mut u8, *mut u8) {
        let mut a = heap.alloc(64);
        let mut b = heap.alloc(64);
        unsafe {
            write_bytes(a, 0, 64);
            write_bytes(b, 0, 64);
        }
        let wa = heap.get_weak_ptr(a);
        let wb = heap.get_weak_ptr(b);
        assert!(!heap.weak_ptr_equals(wa, wb));
        unsafe {
            write_volatile(&mut a, null_mut());
            write_volatile(&mut b, null_mut());
        }
        (wa, wb)
    }
    let heap = test_heap();
    heap.enter(|| {
        let (wa, wb) = live_phase(&heap);
        clobber_stack();
        heap.collect();
        // Both targets died, so both acquire to null and compare equal.
        assert!(heap.weak_ptr_equals(wa, wb));
    });
}

#[test]
fn garbage_churn_collects_everything() {
    #[inline(never)]
    fn churn(heap: &Heap, count: usize) {
        for _ in 0..count {
            let mut p = heap.alloc(64);
            assert!(!p.is_null());
            unsafe {
                write_bytes(p, 0, 64);
                write_volatile(&mut p, null_mut());
            }
        }
    }
    let heap = test_heap();
    heap.enter(|| {
        churn(&heap, 1 << 12);
        clobber_stack();
        heap.collect();
        assert_eq!(heap.num_ptrs(), 0);
        // Again after the table shrank back.
        churn(&heap, 1 << 10);
        clobber_stack();
        heap.collect();
        assert_eq!(heap.num_ptrs(), 0);
    });
}

#[test]
fn ptr_base_resolves_interior_pointers() {
    let heap = test_heap();
    heap.enter(|| {
        let p = heap.alloc_root(1024);
        unsafe { write_bytes(p, 0, 1024) };
        let base = p as usize;
        for k in 0..=1024usize {
            assert_eq!(heap.ptr_base((base + k) as *const u8), p, "offset {}", k);
        }
        for k in 0..64usize {
            assert_eq!(
                heap.ptr_base((base + 1025 + k) as *const u8),
                null_mut(),
                "offset past end {}",
                k
            );
            assert_eq!(
                heap.ptr_base((base - 1 - k) as *const u8),
                null_mut(),
                "offset before start {}",
                k
            );
        }
    });
}

#[test]
fn free_and_foreign_pointers() {
    let heap = test_heap();
    heap.enter(|| {
        let p = heap.alloc(128);
        assert!(heap.is_ptr(p));
        assert!(!heap.is_ptr(unsafe { p.add(8) }));
        heap.free(p);
        assert!(!heap.is_ptr(p));
        assert_eq!(heap.num_ptrs(), 0);

        // All silently ignored.
        heap.free(null_mut());
        heap.free(p);
        heap.free(24 as *mut u8);
        heap.make_leaf(0x1000 as *mut u8);
        heap.unmake_leaf(0x1000 as *mut u8);
        heap.register_finalizer(0x1000 as *mut u8, count_finalization);
        heap.unmake_root(0x1000 as *mut u8);
        assert_eq!(heap.num_ptrs(), 0);
    });
}

#[test]
fn free_of_finalizable_object_unregisters_it() {
    let heap = test_heap();
    heap.enter(|| {
        let p = heap.alloc(64);
        heap.register_finalizer(p, count_finalization);
        heap.free(p);
        // A later cycle must not hunt for a finalizer that is gone.
        let keep = heap.alloc_root(64);
        clobber_stack();
        heap.collect();
        assert_eq!(heap.num_ptrs(), 1);
        heap.free(keep);
    });
}

#[test]
fn root_registration_is_idempotent() {
    let heap = test_heap();
    heap.enter(|| {
        let mut p = heap.alloc(256);
        unsafe { write_bytes(p, 0, 256) };
        heap.make_root(p);
        heap.make_root(p);
        let mut root = p;
        unsafe { write_volatile(&mut p, null_mut()) };
        clobber_stack();
        heap.collect();
        assert_eq!(heap.num_ptrs(), 1);
        heap.unmake_root(root);
        unsafe { write_volatile(&mut root, null_mut()) };
        clobber_stack();
        heap.collect();
        assert_eq!(heap.num_ptrs(), 0);
    });
}

#[test]
fn repeated_collection_is_idempotent() {
    let heap = test_heap();
    heap.enter(|| {
        for _ in 0..32 {
            heap.alloc_root(512);
        }
        heap.collect();
        let after_first = heap.num_ptrs();
        heap.collect();
        assert_eq!(heap.num_ptrs(), after_first);
        assert_eq!(after_first, 32);
    });
}

#[test]
fn table_counts_match_used_bitmap() {
    let heap = test_heap();
    heap.enter(|| {
        let mut live = Vec::new();
        for i in 0..600 {
            let p = heap.alloc(32 + (i % 7) * 8);
            heap.make_root(p);
            live.push(p);
        }
        for p in live.iter().step_by(2) {
            heap.unmake_root(*p);
            heap.free(*p);
        }
        heap.lock_allocator();
        unsafe {
            let table = heap.table_shared();
            let mut popcount = 0;
            for w in 0..table.bitmap_words() {
                popcount += table.used_word(w).count_ones();
            }
            assert_eq!(table.num_allocs(), popcount);

            // Every used slot is reachable from its hash without crossing a
            // null slot.
            for i in 0..=table.mask() {
                let v = table.slot(i);
                if v <= crate::table::SENTINEL {
                    continue;
                }
                let mut j = ((unflagged(v) >> 3) as u32) & table.mask();
                loop {
                    assert_ne!(table.slot(j), 0, "probe chain broken for slot {}", i);
                    if j == i {
                        break;
                    }
                    j = (j + 1) & table.mask();
                }
            }
        }
        heap.unlock_allocator();

        for p in live.iter().skip(1).step_by(2) {
            assert!(heap.is_ptr(*p));
            heap.unmake_root(*p);
            heap.free(*p);
        }
        assert_eq!(heap.num_ptrs(), 0);
    });
}

#[test]
fn tombstones_keep_probe_chains_walkable() {
    let heap = test_heap();
    heap.enter(|| {
        // Build long probe chains, punch holes in them, then verify every
        // survivor is still found.
        let mut ptrs = Vec::new();
        for _ in 0..256 {
            ptrs.push(heap.alloc_root(16));
        }
        for chunk in ptrs.chunks(3) {
            if let Some(&victim) = chunk.first() {
                heap.unmake_root(victim);
                heap.free(victim);
            }
        }
        for chunk in ptrs.chunks(3) {
            for &p in &chunk[1..] {
                assert!(heap.is_ptr(p));
            }
        }
        for chunk in ptrs.chunks(3) {
            for &p in &chunk[1..] {
                heap.unmake_root(p);
                heap.free(p);
            }
        }
        assert_eq!(heap.num_ptrs(), 0);
    });
}

#[test]
fn deferred_collection_runs_at_next_fence_entry() {
    #[inline(never)]
    fn make_garbage(heap: &Heap) {
        let mut p = heap.alloc(64);
        unsafe {
            write_bytes(p, 0, 64);
            write_volatile(&mut p, null_mut());
        }
    }
    let heap = test_heap();
    heap.enter(|| {
        make_garbage(&heap);
        clobber_stack();
    });
    static HOOK_CALLS: AtomicUsize = AtomicUsize::new(0);
    heap.set_deferred_collect_hook(|| {
        HOOK_CALLS.fetch_add(1, Ordering::SeqCst);
    });
    heap.collect_when_stack_is_empty();
    assert_eq!(HOOK_CALLS.load(Ordering::SeqCst), 1);
    assert_eq!(heap.num_ptrs(), 1);
    heap.enter(|| {
        // The deferred cycle ran before this closure.
        assert_eq!(heap.num_ptrs(), 0);
    });
}

#[test]
fn wait_returns_not_equal_without_blocking() {
    let heap = test_heap();
    heap.enter(|| {
        let mut word32: u32 = 5;
        assert_eq!(heap.wait32(&mut word32, 4, 1_000_000), crate::WAIT_NOT_EQUAL);
        let mut word64: u64 = 5;
        assert_eq!(heap.wait64(&mut word64, 4, 1_000_000), crate::WAIT_NOT_EQUAL);
    });
}

#[cfg(feature = "threads")]
mod threaded {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32};

    #[test]
    fn wait_times_out() {
        let heap = test_heap();
        heap.enter(|| {
            let mut word: u32 = 0;
            let ret = heap.wait32(&mut word, 0, 20_000_000);
            assert_eq!(ret, crate::WAIT_TIMED_OUT);
        });
    }

    #[test]
    fn collection_scans_orphaned_stacks() {
        let heap = test_heap();
        let sleeping = AtomicBool::new(false);
        let stop = AtomicBool::new(false);
        crossbeam_utils::thread::scope(|scope| {
            let heap = &heap;
            let sleeping = &sleeping;
            let stop = &stop;
            scope.spawn(move |_| {
                heap.enter(|| {
                    let p = heap.alloc(1024);
                    unsafe { write_bytes(p, 0, 1024) };
                    let slot = [p];
                    black_box(&slot);
                    while !stop.load(Ordering::SeqCst) {
                        sleeping.store(true, Ordering::SeqCst);
                        // Long enough to orphan the stack.
                        heap.sleep(2_000_000);
                        assert!(heap.is_ptr(slot[0]));
                    }
                });
            });
            while !sleeping.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
            for _ in 0..10 {
                heap.collect();
                assert!(heap.num_ptrs() >= 1);
            }
            stop.store(true, Ordering::SeqCst);
        })
        .unwrap();
    }

    #[test]
    fn concurrent_mutators_survive_collection() {
        const WORKERS: usize = 4;
        const ROUNDS: usize = 200;
        let heap = test_heap();
        let running = AtomicU32::new(WORKERS as u32);
        crossbeam_utils::thread::scope(|scope| {
            let heap = &heap;
            let running = &running;
            for worker in 0..WORKERS {
                scope.spawn(move |_| {
                    heap.enter(|| {
                        for round in 0..ROUNDS {
                            let tag = (worker * ROUNDS + round) as u64;
                            let triple = unsafe {
                                let a = heap.alloc(24);
                                write_bytes(a, 0, 24);
                                let b = heap.alloc(24);
                                write_bytes(b, 0, 24);
                                let c = heap.alloc(24);
                                write_bytes(c, 0, 24);
                                *(a as *mut *mut u8) = b;
                                *(b as *mut *mut u8) = c;
                                *(c as *mut u64) = tag;
                                a
                            };
                            let slot = [triple];
                            black_box(&slot);
                            // Allocation is a safepoint, so a collection can
                            // land between any two of these; the triple must
                            // survive through the stack slot.
                            let probe = heap.alloc(24);
                            unsafe { write_bytes(probe, 0, 24) };
                            unsafe {
                                let b = *(slot[0] as *mut *mut u8);
                                let c = *(b as *mut *mut u8);
                                assert_eq!(*(c as *mut u64), tag);
                            }
                        }
                    });
                    running.fetch_sub(1, Ordering::SeqCst);
                });
            }
            while running.load(Ordering::SeqCst) != 0 {
                heap.collect();
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        })
        .unwrap();
        heap.enter(|| {
            clobber_stack();
            heap.collect();
            heap.collect();
            assert_eq!(heap.num_ptrs(), 0);
        });
    }
}

mod allocator_unit {
    use crate::allocator::FlatAllocator;

    #[test]
    fn blocks_are_aligned_and_sized() {
        let mut alloc = FlatAllocator::new(4 * 1024 * 1024, 1024 * 1024);
        unsafe {
            let a = alloc.allocate(100);
            assert_eq!(a as usize & 7, 0);
            assert!(alloc.usable_size(a as usize) >= 100);
            let b = alloc.allocate(1);
            assert_eq!(alloc.usable_size(b as usize), 8);
            alloc.free(a);
            // Same size class reuses the freed block.
            let c = alloc.allocate(100);
            assert_eq!(c, a);
        }
    }

    #[test]
    fn realloc_zeroed_zeroes() {
        let mut alloc = FlatAllocator::new(4 * 1024 * 1024, 1024 * 1024);
        unsafe {
            let p = alloc.allocate(64);
            std::ptr::write_bytes(p, 0xAB, 64);
            let q = alloc.realloc_zeroed(p, 128);
            for i in 0..128 {
                assert_eq!(*q.add(i), 0);
            }
        }
    }

    #[test]
    fn large_blocks_split() {
        let mut alloc = FlatAllocator::new(4 * 1024 * 1024, 1024 * 1024);
        unsafe {
            let big = alloc.allocate(4096);
            alloc.free(big);
            let small = alloc.allocate(1024);
            assert_eq!(small, big);
            assert_eq!(alloc.usable_size(small as usize), 1024);
            // The split remainder is reusable.
            let rest = alloc.allocate(2048);
            assert!(alloc.usable_size(rest as usize) >= 2048);
        }
    }
}

#[cfg(feature = "threads")]
mod queue_unit {
    use crate::marking::MarkQueue;

    #[test]
    fn ring_preserves_values_and_reports_full() {
        let queue = MarkQueue::new(8);
        for i in 0..7 {
            assert!(queue.push(0x1000 + i * 8));
        }
        // Capacity minus one usable slots.
        assert!(!queue.push(0xdead));
        for i in 0..7 {
            assert_eq!(queue.pop(), Some(0x1000 + i * 8));
        }
        assert_eq!(queue.pop(), None);
        queue.reset();
        assert!(queue.push(0x2000));
        assert_eq!(queue.pop(), Some(0x2000));
    }
}

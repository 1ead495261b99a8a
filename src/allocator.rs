//! Byte allocator for the heap image. Blocks carry a single word header
//! holding the payload size and a free bit; freed blocks are threaded through
//! size-class free lists the way free entries reuse block storage in
//! segregated spaces. Payloads are always 8-byte aligned, so the low three
//! bits of any managed pointer are available to the allocation index.

use std::{
    mem::size_of,
    ptr::null_mut,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::mmap::Mmap;
use crate::utils::align_up;

pub const MIN_ALLOCATION: usize = 8;
const HEADER_SIZE: usize = size_of::<usize>();
const FREE_BIT: usize = 1;
const SIZE_MASK: usize = !7;
const COMMIT_CHUNK: usize = 256 * 1024;

/// Size classes: one exact bin per 8 bytes up to 504, everything larger in
/// the last bin (first-fit with splitting).
const NUM_BINS: usize = 64;
const LARGE_BIN: usize = NUM_BINS - 1;

#[repr(C)]
struct FreeEntry {
    next: *mut FreeEntry,
}

pub struct FlatAllocator {
    region: Mmap,
    /// Carve watermark: address of the next unissued block header.
    cursor: usize,
    /// Committed high watermark. Read lock-free by the pointer-validity
    /// predicate, advanced only under the allocator lock.
    committed: AtomicUsize,
    bins: [*mut FreeEntry; NUM_BINS],
}

impl FlatAllocator {
    pub fn new(reserve: usize, initial_commit: usize) -> Self {
        let reserve = align_up(reserve.max(COMMIT_CHUNK), COMMIT_CHUNK);
        let region = Mmap::new(reserve);
        let initial = align_up(initial_commit.max(COMMIT_CHUNK), COMMIT_CHUNK).min(reserve);
        region.commit(region.start(), initial);
        let base = region.start() as usize;
        Self {
            cursor: base,
            committed: AtomicUsize::new(base + initial),
            region,
            bins: [null_mut(); NUM_BINS],
        }
    }

    /// Low watermark of the heap image.
    #[inline(always)]
    pub fn heap_base(&self) -> usize {
        self.region.start() as usize
    }

    /// Committed high watermark. Together with `heap_base` this bounds every
    /// address the collector will ever treat as a pointer candidate.
    #[inline(always)]
    pub fn heap_extent(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    #[inline]
    fn bin_index(size: usize) -> usize {
        let bin = size / MIN_ALLOCATION - 1;
        if bin < LARGE_BIN {
            bin
        } else {
            LARGE_BIN
        }
    }

    #[inline(always)]
    unsafe fn header(payload: usize) -> *mut usize {
        (payload - HEADER_SIZE) as *mut usize
    }

    /// Byte size of the block backing `payload`. Reads only the header word,
    /// so concurrent markers may call this while the collector holds the
    /// allocator lock and no frees are in flight.
    #[inline(always)]
    pub unsafe fn usable_size(&self, payload: usize) -> usize {
        *Self::header(payload) & SIZE_MASK
    }

    pub unsafe fn allocate(&mut self, bytes: usize) -> *mut u8 {
        let size = align_up(bytes.max(MIN_ALLOCATION), MIN_ALLOCATION);
        let bin = Self::bin_index(size);
        if bin < LARGE_BIN {
            let head = self.bins[bin];
            if !head.is_null() {
                self.bins[bin] = (*head).next;
                let payload = head as usize;
                *Self::header(payload) &= !FREE_BIT;
                return payload as *mut u8;
            }
        } else if let Some(payload) = self.take_large(size) {
            return payload as *mut u8;
        }
        self.carve(size)
    }

    pub unsafe fn allocate_zeroed(&mut self, bytes: usize) -> *mut u8 {
        let payload = self.allocate(bytes);
        if !payload.is_null() {
            std::ptr::write_bytes(payload, 0, self.usable_size(payload as usize));
        }
        payload
    }

    /// `free + allocate_zeroed`, the contract the mark bitmap needs: old
    /// contents are discarded, the new block reads as zero.
    pub unsafe fn realloc_zeroed(&mut self, payload: *mut u8, bytes: usize) -> *mut u8 {
        if !payload.is_null() {
            self.free(payload);
        }
        self.allocate_zeroed(bytes)
    }

    pub unsafe fn free(&mut self, payload: *mut u8) {
        let header = Self::header(payload as usize);
        let word = *header;
        assert_eq!(word & FREE_BIT, 0, "double free of heap block {:p}", payload);
        let size = word & SIZE_MASK;
        *header = size | FREE_BIT;
        self.push_free(payload as usize, size);
    }

    #[inline]
    unsafe fn push_free(&mut self, payload: usize, size: usize) {
        let entry = payload as *mut FreeEntry;
        let bin = Self::bin_index(size);
        (*entry).next = self.bins[bin];
        self.bins[bin] = entry;
    }

    /// First-fit scan of the large bin; oversized blocks are split and the
    /// remainder goes back to its own bin.
    unsafe fn take_large(&mut self, size: usize) -> Option<usize> {
        let mut link: *mut *mut FreeEntry = &mut self.bins[LARGE_BIN];
        while !(*link).is_null() {
            let entry = *link;
            let payload = entry as usize;
            let block_size = *Self::header(payload) & SIZE_MASK;
            if block_size >= size {
                *link = (*entry).next;
                let spare = block_size - size;
                if spare >= HEADER_SIZE + MIN_ALLOCATION {
                    let rest = spare - HEADER_SIZE;
                    let rest_payload = payload + size + HEADER_SIZE;
                    *Self::header(rest_payload) = rest | FREE_BIT;
                    self.push_free(rest_payload, rest);
                    *Self::header(payload) = size;
                } else {
                    *Self::header(payload) = block_size;
                }
                return Some(payload);
            }
            link = &mut (*entry).next;
        }
        None
    }

    unsafe fn carve(&mut self, size: usize) -> *mut u8 {
        let header = self.cursor;
        let new_cursor = header + HEADER_SIZE + size;
        if new_cursor > self.region.end() as usize {
            return null_mut();
        }
        self.ensure_committed(new_cursor);
        self.cursor = new_cursor;
        let payload = header + HEADER_SIZE;
        *Self::header(payload) = size;
        payload as *mut u8
    }

    fn ensure_committed(&self, addr: usize) {
        let committed = self.committed.load(Ordering::Relaxed);
        if addr <= committed {
            return;
        }
        let target = align_up(addr, COMMIT_CHUNK).min(self.region.end() as usize);
        self.region
            .commit(committed as *mut u8, target - committed);
        self.committed.store(target, Ordering::Release);
    }
}

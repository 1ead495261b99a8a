//! Finalizer registry: an open-addressed map from allocation base to the
//! callback registered for it. Entries whose finalizer has already run are
//! tombstoned in place so probe chains stay continuous.

use std::ptr::null_mut;

use crate::allocator::FlatAllocator;

pub type Finalizer = fn(*mut u8);

const TOMBSTONE: usize = 1;

#[derive(Clone, Copy)]
struct Entry {
    ptr: usize,
    func: Option<Finalizer>,
}

pub struct FinalizerTable {
    entries: *mut Entry,
    mask: u32,
    /// Live registrations (finalizers that have not yet run).
    num_finalizers: u32,
    /// Occupied slots including tombstones.
    num_entries: u32,
}

impl FinalizerTable {
    pub const fn new() -> Self {
        Self {
            entries: null_mut(),
            mask: 0,
            num_finalizers: 0,
            num_entries: 0,
        }
    }

    #[inline(always)]
    fn hash(&self, ptr: usize) -> u32 {
        ((ptr >> 3) as u32) & self.mask
    }

    #[inline(always)]
    pub fn num_finalizers(&self) -> u32 {
        self.num_finalizers
    }

    pub unsafe fn find(&self, ptr: usize) -> Option<u32> {
        if self.entries.is_null() {
            return None;
        }
        let mut i = self.hash(ptr);
        loop {
            let e = *self.entries.add(i as usize);
            if e.ptr == 0 {
                return None;
            }
            if e.ptr == ptr {
                return Some(i);
            }
            i = (i + 1) & self.mask;
        }
    }

    /// Register `func` for `ptr`. Re-registration updates the callback in
    /// place and does not change the live count.
    pub unsafe fn register(&mut self, ptr: usize, func: Finalizer, alloc: &mut FlatAllocator) {
        if self.entries.is_null() || 2 * self.num_entries >= self.mask {
            self.grow(alloc);
        }
        let mut i = self.hash(ptr);
        let mut reuse = None;
        loop {
            let e = *self.entries.add(i as usize);
            if e.ptr == 0 {
                break;
            }
            if e.ptr == ptr {
                (*self.entries.add(i as usize)).func = Some(func);
                return;
            }
            if e.ptr == TOMBSTONE && reuse.is_none() {
                reuse = Some(i);
            }
            i = (i + 1) & self.mask;
        }
        let slot = match reuse {
            Some(j) => j,
            None => {
                self.num_entries += 1;
                i
            }
        };
        *self.entries.add(slot as usize) = Entry {
            ptr,
            func: Some(func),
        };
        self.num_finalizers += 1;
    }

    /// Consume the registration for `ptr`: tombstone the entry, drop it from
    /// the live count, and hand back the callback.
    pub unsafe fn take(&mut self, ptr: usize) -> Option<Finalizer> {
        let i = self.find(ptr)?;
        let e = &mut *self.entries.add(i as usize);
        let func = e.func.take();
        e.ptr = TOMBSTONE;
        self.num_finalizers -= 1;
        func
    }

    unsafe fn grow(&mut self, alloc: &mut FlatAllocator) {
        let old_mask = self.mask;
        let old_entries = self.entries;
        self.mask = (self.mask << 1) | 127;
        self.entries =
            alloc.allocate_zeroed((self.mask as usize + 1) * std::mem::size_of::<Entry>())
                as *mut Entry;
        assert!(
            !self.entries.is_null(),
            "out of memory growing the finalizer registry"
        );
        self.num_entries = 0;
        if !old_entries.is_null() {
            for i in 0..=old_mask as usize {
                let e = *old_entries.add(i);
                if e.ptr > TOMBSTONE {
                    self.rehash(e);
                }
            }
            alloc.free(old_entries as *mut u8);
        }
    }

    unsafe fn rehash(&mut self, entry: Entry) {
        let mut i = self.hash(entry.ptr);
        while (*self.entries.add(i as usize)).ptr != 0 {
            i = (i + 1) & self.mask;
        }
        *self.entries.add(i as usize) = entry;
        self.num_entries += 1;
    }
}

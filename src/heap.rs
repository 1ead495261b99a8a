//! The heap object: one per-process (or per-test) instance owning the flat
//! memory image, the allocation index, roots, finalizers, the mark queue and
//! the sweep worker, with the public managed-memory API as its methods.

use std::cell::UnsafeCell;
use std::ptr::null_mut;
#[cfg(feature = "threads")]
use std::sync::atomic::AtomicI32;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Instant;

#[cfg(feature = "threads")]
use atomic::Atomic;
use parking_lot::lock_api::RawMutex as _;
use parking_lot::Mutex;
use parking_lot::RawMutex as Lock;

use crate::allocator::FlatAllocator;
use crate::finalizers::{Finalizer, FinalizerTable};
use crate::marking::Marker;
#[cfg(feature = "threads")]
use crate::marking::MarkQueue;
use crate::roots::RootSet;
#[cfg(feature = "threads")]
use crate::safepoint::CollectorPhase;
use crate::stack_bounds::static_data_bounds;
#[cfg(feature = "threads")]
use crate::sweep::Semaphore;
use crate::table::{looks_like_ptr, unflagged, AllocTable, FINALIZER_BIT, LEAF_BIT, SENTINEL};
use crate::weak;

pub struct Config {
    /// Virtual reservation for the heap image.
    pub reserve_size: usize,
    /// Pages committed up front.
    pub initial_commit: usize,
    /// Capacity of the shared mark queue; must be a power of two.
    pub mark_queue_capacity: usize,
    /// Scan the static data segment during collection. Off when the target
    /// cannot name its data segment or the embedder registers globals as
    /// roots itself.
    pub scan_static: bool,
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reserve_size: 512 * 1024 * 1024,
            initial_commit: 1024 * 1024,
            mark_queue_capacity: 1024,
            scan_static: cfg!(not(feature = "skip-static-marking"))
                && static_data_bounds().is_some(),
            verbose: false,
        }
    }
}

pub struct Heap {
    config: Config,
    alloc: UnsafeCell<FlatAllocator>,
    table: UnsafeCell<AllocTable>,
    roots: UnsafeCell<RootSet>,
    finalizers: UnsafeCell<FinalizerTable>,
    /// Guards the byte allocator, the index and both secondary tables. Held
    /// across the whole mark phase and handed, still locked, to the sweep
    /// worker.
    alloc_lock: Lock,
    /// Serializes collectors; a losing thread participates instead.
    collector_gate: Mutex<()>,
    num_finalizers_marked: AtomicU32,
    collect_deferred: AtomicBool,
    deferred_hook: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,

    #[cfg(feature = "threads")]
    pub(crate) phase: Atomic<CollectorPhase>,
    #[cfg(feature = "threads")]
    pub(crate) threads_in_fence: AtomicI32,
    #[cfg(feature = "threads")]
    pub(crate) ready_to_mark: AtomicI32,
    #[cfg(feature = "threads")]
    pub(crate) finished_marking: AtomicI32,
    #[cfg(feature = "threads")]
    pub(crate) resumed: AtomicI32,
    #[cfg(feature = "threads")]
    mark_queue: MarkQueue,
    #[cfg(feature = "threads")]
    pub(crate) orphans: Mutex<Vec<crate::blocking::OrphanRange>>,
    #[cfg(feature = "threads")]
    pub(crate) sweep_command: Semaphore,
    #[cfg(feature = "threads")]
    pub(crate) sweep_worker_running: AtomicBool,
    #[cfg(feature = "threads")]
    pub(crate) sweep_worker_quit: AtomicBool,
    #[cfg(feature = "threads")]
    sweep_worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

impl Heap {
    pub fn new(config: Config) -> Box<Self> {
        let mut alloc = FlatAllocator::new(config.reserve_size, config.initial_commit);
        let mut table = AllocTable::new();
        unsafe {
            table.grow_if_needed(&mut alloc);
        }
        #[cfg(feature = "threads")]
        let mark_queue = MarkQueue::new(config.mark_queue_capacity);

        let heap = Box::new(Self {
            config,
            alloc: UnsafeCell::new(alloc),
            table: UnsafeCell::new(table),
            roots: UnsafeCell::new(RootSet::new()),
            finalizers: UnsafeCell::new(FinalizerTable::new()),
            alloc_lock: Lock::INIT,
            collector_gate: Mutex::new(()),
            num_finalizers_marked: AtomicU32::new(0),
            collect_deferred: AtomicBool::new(false),
            deferred_hook: Mutex::new(None),
            #[cfg(feature = "threads")]
            phase: Atomic::new(CollectorPhase::Idle),
            #[cfg(feature = "threads")]
            threads_in_fence: AtomicI32::new(0),
            #[cfg(feature = "threads")]
            ready_to_mark: AtomicI32::new(0),
            #[cfg(feature = "threads")]
            finished_marking: AtomicI32::new(0),
            #[cfg(feature = "threads")]
            resumed: AtomicI32::new(0),
            #[cfg(feature = "threads")]
            mark_queue,
            #[cfg(feature = "threads")]
            orphans: Mutex::new(Vec::new()),
            #[cfg(feature = "threads")]
            sweep_command: Semaphore::new(),
            #[cfg(feature = "threads")]
            sweep_worker_running: AtomicBool::new(false),
            #[cfg(feature = "threads")]
            sweep_worker_quit: AtomicBool::new(false),
            #[cfg(feature = "threads")]
            sweep_worker: Mutex::new(None),
        });

        #[cfg(feature = "threads")]
        {
            let raw = &*heap as *const Heap as usize;
            let handle = std::thread::Builder::new()
                .name("cinder-sweep".into())
                .spawn(move || {
                    let heap = unsafe { &*(raw as *const Heap) };
                    crate::sweep::sweep_worker_main(heap);
                })
                .expect("failed to spawn the sweep worker");
            *heap.sweep_worker.lock() = Some(handle);
        }

        heap
    }

    // Interior access. Mutable views require the allocator lock; shared
    // views are only read during marking, when mutation is excluded.

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn table_mut(&self) -> &mut AllocTable {
        &mut *self.table.get()
    }
    pub(crate) unsafe fn table_shared(&self) -> &AllocTable {
        &*self.table.get()
    }
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn alloc_mut(&self) -> &mut FlatAllocator {
        &mut *self.alloc.get()
    }
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn roots_mut(&self) -> &mut RootSet {
        &mut *self.roots.get()
    }
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn finalizers_mut(&self) -> &mut FinalizerTable {
        &mut *self.finalizers.get()
    }
    pub(crate) unsafe fn finalizers_shared(&self) -> &FinalizerTable {
        &*self.finalizers.get()
    }
    #[cfg(feature = "threads")]
    pub(crate) fn mark_queue(&self) -> &MarkQueue {
        &self.mark_queue
    }

    pub(crate) fn heap_bounds(&self) -> (usize, usize) {
        let alloc = unsafe { &*self.alloc.get() };
        (alloc.heap_base(), alloc.heap_extent())
    }

    pub(crate) unsafe fn usable_size_unlocked(&self, base: usize) -> usize {
        (*self.alloc.get()).usable_size(base)
    }

    pub(crate) fn lock_allocator(&self) {
        self.alloc_lock.lock();
    }
    pub(crate) fn unlock_allocator(&self) {
        unsafe { self.alloc_lock.unlock() }
    }

    /// Reach a safepoint, then take the allocator lock. Every managed
    /// operation that touches shared state funnels through this, which is
    /// what makes allocation a safepoint.
    fn safepoint_and_lock(&self) {
        self.participate();
        self.lock_allocator();
    }

    pub(crate) fn finalizers_marked(&self) -> u32 {
        self.num_finalizers_marked.load(Ordering::SeqCst)
    }
    pub(crate) fn note_finalizer_marked(&self) {
        self.num_finalizers_marked.fetch_add(1, Ordering::SeqCst);
    }
    pub(crate) fn take_deferred_collection(&self) -> bool {
        self.collect_deferred.swap(false, Ordering::SeqCst)
    }

    /// Bounds-filter a user-supplied pointer, then look it up. Foreign
    /// addresses miss here instead of aliasing table sentinels.
    unsafe fn lookup(&self, ptr: usize) -> Option<u32> {
        let (base, extent) = self.heap_bounds();
        if !looks_like_ptr(ptr, base, extent) {
            return None;
        }
        self.table_shared().find(ptr)
    }

    /// Allocate `bytes` of managed memory: 8-byte aligned, registered in the
    /// index, reclaimed by collection once unreachable. Null on OOM; the
    /// collector never retries on the caller's behalf.
    pub fn alloc(&self, bytes: usize) -> *mut u8 {
        self.assert_fenced_access();
        self.safepoint_and_lock();
        let ptr = unsafe {
            let table = self.table_mut();
            let alloc = self.alloc_mut();
            table.grow_if_needed(alloc);
            let ptr = alloc.allocate(bytes);
            if !ptr.is_null() {
                table.insert(ptr as usize);
            }
            ptr
        };
        self.unlock_allocator();
        ptr
    }

    pub fn alloc_root(&self, bytes: usize) -> *mut u8 {
        let ptr = self.alloc(bytes);
        self.make_root(ptr);
        ptr
    }

    pub fn alloc_leaf(&self, bytes: usize) -> *mut u8 {
        let ptr = self.alloc(bytes);
        self.make_leaf(ptr);
        ptr
    }

    /// Eagerly release a managed allocation. No-op on null or foreign
    /// pointers.
    pub fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        self.safepoint_and_lock();
        unsafe {
            if let Some(i) = self.lookup(ptr as usize) {
                let table = self.table_mut();
                if table.slot(i) & FINALIZER_BIT != 0 {
                    // Drop the registration too, or the pending-finalizer
                    // accounting would wedge every later sweep.
                    self.finalizers_mut().take(ptr as usize);
                }
                table.free_slot(i, self.alloc_mut());
                self.roots_mut().remove(ptr as usize);
            }
        }
        self.unlock_allocator();
    }

    /// Pin `ptr` irrespective of reachability until `unmake_root`.
    pub fn make_root(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        self.safepoint_and_lock();
        unsafe {
            let alloc = self.alloc_mut();
            self.roots_mut().insert(ptr as usize, alloc);
        }
        self.unlock_allocator();
    }

    pub fn unmake_root(&self, ptr: *mut u8) {
        self.safepoint_and_lock();
        unsafe {
            self.roots_mut().remove(ptr as usize);
        }
        self.unlock_allocator();
    }

    /// Mark `ptr` as opaque bytes: the collector will keep it alive but
    /// never scan its contents.
    pub fn make_leaf(&self, ptr: *mut u8) {
        self.safepoint_and_lock();
        unsafe {
            if let Some(i) = self.lookup(ptr as usize) {
                let table = self.table_mut();
                table.set_slot(i, table.slot(i) | LEAF_BIT);
            }
        }
        self.unlock_allocator();
    }

    pub fn unmake_leaf(&self, ptr: *mut u8) {
        self.safepoint_and_lock();
        unsafe {
            if let Some(i) = self.lookup(ptr as usize) {
                let table = self.table_mut();
                table.set_slot(i, table.slot(i) & !LEAF_BIT);
            }
        }
        self.unlock_allocator();
    }

    /// Attach `func` to run once `ptr` becomes unreachable. Re-registration
    /// replaces the callback; unknown pointers are ignored. At most one
    /// finalizer runs per collection cycle, and a finalized object survives
    /// the cycle that finalized it.
    pub fn register_finalizer(&self, ptr: *mut u8, func: Finalizer) {
        self.safepoint_and_lock();
        unsafe {
            if let Some(i) = self.lookup(ptr as usize) {
                let alloc = self.alloc_mut();
                self.finalizers_mut().register(ptr as usize, func, alloc);
                let table = self.table_mut();
                table.set_slot(i, table.slot(i) | FINALIZER_BIT);
            }
        }
        self.unlock_allocator();
    }

    /// Is `ptr` the base of a live managed allocation?
    pub fn is_ptr(&self, ptr: *const u8) -> bool {
        let (base, extent) = self.heap_bounds();
        if !looks_like_ptr(ptr as usize, base, extent) {
            return false;
        }
        self.safepoint_and_lock();
        let hit = unsafe { self.table_shared().find(ptr as usize).is_some() };
        self.unlock_allocator();
        hit
    }

    pub fn is_weak_ptr(&self, ptr: *const u8) -> bool {
        weak::is_weak_ptr(ptr as usize)
    }

    pub fn is_strong_ptr(&self, ptr: *const u8) -> bool {
        weak::is_strong_ptr(ptr as usize)
    }

    /// The weak alias of a strong pointer. Weak aliases do not keep the
    /// target alive and are invisible to the conservative scan.
    pub fn get_weak_ptr(&self, ptr: *mut u8) -> *mut u8 {
        weak::weak_of(ptr as usize) as *mut u8
    }

    /// Promote a weak alias back to its strong pointer, or null if the
    /// target has been collected.
    pub fn acquire_strong_ptr(&self, weak: *mut u8) -> *mut u8 {
        if weak::is_strong_ptr(weak as usize) {
            return weak;
        }
        let strong = weak::strong_candidate(weak as usize);
        self.safepoint_and_lock();
        let live = unsafe { self.lookup(strong).is_some() };
        self.unlock_allocator();
        if live {
            strong as *mut u8
        } else {
            null_mut()
        }
    }

    pub fn weak_ptr_equals(&self, a: *mut u8, b: *mut u8) -> bool {
        a == b || self.acquire_strong_ptr(a) == self.acquire_strong_ptr(b)
    }

    /// Map an address anywhere inside a managed allocation to its base, or
    /// null if `ptr` is not interior to any live allocation.
    pub fn ptr_base(&self, ptr: *const u8) -> *mut u8 {
        self.safepoint_and_lock();
        let base = unsafe {
            self.table_shared()
                .interior_base(ptr as usize, &*self.alloc.get())
        };
        self.unlock_allocator();
        base as *mut u8
    }

    /// Count of live managed allocations. Waits for any in-flight sweep, so
    /// the answer is stable at quiescent points.
    pub fn num_ptrs(&self) -> u32 {
        self.safepoint_and_lock();
        let n = unsafe { self.table_shared().num_allocs() };
        self.unlock_allocator();
        n
    }

    /// Log every live slot in the allocation index.
    pub fn dump(&self) {
        self.safepoint_and_lock();
        unsafe {
            let table = self.table_shared();
            for i in 0..=table.mask() {
                let v = table.slot(i);
                if v > SENTINEL {
                    eprintln!("table index {}: {:#x}", i, unflagged(v));
                }
            }
            eprintln!(
                "{} allocations total, {} used table entries, table size {}",
                table.num_allocs(),
                table.num_entries(),
                table.mask() as usize + 1
            );
        }
        self.unlock_allocator();
    }

    /// Run a full stop-the-world collection cycle. The caller must not hold
    /// managed pointers only in registers; values reachable from the stack,
    /// statics, or the root set survive.
    pub fn collect(&self) {
        if unsafe { (*self.table.get()).num_allocs() } == 0 {
            return;
        }
        let gate = match self.collector_gate.try_lock() {
            Some(gate) => gate,
            None => {
                // Another thread is collecting; help it instead.
                self.participate();
                return;
            }
        };
        // Ensure any sweep delegated by the previous cycle has finished;
        // release immediately so late allocations can still slip in before
        // the rendezvous.
        self.lock_allocator();
        self.unlock_allocator();

        let cycle_start = Instant::now();
        self.num_finalizers_marked.store(0, Ordering::SeqCst);

        #[cfg(feature = "threads")]
        {
            self.begin_collection();
            unsafe {
                let mut marker = Marker::new(self);
                self.mark_global_ranges(&mut marker);
                marker.mark_current_thread_stack();
                self.mark_orphaned_stacks(&mut marker);
                marker.drain();
            }
            self.marking_barrier();
            self.phase.store(CollectorPhase::Idle, Ordering::SeqCst);
            self.exit_fence();
            // Delegate the sweep (and the allocator lock we still hold) to
            // the sweep worker; inline when it has not come up yet.
            if self.sweep_worker_running.load(Ordering::SeqCst) {
                self.sweep_command.release();
            } else {
                unsafe {
                    self.sweep();
                }
            }
        }
        #[cfg(not(feature = "threads"))]
        {
            self.lock_allocator();
            unsafe {
                let mut marker = Marker::new(self);
                self.mark_global_ranges(&mut marker);
                marker.mark_current_thread_stack();
                marker.drain();
                self.sweep();
            }
        }

        logln_if!(
            self.config.verbose,
            "collect: marked in {:.3}ms, heap extent {}",
            cycle_start.elapsed().as_secs_f64() * 1000.0,
            crate::utils::formatted_size(self.heap_bounds().1 - self.heap_bounds().0)
        );
        drop(gate);
    }

    /// The statics segment and the root-set storage, scanned as plain
    /// conservative ranges.
    unsafe fn mark_global_ranges(&self, marker: &mut Marker) {
        if self.config.scan_static {
            if let Some((lo, hi)) = static_data_bounds() {
                marker.mark_range(lo, hi);
            }
        }
        let (roots_start, roots_end) = (*self.roots.get()).as_range();
        if roots_start != 0 {
            marker.mark_range(roots_start, roots_end);
        }
    }

    /// Request a collection at the next point the mutator stack is known
    /// empty of managed pointers: the embedder's scheduler hook if one is
    /// installed, otherwise the next outermost fence entry.
    pub fn collect_when_stack_is_empty(&self) {
        self.collect_deferred.store(true, Ordering::SeqCst);
        if let Some(hook) = &*self.deferred_hook.lock() {
            hook();
        }
    }

    /// Install the embedder's "schedule a turn" callback; the deferred
    /// collection still runs from `enter`.
    pub fn set_deferred_collect_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.deferred_hook.lock() = Some(Box::new(hook));
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        #[cfg(feature = "threads")]
        {
            self.sweep_worker_quit.store(true, Ordering::SeqCst);
            self.sweep_command.release();
            if let Some(handle) = self.sweep_worker.get_mut().take() {
                let _ = handle.join();
            }
        }
    }
}

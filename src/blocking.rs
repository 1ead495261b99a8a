//! Blocking without stalling collection. Before a long wait a fenced thread
//! donates its live stack range to the orphan list and steps out of the
//! rendezvous population; any thread that collects while the waiter sleeps
//! scans the donated range on its behalf. On wake the thread rejoins the
//! population, helps any in-progress collection, and withdraws its range.

use std::ptr::read_volatile;
use std::time::{Duration, Instant};

#[cfg(feature = "threads")]
use std::sync::atomic::Ordering;

use crate::heap::Heap;
#[cfg(feature = "threads")]
use crate::marking::Marker;
#[cfg(feature = "threads")]
use crate::safepoint::{fence_depth, fenced_stack_top, orphan_slot, set_orphan_slot, thread_key};
#[cfg(feature = "threads")]
use crate::stack_bounds::approximate_stack_pointer;
#[cfg(feature = "threads")]
use crate::utils::align_up;

/// Waits shorter than this spin; longer ones orphan the stack and block.
const ORPHAN_THRESHOLD_NANOS: i64 = 100_000;

pub const WAIT_OK: i32 = 0;
pub const WAIT_NOT_EQUAL: i32 = 1;
pub const WAIT_TIMED_OUT: i32 = 2;

#[cfg(feature = "threads")]
#[derive(Clone, Copy)]
pub(crate) struct OrphanRange {
    start: usize,
    end: usize,
    owner: usize,
}

impl Heap {
    /// Donate the caller's stack range and make this thread invisible to
    /// collection rendezvous until `return_to_fence`. At most one donated
    /// range per thread.
    #[cfg(feature = "threads")]
    pub fn temporarily_leave_fence(&self) {
        if fence_depth() == 0 {
            return;
        }
        debug_assert!(
            orphan_slot() == usize::MAX,
            "stack already orphaned by this thread"
        );
        let start = align_up(approximate_stack_pointer() as usize, 8);
        let end = fenced_stack_top().unwrap();
        {
            let mut orphans = self.orphans.lock();
            orphans.push(OrphanRange {
                start,
                end,
                owner: thread_key(),
            });
            set_orphan_slot(orphans.len() - 1);
        }
        // Join any collection already running, then step out of the
        // rendezvous population; a later collection scans the donated range
        // instead of waiting for this thread.
        self.participate();
        self.threads_in_fence.fetch_sub(1, Ordering::SeqCst);
    }

    #[cfg(not(feature = "threads"))]
    pub fn temporarily_leave_fence(&self) {}

    /// Rejoin the rendezvous population and withdraw the donated range.
    #[cfg(feature = "threads")]
    pub fn return_to_fence(&self) {
        if fence_depth() == 0 {
            return;
        }
        self.threads_in_fence.fetch_add(1, Ordering::SeqCst);
        self.participate();

        let mut orphans = self.orphans.lock();
        let key = thread_key();
        let hint = orphan_slot();
        let index = if hint < orphans.len() && orphans[hint].owner == key {
            hint
        } else {
            // Our entry was moved by another thread's swap-with-last.
            orphans
                .iter()
                .position(|r| r.owner == key)
                .expect("fence return without a matching leave")
        };
        orphans.swap_remove(index);
        set_orphan_slot(usize::MAX);
    }

    #[cfg(not(feature = "threads"))]
    pub fn return_to_fence(&self) {}

    #[cfg(feature = "threads")]
    pub(crate) unsafe fn mark_orphaned_stacks(&self, marker: &mut Marker) {
        let orphans = self.orphans.lock();
        for range in orphans.iter() {
            marker.mark_range(range.start, range.end);
        }
    }

    /// Sleep for `nanos` nanoseconds. Long sleeps orphan the caller's stack
    /// so a concurrent collection is never delayed by them.
    pub fn sleep(&self, nanos: i64) {
        if nanos > ORPHAN_THRESHOLD_NANOS {
            self.temporarily_leave_fence();
        }
        uninterrupted_sleep(nanos);
        if nanos > ORPHAN_THRESHOLD_NANOS {
            self.return_to_fence();
        }
    }

    /// Futex-style wait on a 32-bit word: 0 woken, 1 value differed on
    /// entry, 2 timed out. Negative `nanos` waits without a timeout.
    pub fn wait32(&self, addr: *mut u32, expected: u32, nanos: i64) -> i32 {
        if unsafe { read_volatile(addr) } != expected {
            return WAIT_NOT_EQUAL;
        }
        #[cfg(feature = "threads")]
        {
            if nanos > ORPHAN_THRESHOLD_NANOS || nanos < 0 {
                self.temporarily_leave_fence();
            }
            let ret = platform_wait32(addr, expected, nanos);
            if nanos > ORPHAN_THRESHOLD_NANOS || nanos < 0 {
                self.return_to_fence();
            }
            ret
        }
        #[cfg(not(feature = "threads"))]
        {
            WAIT_TIMED_OUT
        }
    }

    /// 64-bit variant of [`wait32`](Heap::wait32).
    pub fn wait64(&self, addr: *mut u64, expected: u64, nanos: i64) -> i32 {
        if unsafe { read_volatile(addr) } != expected {
            return WAIT_NOT_EQUAL;
        }
        #[cfg(feature = "threads")]
        {
            if nanos > ORPHAN_THRESHOLD_NANOS || nanos < 0 {
                self.temporarily_leave_fence();
            }
            let ret = poll_wait(|| unsafe { read_volatile(addr) } != expected, nanos);
            if nanos > ORPHAN_THRESHOLD_NANOS || nanos < 0 {
                self.return_to_fence();
            }
            ret
        }
        #[cfg(not(feature = "threads"))]
        {
            WAIT_TIMED_OUT
        }
    }
}

fn uninterrupted_sleep(nanos: i64) {
    if nanos <= 0 {
        return;
    }
    if nanos > ORPHAN_THRESHOLD_NANOS {
        std::thread::sleep(Duration::from_nanos(nanos as u64));
    } else {
        let end = Instant::now() + Duration::from_nanos(nanos as u64);
        while Instant::now() < end {
            core::hint::spin_loop();
        }
    }
}

#[cfg(all(feature = "threads", target_os = "linux"))]
fn platform_wait32(addr: *mut u32, expected: u32, nanos: i64) -> i32 {
    let timeout = libc::timespec {
        tv_sec: (nanos / 1_000_000_000) as libc::time_t,
        tv_nsec: (nanos % 1_000_000_000) as libc::c_long,
    };
    let timeout_ptr = if nanos < 0 {
        core::ptr::null::<libc::timespec>()
    } else {
        &timeout
    };
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr,
            libc::FUTEX_WAIT,
            expected,
            timeout_ptr,
        )
    };
    if rc == 0 {
        return WAIT_OK;
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::EAGAIN) => WAIT_NOT_EQUAL,
        Some(libc::ETIMEDOUT) => WAIT_TIMED_OUT,
        _ => WAIT_OK,
    }
}

#[cfg(all(feature = "threads", not(target_os = "linux")))]
fn platform_wait32(addr: *mut u32, expected: u32, nanos: i64) -> i32 {
    poll_wait(|| unsafe { read_volatile(addr) } != expected, nanos)
}

/// Deadline-polling fallback for targets (and word sizes) without a native
/// futex: the value changing counts as a wake.
#[cfg(feature = "threads")]
fn poll_wait(changed: impl Fn() -> bool, nanos: i64) -> i32 {
    let deadline = if nanos < 0 {
        None
    } else {
        Some(Instant::now() + Duration::from_nanos(nanos as u64))
    };
    loop {
        if changed() {
            return WAIT_OK;
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return WAIT_TIMED_OUT;
            }
        }
        std::thread::sleep(Duration::from_micros(100));
    }
}

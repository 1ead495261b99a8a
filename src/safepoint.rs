//! The managed-access fence. A thread must be inside the fence to read or
//! write managed pointers; the collector uses the fence population to bring
//! every such thread to a rendezvous, have each one scan its own stack, and
//! hold them all until marking is over.

#[cfg(any(feature = "threads", feature = "fenced"))]
use std::cell::Cell;
#[cfg(feature = "threads")]
use std::sync::atomic::Ordering;

#[cfg(feature = "threads")]
use crossbeam_utils::Backoff;

use crate::heap::Heap;
#[cfg(feature = "threads")]
use crate::marking::Marker;
#[cfg(any(feature = "threads", feature = "fenced"))]
use crate::stack_bounds::approximate_stack_pointer;

/// Collector phase broadcast to every fenced thread.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum CollectorPhase {
    Idle = 0,
    Marking = 1,
}

#[cfg(any(feature = "threads", feature = "fenced"))]
struct FenceTls {
    depth: Cell<u32>,
    /// Stack pointer captured at the outermost fence entry. Frames older
    /// than this cannot hold managed pointers.
    stack_top: Cell<usize>,
    /// Index of this thread's entry in the orphaned-stacks list.
    orphan_slot: Cell<usize>,
}

#[cfg(any(feature = "threads", feature = "fenced"))]
thread_local! {
    static FENCE: FenceTls = FenceTls {
        depth: Cell::new(0),
        stack_top: Cell::new(0),
        orphan_slot: Cell::new(usize::MAX),
    };
}

#[cfg(any(feature = "threads", feature = "fenced"))]
pub(crate) fn fence_depth() -> u32 {
    FENCE.with(|f| f.depth.get())
}

/// The captured stack top when the calling thread is fenced.
#[cfg(any(feature = "threads", feature = "fenced"))]
pub(crate) fn fenced_stack_top() -> Option<usize> {
    FENCE.with(|f| {
        if f.depth.get() > 0 {
            Some(f.stack_top.get())
        } else {
            None
        }
    })
}

#[cfg(feature = "threads")]
pub(crate) fn orphan_slot() -> usize {
    FENCE.with(|f| f.orphan_slot.get())
}

/// Stable per-thread key: the address of the thread's fence state.
#[cfg(feature = "threads")]
pub(crate) fn thread_key() -> usize {
    FENCE.with(|f| f as *const FenceTls as usize)
}

#[cfg(feature = "threads")]
pub(crate) fn set_orphan_slot(slot: usize) {
    FENCE.with(|f| f.orphan_slot.set(slot));
}

/// Runs `exit_fence` on every exit path, including unwinds out of mutator
/// callbacks.
pub(crate) struct FenceExit<'a>(pub(crate) &'a Heap);

impl Drop for FenceExit<'_> {
    fn drop(&mut self) {
        self.0.exit_fence();
    }
}

#[cfg(feature = "threads")]
#[inline]
fn spin_until(cond: impl Fn() -> bool) {
    let backoff = Backoff::new();
    while !cond() {
        if backoff.is_completed() {
            std::thread::sleep(std::time::Duration::from_micros(1));
        } else {
            backoff.snooze();
        }
    }
}

impl Heap {
    /// Run `mutator` inside the fence. This is the only way frames holding
    /// managed pointers become visible to the collector: the closure's frame
    /// sits below the captured stack top.
    pub fn enter<R>(&self, mutator: impl FnOnce() -> R) -> R {
        self.enter_fence();
        let _guard = FenceExit(self);
        if self.take_deferred_collection() {
            self.collect();
        }
        mutator()
    }

    pub(crate) fn enter_fence(&self) {
        #[cfg(any(feature = "threads", feature = "fenced"))]
        {
            FENCE.with(|f| {
                if f.depth.get() == 0 {
                    // Frames older than this entry cannot hold managed
                    // pointers, so the stack scan stops here.
                    f.stack_top.set(approximate_stack_pointer() as usize);
                    #[cfg(feature = "threads")]
                    self.threads_in_fence.fetch_add(1, Ordering::SeqCst);
                }
                f.depth.set(f.depth.get() + 1);
            });
        }
        // Help out any collection already running before touching managed
        // state.
        self.participate();
    }

    pub(crate) fn exit_fence(&self) {
        #[cfg(any(feature = "threads", feature = "fenced"))]
        {
            FENCE.with(|f| {
                let depth = f.depth.get();
                assert!(depth > 0, "fence exit without a matching entry");
                f.depth.set(depth - 1);
                if depth == 1 {
                    #[cfg(feature = "threads")]
                    self.threads_in_fence.fetch_sub(1, Ordering::SeqCst);
                }
            });
        }
    }

    #[cfg(any(feature = "threads", feature = "fenced"))]
    pub(crate) fn assert_fenced_access(&self) {
        debug_assert!(
            fence_depth() > 0,
            "managed state accessed from outside the fence"
        );
    }
    #[cfg(not(any(feature = "threads", feature = "fenced")))]
    pub(crate) fn assert_fenced_access(&self) {}

    /// Yield into an in-progress collection, if any: rendezvous, scan this
    /// thread's stack, then help drain the mark queue until marking ends.
    pub fn participate(&self) {
        #[cfg(feature = "threads")]
        {
            if self.phase.load(Ordering::SeqCst) == CollectorPhase::Marking && fence_depth() > 0 {
                self.ready_to_mark.fetch_add(1, Ordering::SeqCst);
                self.wait_for_all_participants();
                unsafe {
                    let mut marker = Marker::new(self);
                    marker.mark_current_thread_stack();
                    marker.drain();
                }
                self.marking_barrier();
            }
        }
    }

    /// Wait for every fenced thread to arrive at the collection.
    #[cfg(feature = "threads")]
    pub(crate) fn wait_for_all_participants(&self) {
        spin_until(|| {
            self.ready_to_mark.load(Ordering::SeqCst)
                >= self.threads_in_fence.load(Ordering::SeqCst)
        });
    }

    /// End-of-mark barrier: nobody resumes mutation until every participant
    /// has stopped finding work.
    #[cfg(feature = "threads")]
    pub(crate) fn marking_barrier(&self) {
        self.finished_marking.fetch_add(1, Ordering::SeqCst);
        spin_until(|| {
            self.phase.load(Ordering::SeqCst) != CollectorPhase::Marking
                || self.finished_marking.load(Ordering::SeqCst)
                    >= self.ready_to_mark.load(Ordering::SeqCst)
        });
        self.resumed.fetch_add(1, Ordering::SeqCst);
    }

    /// Broadcast a new collection and rendezvous with every fenced thread.
    /// Returns with the allocator lock held.
    #[cfg(feature = "threads")]
    pub(crate) fn begin_collection(&self) {
        // Stragglers from the previous cycle must leave their barrier before
        // the counters reset under them.
        spin_until(|| {
            self.resumed.load(Ordering::SeqCst) >= self.finished_marking.load(Ordering::SeqCst)
        });
        self.mark_queue().reset();
        self.enter_fence();
        self.resumed.store(0, Ordering::SeqCst);
        self.finished_marking.store(0, Ordering::SeqCst);
        // The collecting thread counts as the first participant.
        self.ready_to_mark.store(1, Ordering::SeqCst);
        self.phase.store(CollectorPhase::Marking, Ordering::SeqCst);
        self.wait_for_all_participants();
        self.lock_allocator();
    }
}

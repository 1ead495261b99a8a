//! A conservative, stop-the-world, mark & sweep garbage collector over a
//! flat heap image.
//!
//! The collector never moves objects. Live allocations are recorded in an
//! open-addressed pointer table; collection conservatively scans the static
//! data segment, every fenced thread's stack and the explicit root set,
//! marks what it reaches, and frees the rest. In `threads` builds every
//! rendezvoused thread helps with marking through a shared work queue, and a
//! dedicated worker runs the sweep while mutators resume.
//!
//! ```no_run
//! use cinder::{Config, Heap};
//!
//! let heap = Heap::new(Config::default());
//! heap.enter(|| {
//!     let p = heap.alloc_root(1024);
//!     assert!(heap.is_ptr(p));
//!     heap.collect();
//!     assert_eq!(heap.num_ptrs(), 1);
//!     heap.unmake_root(p);
//! });
//! ```

#[macro_use]
pub mod utils;

pub mod allocator;
pub mod blocking;
pub mod finalizers;
pub mod global;
pub mod heap;
pub mod marking;
pub mod mmap;
pub mod roots;
pub mod safepoint;
#[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "sse4.2"))]
pub mod simd;
pub mod stack_bounds;
pub mod sweep;
pub mod table;
pub mod weak;

pub use blocking::{WAIT_NOT_EQUAL, WAIT_OK, WAIT_TIMED_OUT};
pub use finalizers::Finalizer;
pub use heap::{Config, Heap};
pub use weak::{is_strong_ptr, is_weak_ptr};

#[cfg(test)]
mod tests;

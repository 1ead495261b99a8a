//! Thread stack and static-segment discovery for conservative scanning.

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    /// High end of the stack (stacks grow down).
    pub origin: *mut u8,
    pub bound: *mut u8,
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
impl StackBounds {
    pub unsafe fn new_thread_stack_bounds(thread: libc::pthread_t) -> Self {
        let origin = libc::pthread_get_stackaddr_np(thread);
        let size = libc::pthread_get_stacksize_np(thread);
        Self {
            origin: origin.cast(),
            bound: (origin as *mut u8).sub(size),
        }
    }
    pub fn current_thread_stack_bounds() -> Self {
        unsafe { Self::new_thread_stack_bounds(libc::pthread_self()) }
    }
}

#[cfg(all(unix, not(any(target_os = "macos", target_os = "ios"))))]
impl StackBounds {
    unsafe fn new_thread_stack_bounds(thread: libc::pthread_t) -> Self {
        let mut bound = core::ptr::null_mut::<libc::c_void>();
        let mut stack_size = 0;
        let mut sattr: libc::pthread_attr_t = core::mem::MaybeUninit::zeroed().assume_init();
        libc::pthread_attr_init(&mut sattr);
        #[cfg(any(target_os = "freebsd", target_os = "netbsd"))]
        {
            libc::pthread_attr_get_np(thread, &mut sattr);
        }
        #[cfg(not(any(target_os = "freebsd", target_os = "netbsd")))]
        {
            libc::pthread_getattr_np(thread, &mut sattr);
        }
        let _rc = libc::pthread_attr_getstack(&sattr, &mut bound, &mut stack_size);
        libc::pthread_attr_destroy(&mut sattr);
        Self {
            bound: bound.cast(),
            origin: bound.cast::<u8>().add(stack_size),
        }
    }

    pub fn current_thread_stack_bounds() -> Self {
        unsafe { Self::new_thread_stack_bounds(libc::pthread_self()) }
    }
}

#[cfg(windows)]
impl StackBounds {
    pub unsafe fn current_thread_stack_bounds_internal() -> Self {
        use winapi::um::memoryapi::*;
        use winapi::um::winnt::*;
        let mut stack_origin: MEMORY_BASIC_INFORMATION =
            core::mem::MaybeUninit::zeroed().assume_init();
        VirtualQuery(
            &mut stack_origin as *mut MEMORY_BASIC_INFORMATION as *mut _,
            &mut stack_origin,
            core::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        );
        let origin = stack_origin
            .BaseAddress
            .cast::<u8>()
            .add(stack_origin.RegionSize as _);
        // The reserved stack is three regions (uncommitted, guard page,
        // committed) sharing one AllocationBase; the usable bound sits just
        // above the guard page.
        let mut uncommitted_memory: MEMORY_BASIC_INFORMATION =
            core::mem::MaybeUninit::zeroed().assume_init();
        VirtualQuery(
            stack_origin.AllocationBase as *mut _,
            &mut uncommitted_memory,
            core::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        );
        let mut guard_page: MEMORY_BASIC_INFORMATION =
            core::mem::MaybeUninit::zeroed().assume_init();
        VirtualQuery(
            uncommitted_memory
                .BaseAddress
                .cast::<u8>()
                .add(uncommitted_memory.RegionSize as _)
                .cast(),
            &mut guard_page,
            core::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        );
        let end_of_stack = stack_origin.AllocationBase as *mut u8;
        let bound = end_of_stack.add(guard_page.RegionSize as _);
        Self {
            origin: origin as *mut u8,
            bound,
        }
    }

    pub fn current_thread_stack_bounds() -> Self {
        unsafe { Self::current_thread_stack_bounds_internal() }
    }
}

/// A stack address at (or just above) the caller's frame. Taking the address
/// of a local forces it into a stack slot.
#[inline(always)]
pub fn approximate_stack_pointer() -> *mut u8 {
    let mut result = core::ptr::null_mut();
    result = &mut result as *mut *mut u8 as *mut u8;
    result
}

/// Bounds of the process's initialized-data + bss segments, when the target
/// exposes them. Scanned as one conservative range unless the embedder opts
/// out of automatic static marking.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
pub fn static_data_bounds() -> Option<(usize, usize)> {
    extern "C" {
        static __data_start: u8;
        static _end: u8;
    }
    unsafe {
        let lo = &__data_start as *const u8 as usize;
        let hi = &_end as *const u8 as usize;
        Some((crate::utils::align_up(lo, 8), crate::utils::align_down(hi, 8)))
    }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
pub fn static_data_bounds() -> Option<(usize, usize)> {
    None
}

//! Small helpers shared across the crate.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr;

/// Allocate and initialize a `T` on the heap, returning `None` instead of
/// aborting the process when the allocator is exhausted.
///
/// `Box::new` cannot report allocation failure on stable Rust (the global
/// alloc-error handler aborts); spec.md's node/thread-state allocations must
/// surface `NOMEM` instead, so every heap allocation in this crate goes
/// through this helper, which talks to the allocator named in spec.md's
/// "external collaborators" directly via `std::alloc`.
pub fn try_alloc<T>(value: T) -> Option<*mut T> {
    let layout = Layout::new::<T>();
    unsafe {
        let raw = alloc(layout) as *mut T;
        if raw.is_null() {
            return None;
        }
        ptr::write(raw, value);
        Some(raw)
    }
}

/// Drop and free a `T` previously returned by [`try_alloc`].
///
/// # Safety
/// `ptr` must have been produced by [`try_alloc::<T>`] and not already freed.
pub unsafe fn free<T>(ptr: *mut T) {
    ptr::drop_in_place(ptr);
    dealloc(ptr as *mut u8, Layout::new::<T>());
}

/// Hint to the processor that we're in a busy-wait spin loop.
///
/// Ported from `rs_lockfree::util::pause`, which called the now-removed
/// `std::sync::atomic::spin_loop_hint` (itself a wrapper around a nightly
/// intrinsic); `std::hint::spin_loop` is the stable replacement.
#[inline]
pub fn pause() {
    std::hint::spin_loop();
}

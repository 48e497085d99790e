//! An optional `#[global_allocator]` binding over the process-wide
//! instance in [`crate::facade::global`].
//!
//! Grounded on the teacher's `KHeap` (`arch/arm64/memory/heap.rs`): both
//! route `alloc`/`dealloc` straight through the same cache/magazine/slab
//! machinery everything else in the crate uses rather than keeping a
//! separate arena, and both require an explicit init call before the
//! first allocation reaches them (there, `KHeap::init_for_this_cpu`;
//! here, [`crate::facade::global::init`]). Calling into this allocator
//! before that init runs returns a null pointer, which the Rust runtime
//! treats as allocation failure.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use std::ptr::NonNull;

use crate::facade::global;

/// `#[global_allocator]`-ready wrapper around the shared [`crate::facade::Kmem`]
/// instance. Does not own any state itself; every call reaches through to
/// `facade::global`.
pub struct KmemGlobalAllocator;

unsafe impl GlobalAlloc for KmemGlobalAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // `malloc` rounds up to a size class but makes no promise about
        // alignment beyond the class's `unit_size` (itself 8-byte
        // aligned); folding `layout.align()` into the request size
        // ensures the class picked is at least as large as what's asked.
        let size = layout.size().max(layout.align());
        global::malloc(size).map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            global::free(ptr);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, _layout: Layout, new_size: usize) -> *mut u8 {
        let Some(ptr) = NonNull::new(ptr) else {
            return ptr::null_mut();
        };
        global::realloc(ptr, new_size).map_or(ptr::null_mut(), NonNull::as_ptr)
    }
}

#[global_allocator]
static KMEM_GLOBAL_ALLOCATOR: KmemGlobalAllocator = KmemGlobalAllocator;

//! The raw byte source the page supplier sits on top of.
//!
//! This is the "Allocator interface (injected at bottom)" from the design:
//! a pair of calls with no alignment guarantee beyond whatever the host's
//! default allocator happens to give `Layout::from_size_align`-style
//! requests. [`PageSupplier`](crate::page::PageSupplier) is the thing that
//! turns that into page-aligned memory.

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Mutex;

/// A pluggable wholesale byte source. The host may supply the system
/// allocator, a bump allocator, or a test double that tracks every
/// allocation it hands out.
///
/// Implementations must be usable from multiple threads: the page supplier
/// may call `alloc`/`free` from any caller without external synchronization
/// beyond its own lock.
pub trait RawAllocator: Send + Sync {
    /// Allocate `size` bytes. Returns `None` on failure; never panics on
    /// OOM.
    fn alloc(&self, size: usize) -> Option<NonNull<u8>>;

    /// Free a block previously returned by `alloc` with the same `size`.
    ///
    /// # Safety
    /// `ptr` must have been returned by a prior `alloc(size)` call on this
    /// same allocator and not already freed.
    unsafe fn free(&self, ptr: NonNull<u8>, size: usize);
}

/// The host's default allocator (`std::alloc`), standing in for the
/// original's libc `malloc`/`free` pair.
///
/// Deliberately requests only pointer alignment, not page alignment, so
/// that [`PageSupplier`](crate::page::PageSupplier) exercises its
/// over-allocate-and-realign path the same way it would against a real
/// `malloc`.
#[derive(Debug, Default)]
pub struct SystemAllocator;

impl SystemAllocator {
    fn layout(size: usize) -> Layout {
        // SAFETY: align_of::<usize>() is always a valid power-of-two
        // alignment, and `size` is rounded up to a multiple of it below so
        // `Layout::from_size_align` can't fail.
        let align = core::mem::align_of::<usize>();
        let size = size.next_multiple_of(align).max(align);
        Layout::from_size_align(size, align).expect("layout computed from valid inputs")
    }
}

impl RawAllocator for SystemAllocator {
    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc::alloc(Self::layout(size)) };
        NonNull::new(ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        // SAFETY: caller guarantees `ptr`/`size` match a prior `alloc` call
        // on this allocator, so the layout recomputed here is identical to
        // the one used to allocate it.
        unsafe { alloc::dealloc(ptr.as_ptr(), Self::layout(size)) };
    }
}

/// A pooled raw allocator: freed blocks are kept on a per-size free list
/// and handed back out on the next matching request instead of going
/// through the system allocator again.
///
/// This is the "pooled page allocator" alternative `init`'s
/// `use_host_malloc` flag can select: since every request the page
/// supplier makes is for exactly one page size (or a small number of
/// multiples, for the large path), the free lists stay short-lived and
/// few in number.
pub struct PooledAllocator {
    inner: Mutex<HashMap<usize, Vec<NonNull<u8>>>>,
    backing: SystemAllocator,
}

impl Default for PooledAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PooledAllocator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            backing: SystemAllocator,
        }
    }
}

impl RawAllocator for PooledAllocator {
    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        if let Some(ptr) = self
            .inner
            .lock()
            .expect("pooled allocator lock poisoned")
            .get_mut(&size)
            .and_then(Vec::pop)
        {
            return Some(ptr);
        }
        self.backing.alloc(size)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        self.inner
            .lock()
            .expect("pooled allocator lock poisoned")
            .entry(size)
            .or_default()
            .push(ptr);
    }
}

// SAFETY: every pooled pointer is reused only through `alloc`, gated by
// the same mutex that guards the free lists, so handing one out from one
// thread and returning it from another is sound.
unsafe impl Send for PooledAllocator {}
unsafe impl Sync for PooledAllocator {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pooled_allocator_reuses_freed_blocks() {
        let a = PooledAllocator::new();
        let first = a.alloc(128).unwrap();
        let first_addr = first.as_ptr() as usize;
        unsafe { a.free(first, 128) };
        let second = a.alloc(128).unwrap();
        assert_eq!(second.as_ptr() as usize, first_addr, "the pooled allocator should hand back the same block");
        unsafe { a.free(second, 128) };
    }

    #[test]
    fn round_trips_a_few_sizes() {
        let a = SystemAllocator;
        for size in [1usize, 7, 64, 4096, 65536] {
            let ptr = a.alloc(size).expect("alloc should succeed");
            unsafe {
                ptr.as_ptr().write_bytes(0xAB, size);
                a.free(ptr, size);
            }
        }
    }

    #[test]
    fn zero_size_is_rejected() {
        let a = SystemAllocator;
        assert!(a.alloc(0).is_none());
    }
}

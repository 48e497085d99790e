//! The wholesale page source.
//!
//! Grounded on `examples/original_source/imembase.h`'s `IMEMGFP` ("mem_get
//! free_pages", a page supplier class): a page size, a refcount of caches
//! sharing it, two callables, and three counters. The callables here are a
//! [`RawAllocator`] rather than raw function pointers, since that's the
//! idiomatic Rust shape of the same contract.

use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::allocator::RawAllocator;
use crate::error::{Error, Result};

pub const DEFAULT_PAGE_SHIFT: u32 = 16;

#[derive(Debug, Default, Clone, Copy)]
struct PageCounters {
    pages_in_use: u64,
    pages_new: u64,
    pages_del: u64,
}

/// Wholesale, page-aligned memory source shared by every cache that draws
/// from it.
///
/// The alignment guarantee is the whole point of this type: the backing
/// [`RawAllocator`] is not assumed to hand out aligned memory (matching a
/// real `malloc`), so `acquire`/`acquire_pages` over-allocate and store the
/// original pointer in a small prelude immediately before the aligned
/// region they hand back. `release` recovers it from there.
pub struct PageSupplier {
    page_size: usize,
    allocator: Box<dyn RawAllocator>,
    refcnt: AtomicUsize,
    counters: Mutex<PageCounters>,
}

impl PageSupplier {
    /// `page_size` must be a power of two of at least 4096 bytes.
    pub fn new(page_size: usize, allocator: Box<dyn RawAllocator>) -> Result<Self> {
        if !page_size.is_power_of_two() || page_size < 4096 {
            return Err(Error::InvalidArgument("page_size must be a power of two >= 4096"));
        }
        Ok(Self {
            page_size,
            allocator,
            refcnt: AtomicUsize::new(0),
            counters: Mutex::new(PageCounters::default()),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Acquire a single page-aligned, page-sized block.
    pub fn acquire(&self) -> Result<NonNull<u8>> {
        self.acquire_pages(1)
    }

    /// Acquire `count` contiguous pages, aligned to `page_size`. Used by the
    /// large-allocation path, which needs more than one page at a time.
    pub fn acquire_pages(&self, count: usize) -> Result<NonNull<u8>> {
        debug_assert!(count >= 1);
        let region_size = self
            .page_size
            .checked_mul(count)
            .ok_or(Error::InvalidArgument("requested region too large"))?;

        let prelude = size_of::<usize>();
        let over_alloc = region_size
            .checked_add(self.page_size - 1)
            .and_then(|v| v.checked_add(prelude))
            .ok_or(Error::InvalidArgument("requested region too large"))?;

        let raw = self.allocator.alloc(over_alloc).ok_or(Error::OutOfMemory)?;
        let raw_addr = raw.as_ptr() as usize;
        let aligned_addr = (raw_addr + prelude).next_multiple_of(self.page_size);

        // SAFETY: `aligned_addr - prelude` lies within the `over_alloc`
        // bytes we just allocated starting at `raw_addr`, since
        // `aligned_addr < raw_addr + prelude + page_size` and `prelude`
        // bytes precede it.
        unsafe {
            ((aligned_addr - prelude) as *mut usize).write(raw_addr);
        }

        let mut counters = self.counters.lock().expect("page supplier lock poisoned");
        counters.pages_in_use += count as u64;
        counters.pages_new += count as u64;

        // SAFETY: aligned_addr is non-null (derived from a non-null
        // allocation plus a positive offset that cannot wrap, since
        // over_alloc was computed without overflow above).
        Ok(unsafe { NonNull::new_unchecked(aligned_addr as *mut u8) })
    }

    /// Release a region previously returned by `acquire`/`acquire_pages`.
    pub fn release(&self, ptr: NonNull<u8>, count: usize) {
        let prelude = size_of::<usize>();
        let aligned_addr = ptr.as_ptr() as usize;
        // SAFETY: `ptr` was returned by `acquire`/`acquire_pages`, which
        // always wrote the original allocation address `prelude` bytes
        // before it.
        let raw_addr = unsafe { *((aligned_addr - prelude) as *const usize) };
        let region_size = self.page_size * count;
        let over_alloc = region_size + self.page_size - 1 + prelude;

        // SAFETY: `raw_addr` is the pointer originally returned by
        // `self.allocator.alloc(over_alloc)` in `acquire_pages`, with the
        // same size, and has not been freed since (caller's
        // responsibility, matching `RawAllocator::free`'s contract).
        unsafe {
            self.allocator
                .free(NonNull::new_unchecked(raw_addr as *mut u8), over_alloc);
        }

        let mut counters = self.counters.lock().expect("page supplier lock poisoned");
        counters.pages_in_use = counters.pages_in_use.saturating_sub(count as u64);
        counters.pages_del += count as u64;
    }

    /// Register a new cache as a user of this supplier.
    pub fn acquire_ref(&self) {
        self.refcnt.fetch_add(1, Ordering::AcqRel);
    }

    /// Deregister a cache. Returns the supplier's remaining refcount; a
    /// caller that owns the supplier may destroy it once this reaches 0.
    pub fn release_ref(&self) -> usize {
        self.refcnt.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn refcount(&self) -> usize {
        self.refcnt.load(Ordering::Acquire)
    }

    /// `(pages_in_use, pages_new, pages_del)`.
    pub fn stats(&self) -> (u64, u64, u64) {
        let c = self.counters.lock().expect("page supplier lock poisoned");
        (c.pages_in_use, c.pages_new, c.pages_del)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::SystemAllocator;

    #[test]
    fn pages_come_back_aligned() {
        let supplier = PageSupplier::new(65536, Box::new(SystemAllocator)).unwrap();
        for _ in 0..8 {
            let p = supplier.acquire().unwrap();
            assert_eq!(p.as_ptr() as usize % 65536, 0);
            supplier.release(p, 1);
        }
        let (in_use, new, del) = supplier.stats();
        assert_eq!(in_use, 0);
        assert_eq!(new, 8);
        assert_eq!(del, 8);
    }

    #[test]
    fn multi_page_regions_are_aligned_and_contiguous() {
        let supplier = PageSupplier::new(65536, Box::new(SystemAllocator)).unwrap();
        let p = supplier.acquire_pages(4).unwrap();
        assert_eq!(p.as_ptr() as usize % 65536, 0);
        unsafe {
            p.as_ptr().write_bytes(0x11, 65536 * 4);
        }
        supplier.release(p, 4);
    }

    #[test]
    fn rejects_non_power_of_two_page_size() {
        assert!(PageSupplier::new(65535, Box::new(SystemAllocator)).is_err());
        assert!(PageSupplier::new(2048, Box::new(SystemAllocator)).is_err());
    }

    #[test]
    fn refcount_tracks_users() {
        let supplier = PageSupplier::new(65536, Box::new(SystemAllocator)).unwrap();
        supplier.acquire_ref();
        supplier.acquire_ref();
        assert_eq!(supplier.refcount(), 2);
        assert_eq!(supplier.release_ref(), 1);
        assert_eq!(supplier.release_ref(), 0);
    }
}

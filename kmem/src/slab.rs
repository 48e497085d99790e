//! A single page carved into fixed-size objects, plus its embedded
//! free-list bookkeeping.
//!
//! The design notes call out two ways to thread the free-list: overlay the
//! "next free" pointer directly on top of unused object storage (what
//! `examples/original_source/imembase.h`'s `IMEMSLAB`/`bufctl` does), or
//! keep a side-array of slot indices next to the slab header. We take the
//! side-array route the notes recommend: it costs `num * 4` bytes per
//! slab, and in exchange a caller can never corrupt our bookkeeping by
//! writing into a free object, nor can a stray free-list bug corrupt
//! caller data.

use intrusive_collections::{LinkedListLink, intrusive_adapter};
use std::ptr::NonNull;

const NIL: u32 = u32::MAX;

/// One page's worth of fixed-size objects.
///
/// `membase` points at the first object (after the leading color pad);
/// `mem_size` is the full page size this slab was carved from, used only
/// to recover the page base for [`Slab::page_base`].
pub struct Slab {
    pub(crate) link: LinkedListLink,
    membase: NonNull<u8>,
    color_offset: usize,
    mem_size: usize,
    unit_size: usize,
    num: u32,
    in_use: u32,
    bufctl: Option<u32>,
    /// `free_next[i]` is the index of the next free slot after slot `i`,
    /// or `NIL` if `i` is the last free slot. Only meaningful for slots
    /// currently on the free-list.
    free_next: Box<[u32]>,
    /// Which of the cache's three lists this slab currently lives on.
    /// Read (under the cache's list lock) to pick the right
    /// `cursor_mut_from_ptr` call when a pointer-map lookup hands back a
    /// raw slab pointer with no other way to know its current list.
    pub(crate) list_kind: ListKind,
}

/// Tag for the list a [`Slab`] currently belongs to, mirroring the three
/// lists a [`crate::cache::Cache`] keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListKind {
    Full,
    Partial,
    Free,
}

intrusive_adapter!(pub SlabAdapter = Box<Slab>: Slab { link: LinkedListLink });

impl Slab {
    /// Carve a new slab out of `page`, starting the object array
    /// `color_offset` bytes into the page.
    ///
    /// # Safety
    /// `page` must point to a writable region of at least `mem_size` bytes
    /// that this `Slab` will own exclusively for its lifetime, and
    /// `color_offset + num * unit_size <= mem_size` must hold.
    pub unsafe fn construct(
        page: NonNull<u8>,
        mem_size: usize,
        color_offset: usize,
        unit_size: usize,
        num: u32,
    ) -> Self {
        debug_assert!(num > 0);
        debug_assert!(color_offset + (num as usize) * unit_size <= mem_size);

        let membase = {
            // SAFETY: caller guarantees `color_offset` stays within the page.
            let ptr = unsafe { page.as_ptr().add(color_offset) };
            // SAFETY: `page` is non-null and `color_offset` is bounded by
            // `mem_size` above, so the result cannot wrap or be null.
            unsafe { NonNull::new_unchecked(ptr) }
        };

        let mut free_next = vec![NIL; num as usize].into_boxed_slice();
        for i in 0..num - 1 {
            free_next[i as usize] = i + 1;
        }

        Self {
            link: LinkedListLink::new(),
            membase,
            color_offset,
            mem_size,
            unit_size,
            num,
            in_use: 0,
            bufctl: Some(0),
            free_next,
            list_kind: ListKind::Free,
        }
    }

    pub fn num(&self) -> u32 {
        self.num
    }

    pub fn in_use(&self) -> u32 {
        self.in_use
    }

    pub fn is_full(&self) -> bool {
        self.bufctl.is_none()
    }

    pub fn is_empty(&self) -> bool {
        self.in_use == 0
    }

    /// The address the page supplier originally handed out for this slab
    /// (i.e. `membase` minus the color pad).
    pub fn page_base(&self) -> NonNull<u8> {
        // SAFETY: `membase` was computed as `page + color_offset` in
        // `construct`, so subtracting `color_offset` recovers `page`.
        unsafe { NonNull::new_unchecked(self.membase.as_ptr().sub(self.color_offset)) }
    }

    pub fn mem_size(&self) -> usize {
        self.mem_size
    }

    /// The leading coloring pad this slab was constructed with, i.e. the
    /// byte offset from the page's base to `membase`. Exposed so a
    /// cache's test suite can check the color-rotation sequence `grow`
    /// produces across successive slabs (spec §8 scenario S4); nothing in
    /// `alloc_one`/`free_one`/`free` needs to read this back at runtime.
    pub fn color_offset(&self) -> usize {
        self.color_offset
    }

    /// `true` if `ptr` falls within the page this slab was carved from.
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        let base = self.page_base().as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        addr >= base && addr < base + self.mem_size
    }

    /// Pop one object off the free-list. `None` if the slab is full.
    pub fn alloc_one(&mut self) -> Option<NonNull<u8>> {
        let idx = self.bufctl?;
        self.bufctl = match self.free_next[idx as usize] {
            NIL => None,
            next => Some(next),
        };
        self.in_use += 1;

        // SAFETY: `idx < num`, and membase + idx * unit_size stays within
        // the object array by construction's invariant.
        let ptr = unsafe { self.membase.as_ptr().add(idx as usize * self.unit_size) };
        // SAFETY: derived from a non-null base pointer by a bounded offset.
        Some(unsafe { NonNull::new_unchecked(ptr) })
    }

    /// Push `ptr` back onto the free-list.
    ///
    /// # Safety
    /// `ptr` must have been returned by `alloc_one` on this slab and not
    /// already freed (double-free is not detected, per the design's
    /// non-goals).
    pub unsafe fn free_one(&mut self, ptr: NonNull<u8>) {
        let offset = ptr.as_ptr() as usize - self.membase.as_ptr() as usize;
        debug_assert_eq!(offset % self.unit_size, 0);
        let idx = (offset / self.unit_size) as u32;
        debug_assert!(idx < self.num);

        self.free_next[idx as usize] = self.bufctl.unwrap_or(NIL);
        self.bufctl = Some(idx);
        self.in_use -= 1;
    }

    /// Every address currently on the free-list, for invariant checks.
    #[cfg(test)]
    pub(crate) fn free_addresses(&self) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cur = self.bufctl;
        while let Some(idx) = cur {
            out.push(self.membase.as_ptr() as usize + idx as usize * self.unit_size);
            cur = match self.free_next[idx as usize] {
                NIL => None,
                next => Some(next),
            };
        }
        out
    }
}

// SAFETY: a Slab's raw pointers are only ever touched while the owning
// cache's list lock (or, during a fast-path hit, its selected magazine's
// lock) is held; Slab itself carries no thread affinity.
unsafe impl Send for Slab {}
unsafe impl Sync for Slab {}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_slab(num: u32) -> (Slab, Box<[u8]>) {
        let unit_size = 64;
        let mem_size = 4096;
        let mut page = vec![0u8; mem_size].into_boxed_slice();
        let ptr = NonNull::new(page.as_mut_ptr()).unwrap();
        // SAFETY: `page` is live for the duration of the test and large
        // enough for `num` objects of `unit_size` bytes starting at offset 0.
        let slab = unsafe { Slab::construct(ptr, mem_size, 0, unit_size, num) };
        (slab, page)
    }

    #[test]
    fn fresh_slab_is_empty_not_full() {
        let (slab, _page) = make_slab(8);
        assert!(slab.is_empty());
        assert!(!slab.is_full());
        assert_eq!(slab.in_use(), 0);
    }

    #[test]
    fn alloc_all_then_full() {
        let (mut slab, _page) = make_slab(4);
        let mut ptrs = vec![];
        for _ in 0..4 {
            ptrs.push(slab.alloc_one().expect("should have capacity"));
        }
        assert!(slab.is_full());
        assert!(slab.alloc_one().is_none());

        // distinct addresses
        let mut addrs: Vec<usize> = ptrs.iter().map(|p| p.as_ptr() as usize).collect();
        addrs.sort_unstable();
        addrs.dedup();
        assert_eq!(addrs.len(), 4);
    }

    #[test]
    fn free_list_consistency_after_partial_frees() {
        let (mut slab, _page) = make_slab(6);
        let ptrs: Vec<_> = (0..6).map(|_| slab.alloc_one().unwrap()).collect();
        // SAFETY: each pointer came from alloc_one on this slab and hasn't
        // been freed yet.
        unsafe {
            slab.free_one(ptrs[1]);
            slab.free_one(ptrs[4]);
        }
        assert_eq!(slab.in_use(), 4);
        let mut free = slab.free_addresses();
        free.sort_unstable();
        let mut expected = vec![ptrs[1].as_ptr() as usize, ptrs[4].as_ptr() as usize];
        expected.sort_unstable();
        assert_eq!(free, expected);
    }

    #[test]
    fn contains_checks_page_range() {
        let (slab, page) = make_slab(4);
        let base = page.as_ptr() as usize;
        let inside = NonNull::new((base + 10) as *mut u8).unwrap();
        let outside = NonNull::new((base + 5000) as *mut u8).unwrap();
        assert!(slab.contains(inside));
        assert!(!slab.contains(outside));
    }
}

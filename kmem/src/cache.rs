//! A cache of slabs all dispensing one object size.
//!
//! Grounded on `examples/original_source/imembase.h`'s `IMEMCACHE`: three
//! slab lists plus their cardinalities, an array of magazines, a page
//! supplier, a name, and page counters — all under one `list_lock`. The
//! magazine fast path and the slab-list slow path are exactly the two
//! tiers the design calls for; see `magazine.rs` and `slab.rs`.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use intrusive_collections::LinkedList;

use crate::error::{Error, Result};
use crate::magazine::{MAGAZINE_COUNT, Magazine};
use crate::page::PageSupplier;
use crate::ptrmap::{Lookup, PointerCacheMap};
use crate::slab::{ListKind, Slab, SlabAdapter};

pub const MAX_NAME_LEN: usize = 32;
/// Kept for fidelity with the original's construction rule even though
/// our side-array free-list (see `slab.rs`) never embeds a pointer in
/// object storage, so nothing actually requires `unit_size` to be
/// pointer-sized here.
const MIN_LINK_SIZE: usize = size_of::<usize>();
const ALIGN: usize = 8;

fn round_up(value: usize, align: usize) -> usize {
    value.next_multiple_of(align)
}

/// The storage `unit_size` a cache would round `obj_size` up to, ahead of
/// actually constructing one. Exposed so callers choosing which sizes to
/// build caches for (the facade's size-class table) can apply the same
/// `unit_size > page_size / 8` admission rule `Cache::new` enforces,
/// rather than maintaining a second, independently-tuned cutoff that can
/// drift out of sync with it.
pub fn unit_size_for(obj_size: usize) -> usize {
    round_up(obj_size.max(MIN_LINK_SIZE), ALIGN)
}

struct CacheLists {
    partial: LinkedList<SlabAdapter>,
    full: LinkedList<SlabAdapter>,
    free: LinkedList<SlabAdapter>,
    count_partial: usize,
    count_full: usize,
    count_free: usize,
    color_next: usize,
}

/// Per-object-size allocator state. See the module docs for the overall
/// shape; `alloc`/`free` are the two entry points everything else exists
/// to support.
pub struct Cache {
    /// Lets `&self` methods hand the pointer map an `Arc<Cache>` without
    /// requiring callers to thread one through; set once at construction
    /// via `Arc::new_cyclic`.
    self_weak: Weak<Cache>,
    name: String,
    obj_size: usize,
    unit_size: usize,
    page_size: usize,
    num: u32,
    color_limit: usize,
    batchcount: usize,
    magazine_limit: usize,
    free_limit: AtomicUsize,
    watermark_bytes: AtomicU64,
    lists: Mutex<CacheLists>,
    magazines: [Magazine; MAGAZINE_COUNT],
    magazine_rr: AtomicUsize,
    supplier: Arc<PageSupplier>,
    ptr_map: Arc<PointerCacheMap>,
    pages_new: AtomicU64,
    pages_del: AtomicU64,
}

impl Cache {
    /// Create a cache dispensing `obj_size`-byte objects, backed by
    /// `supplier` (which must already use `page_size`-byte pages) and
    /// registering new slabs in `ptr_map`.
    pub fn new(
        name: &str,
        obj_size: usize,
        page_size: usize,
        supplier: Arc<PageSupplier>,
        ptr_map: Arc<PointerCacheMap>,
        watermark_bytes: u64,
    ) -> Result<Arc<Self>> {
        if name.len() > MAX_NAME_LEN {
            return Err(Error::InvalidArgument("cache name longer than 32 bytes"));
        }
        if obj_size == 0 {
            return Err(Error::InvalidArgument("object size must be non-zero"));
        }

        let unit_size = unit_size_for(obj_size);
        if unit_size > page_size / 8 {
            return Err(Error::InvalidArgument(
                "object too large for a slab cache; route through the large path",
            ));
        }

        // Our `Slab` header lives on the Rust heap rather than at the
        // front of the page (see slab.rs), so there is no header to carve
        // out of `page_size` here: the whole page is available for
        // objects.
        let num = (page_size / unit_size) as u32;
        if num == 0 {
            return Err(Error::InvalidArgument("page too small for even one object"));
        }
        let color_limit = page_size % unit_size;

        let batchcount = (num as usize / 2).max(1);
        let magazine_limit = (4 * num as usize).max(batchcount * 2);

        supplier.acquire_ref();

        Ok(Arc::new_cyclic(|self_weak| Self {
            self_weak: self_weak.clone(),
            name: name.to_string(),
            obj_size,
            unit_size,
            page_size,
            num,
            color_limit,
            batchcount,
            magazine_limit,
            free_limit: AtomicUsize::new(4 * num as usize),
            watermark_bytes: AtomicU64::new(watermark_bytes),
            lists: Mutex::new(CacheLists {
                partial: LinkedList::new(SlabAdapter::new()),
                full: LinkedList::new(SlabAdapter::new()),
                free: LinkedList::new(SlabAdapter::new()),
                count_partial: 0,
                count_full: 0,
                count_free: 0,
                color_next: 0,
            }),
            magazines: std::array::from_fn(|_| Magazine::new(magazine_limit, batchcount)),
            magazine_rr: AtomicUsize::new(0),
            supplier,
            ptr_map,
            pages_new: AtomicU64::new(0),
            pages_del: AtomicU64::new(0),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn obj_size(&self) -> usize {
        self.obj_size
    }

    pub fn unit_size(&self) -> usize {
        self.unit_size
    }

    pub fn objects_per_slab(&self) -> u32 {
        self.num
    }

    /// The max rotation a new slab's `color_offset` can take on, i.e. the
    /// leftover bytes `page_size % unit_size` after the last whole object.
    /// Exposed for the same reason as `unit_size`: a caller (this module's
    /// own tests) checking the §8 S4 coloring sequence needs it to
    /// reproduce `(i * unit_size) mod (color_limit + 1)` independently of
    /// `grow_locked`'s internals.
    pub fn color_limit(&self) -> usize {
        self.color_limit
    }

    pub fn set_watermark(&self, bytes: u64) {
        self.watermark_bytes.store(bytes, Ordering::Relaxed);
    }

    fn pick_magazine(&self) -> usize {
        self.magazine_rr.fetch_add(1, Ordering::Relaxed) % MAGAZINE_COUNT
    }

    /// Allocate one object. Fast path: pop from a magazine. Slow path:
    /// refill a magazine's batch from the slab lists (growing the cache
    /// with a fresh page if needed), then pop.
    pub fn alloc(&self) -> Result<NonNull<u8>> {
        let mag = &self.magazines[self.pick_magazine()];
        if let Some(ptr) = mag.pop() {
            return Ok(ptr);
        }

        let mut batch = self.refill(mag.batchcount().max(1))?;
        let first = batch
            .pop()
            .expect("refill() only returns Ok with at least one object");
        if !batch.is_empty() {
            mag.fill(batch);
        }
        Ok(first)
    }

    /// Free one object. Fast path: push onto a magazine. Slow path: drain
    /// a batch back to the slab lists to make room, then push.
    pub fn free(&self, ptr: NonNull<u8>) {
        let mag = &self.magazines[self.pick_magazine()];
        let Err(ptr) = mag.push(ptr) else {
            return;
        };

        let drained = mag.drain_batch();
        self.return_batch(&drained);

        if mag.push(ptr).is_err() {
            // The magazine's batchcount was 0 (degenerate single-slot
            // magazine) and draining didn't free room; return it directly.
            self.return_batch(&[ptr]);
        }
    }

    fn refill(&self, count: usize) -> Result<Vec<NonNull<u8>>> {
        let mut batch = Vec::with_capacity(count);
        let mut lists = self.lists.lock().expect("cache list lock poisoned");

        while batch.len() < count {
            let slab = if let Some(s) = lists.partial.pop_front() {
                lists.count_partial -= 1;
                Some(s)
            } else if let Some(s) = lists.free.pop_front() {
                lists.count_free -= 1;
                Some(s)
            } else {
                self.grow_locked(&mut lists)
            };

            let Some(mut slab) = slab else { break };

            let ptr = slab
                .alloc_one()
                .expect("slab taken from partial/free/new always has free capacity");
            batch.push(ptr);
            Self::place_after_alloc(&mut lists, slab);
        }

        drop(lists);

        if batch.is_empty() {
            return Err(Error::OutOfMemory);
        }
        Ok(batch)
    }

    /// Obtain a fresh page from the supplier, carve a slab out of it with
    /// the cache's rotating color offset, and register it in the pointer
    /// map. Returns `None` on OOM rather than erroring, since callers are
    /// in the middle of a best-effort refill loop.
    fn grow_locked(&self, lists: &mut CacheLists) -> Option<Box<Slab>> {
        let page = self.supplier.acquire().ok()?;

        let color_offset = lists.color_next;
        lists.color_next = (lists.color_next + self.unit_size) % (self.color_limit + 1);

        // SAFETY: `page` is a freshly acquired, exclusively-owned
        // page_size-byte region, and `color_offset + num * unit_size <=
        // page_size` by this cache's construction invariant.
        let slab = unsafe { Slab::construct(page, self.page_size, color_offset, self.unit_size, self.num) };
        let boxed = Box::new(slab);
        let slab_ptr = NonNull::from(boxed.as_ref());

        // `self_weak` is set at construction time via `Arc::new_cyclic`
        // and this cache is reachable right now (we're executing one of
        // its own methods), so the upgrade cannot fail.
        let self_arc = self.self_weak.upgrade().expect("cache must still be alive to grow itself");
        self.ptr_map.insert_small(page, &self_arc, slab_ptr);
        self.pages_new.fetch_add(1, Ordering::Relaxed);

        Some(boxed)
    }

    fn place_after_alloc(lists: &mut CacheLists, mut slab: Box<Slab>) {
        if slab.is_full() {
            slab.list_kind = ListKind::Full;
            lists.full.push_front(slab);
            lists.count_full += 1;
        } else {
            slab.list_kind = ListKind::Partial;
            lists.partial.push_front(slab);
            lists.count_partial += 1;
        }
    }

    fn return_batch(&self, ptrs: &[NonNull<u8>]) {
        let mut lists = self.lists.lock().expect("cache list lock poisoned");
        for &ptr in ptrs {
            self.return_one(&mut lists, ptr);
        }
    }

    fn return_one(&self, lists: &mut CacheLists, ptr: NonNull<u8>) {
        let Some(Lookup::Small { slab, .. }) = self.ptr_map.lookup(ptr) else {
            log::warn!("kmem: free() of an untracked pointer in cache '{}'", self.name);
            return;
        };

        // SAFETY: `slab` was registered by `grow_locked` and is still
        // linked into one of this cache's three lists (we hold
        // `self.lists`'s lock, so nothing else can unlink it concurrently).
        let kind = unsafe { slab.as_ref() }.list_kind;
        let list = match kind {
            ListKind::Full => &mut lists.full,
            ListKind::Partial => &mut lists.partial,
            ListKind::Free => {
                log::error!("kmem: free() of a pointer whose slab is already fully free");
                return;
            }
        };

        // SAFETY: per `kind` read above (under the same lock the whole
        // time), `slab` is currently linked into exactly `list`.
        let mut cursor = unsafe { list.cursor_mut_from_ptr(slab.as_ptr()) };
        let mut boxed = cursor
            .remove()
            .expect("slab pointer must be linked in the list its own tag names");

        match kind {
            ListKind::Full => lists.count_full -= 1,
            ListKind::Partial => lists.count_partial -= 1,
            ListKind::Free => unreachable!("handled above"),
        }

        // SAFETY: `ptr` was returned by this exact slab's `alloc_one` and
        // is freed at most once per such call (double-free is undefined
        // per the design's non-goals, not something we detect).
        unsafe { boxed.free_one(ptr) };

        if boxed.is_empty() {
            let would_exceed = ((lists.count_free + 1) as u64) * self.page_size as u64
                > self.watermark_bytes.load(Ordering::Relaxed);
            if would_exceed {
                let page = boxed.page_base();
                self.ptr_map.remove(page);
                self.supplier.release(page, 1);
                self.pages_del.fetch_add(1, Ordering::Relaxed);
                drop(boxed);
            } else {
                boxed.list_kind = ListKind::Free;
                lists.free.push_front(boxed);
                lists.count_free += 1;
            }
        } else {
            boxed.list_kind = ListKind::Partial;
            lists.partial.push_front(boxed);
            lists.count_partial += 1;
        }
    }

    /// Give every magazine's cached objects back to their home slabs.
    ///
    /// A slab an application has fully freed can still look "partial" (or
    /// even "full") from this cache's own list bookkeeping, simply because
    /// the freed objects are sitting uncommitted in a magazine — `in_use`
    /// is only decremented once a magazine actually drains an object back
    /// through `return_one`. Both `shrink` and `destroy` need the lists to
    /// reflect true occupancy before they can decide what's reclaimable or
    /// outstanding.
    fn drain_magazines_to_lists(&self) {
        for mag in &self.magazines {
            let drained = mag.drain_all();
            if !drained.is_empty() {
                self.return_batch(&drained);
            }
        }
    }

    /// Release every page on the free list back to the supplier.
    pub fn shrink(&self) {
        self.drain_magazines_to_lists();

        let mut lists = self.lists.lock().expect("cache list lock poisoned");
        let mut released = 0u64;
        while let Some(boxed) = lists.free.pop_front() {
            let page = boxed.page_base();
            self.ptr_map.remove(page);
            self.supplier.release(page, 1);
            released += 1;
            drop(boxed);
        }
        lists.count_free = 0;
        drop(lists);
        if released > 0 {
            self.pages_del.fetch_add(released, Ordering::Relaxed);
        }
    }

    /// Tear the cache down: fails with `Busy` while any object is still
    /// checked out by an application. Magazines are drained to the slab
    /// lists first, so an object merely cached (already freed by its
    /// application, not yet returned to a slab) doesn't count as
    /// outstanding — only `count_full + count_partial > 0` after that
    /// drain reflects a real caller still holding an object. Otherwise
    /// releases every remaining (free) slab's page and drops this cache's
    /// reference on the shared page supplier.
    pub fn destroy(&self) -> Result<()> {
        self.drain_magazines_to_lists();
        {
            let lists = self.lists.lock().expect("cache list lock poisoned");
            if lists.count_full + lists.count_partial > 0 {
                return Err(Error::Busy);
            }
        }
        self.shrink();
        self.supplier.release_ref();
        Ok(())
    }

    /// `(count_full, count_partial, count_free)`.
    pub fn list_counts(&self) -> (usize, usize, usize) {
        let lists = self.lists.lock().expect("cache list lock poisoned");
        (lists.count_full, lists.count_partial, lists.count_free)
    }

    /// `(pages_new, pages_del)` attributed to this cache.
    pub fn page_counts(&self) -> (u64, u64) {
        (
            self.pages_new.load(Ordering::Relaxed),
            self.pages_del.load(Ordering::Relaxed),
        )
    }

    /// Objects presently cached in magazines plus free-but-still-slabbed
    /// objects, combined the way the design's `free_objects` field does.
    pub fn free_object_count(&self) -> usize {
        let magazine_free: usize = self.magazines.iter().map(Magazine::avail).sum();
        let lists = self.lists.lock().expect("cache list lock poisoned");
        let slab_free: usize = lists
            .partial
            .iter()
            .map(|s| (s.num() - s.in_use()) as usize)
            .sum::<usize>()
            + lists.free.iter().map(|s| s.num() as usize).sum::<usize>();
        magazine_free + slab_free
    }

    /// Objects currently handed out and not yet freed to any magazine or
    /// slab.
    pub fn objects_in_use(&self) -> usize {
        let lists = self.lists.lock().expect("cache list lock poisoned");
        let full: usize = lists.full.iter().map(|s| s.num() as usize).sum();
        let partial: usize = lists.partial.iter().map(|s| s.in_use() as usize).sum();
        full + partial
    }

    pub fn free_limit(&self) -> usize {
        self.free_limit.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::SystemAllocator;

    fn new_cache(obj_size: usize, page_size: usize) -> Arc<Cache> {
        let supplier = Arc::new(PageSupplier::new(page_size, Box::new(SystemAllocator)).unwrap());
        let ptr_map = Arc::new(PointerCacheMap::new(page_size));
        Cache::new("test", obj_size, page_size, supplier, ptr_map, u64::MAX).unwrap()
    }

    #[test]
    fn alloc_then_free_round_trips() {
        let cache = new_cache(64, 65536);
        let p = cache.alloc().unwrap();
        cache.free(p);
        let (full, partial, _free) = cache.list_counts();
        assert_eq!(full, 0);
        assert!(partial <= 1);
    }

    #[test]
    fn exact_slab_fill_migrates_free_to_partial_to_full() {
        let cache = new_cache(64, 65536);
        let num = cache.objects_per_slab() as usize;

        let mut ptrs = Vec::new();
        for _ in 0..num {
            ptrs.push(cache.alloc().unwrap());
        }
        let (full, partial, free) = cache.list_counts();
        assert_eq!(full, 1, "exactly `num` allocations should fill one slab");
        assert_eq!(partial, 0);
        assert_eq!(free, 0);

        for p in ptrs.into_iter().rev() {
            cache.free(p);
        }
        // Freed objects land in magazines first; drain them all back to
        // force the slab bookkeeping to observe the frees.
        for m in &cache.magazines {
            let batch = m.drain_batch();
            cache.return_batch(&batch);
        }
        let (full, partial, free) = cache.list_counts();
        assert_eq!(full, 0);
        assert_eq!(partial, 0);
        assert_eq!(free, 1, "the now-empty slab's page should be retained below watermark");

        cache.shrink();
        let (_, _, free) = cache.list_counts();
        assert_eq!(free, 0);
    }

    #[test]
    fn s4_slab_coloring_rotates_by_unit_size_mod_color_limit_plus_one() {
        // A small `num` (8 objects/slab) keeps the slab-growth boundaries
        // predictable: every `num`-th allocation after the magazine
        // layer is exhausted forces exactly one new slab.
        let cache = new_cache(8000, 65536);
        let num = cache.objects_per_slab() as usize;
        assert_eq!(num, 8, "unit_size=8000 on a 64 KiB page should fit 8 objects/slab");

        for _ in 0..num * 4 {
            cache.alloc().unwrap();
        }

        let lists = cache.lists.lock().unwrap();
        // `full` is a stack (push_front on creation), so slab 3 (created
        // last) is at the front; reverse to read them in creation order.
        let mut colors: Vec<usize> = lists.full.iter().map(Slab::color_offset).collect();
        colors.reverse();
        assert_eq!(colors.len(), 4);

        let modulus = cache.color_limit() + 1;
        for (i, &color) in colors.iter().enumerate() {
            let expected = (i * cache.unit_size()) % modulus;
            assert_eq!(color, expected, "slab {i}'s color_offset should be (i * unit_size) mod (color_limit + 1)");
        }
    }

    #[test]
    fn distinct_pointers_never_alias() {
        let cache = new_cache(32, 65536);
        let mut ptrs = std::collections::HashSet::new();
        for _ in 0..500 {
            let p = cache.alloc().unwrap();
            assert!(ptrs.insert(p.as_ptr() as usize), "alloc returned a pointer twice");
        }
    }

    #[test]
    fn destroy_fails_while_busy() {
        let cache = new_cache(64, 65536);
        let p = cache.alloc().unwrap();
        let err = cache.destroy().unwrap_err();
        assert!(matches!(err, Error::Busy));
        cache.free(p);
    }

    #[test]
    fn growth_allocates_one_distinct_page_per_slab() {
        let cache = new_cache(100, 65536);
        let num = cache.objects_per_slab() as usize;
        for _ in 0..num * 4 {
            cache.alloc().unwrap();
        }
        let lists = cache.lists.lock().unwrap();
        let mut pages: Vec<usize> = lists.full.iter().map(|s| s.page_base().as_ptr() as usize).collect();
        pages.sort_unstable();
        pages.dedup();
        assert_eq!(pages.len(), 4, "growing past capacity four times should use four distinct pages");
    }
}

//! The `kmem` size-class multiplexer: the thing application code actually
//! calls. Wraps the size-class table, the shared page supplier and pointer
//! map, and the named-cache registry behind `malloc`/`realloc`/`free` and
//! the named-cache convenience API.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::allocator::{PooledAllocator, RawAllocator, SystemAllocator};
use crate::cache::{self, Cache};
use crate::error::{Error, Result};
use crate::page::{DEFAULT_PAGE_SHIFT, PageSupplier};
use crate::ptrmap::{Lookup, PointerCacheMap};
use crate::registry::Registry;

/// The default set of size classes, chosen to roughly double each step —
/// the same spread the original's `ikmem_sizes` table covers. Not every
/// entry survives `init`'s admission filter at every `page_shift`: entries
/// whose rounded `unit_size` would exceed `page_size / 8` are dropped (see
/// `Cache::new`'s own check), which at the default 64 KiB page size drops
/// `16384` and leaves it to the large path.
pub const DEFAULT_SIZE_CLASSES: &[usize] = &[8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384];

/// Builder for [`Kmem::init`].
pub struct KmemConfig {
    page_shift: u32,
    use_host_malloc: bool,
    sizes: Option<Vec<usize>>,
    watermark_bytes: u64,
}

impl Default for KmemConfig {
    fn default() -> Self {
        Self {
            page_shift: DEFAULT_PAGE_SHIFT,
            use_host_malloc: true,
            sizes: None,
            watermark_bytes: u64::MAX,
        }
    }
}

impl KmemConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// `page_size = 1 << page_shift`. Must keep `page_size >= 4096`.
    pub fn page_shift(mut self, page_shift: u32) -> Self {
        self.page_shift = page_shift;
        self
    }

    /// `true` (the default): pages come straight from the host allocator.
    /// `false`: pages are drawn from a [`PooledAllocator`] that recycles
    /// freed blocks instead of returning them to the host.
    pub fn use_host_malloc(mut self, use_host_malloc: bool) -> Self {
        self.use_host_malloc = use_host_malloc;
        self
    }

    /// Override the default size-class spread. Sizes whose rounded
    /// `unit_size` would exceed `page_size / 8` are dropped (the same
    /// admission rule `Cache::new` enforces); everything above the
    /// largest surviving class goes through the large path.
    pub fn sizes(mut self, sizes: Vec<usize>) -> Self {
        self.sizes = Some(sizes);
        self
    }

    pub fn watermark_bytes(mut self, watermark_bytes: u64) -> Self {
        self.watermark_bytes = watermark_bytes;
        self
    }
}

/// A handle to a named cache, returned by [`Kmem::cache_create`] and
/// [`Kmem::cache_find`].
#[derive(Clone)]
pub struct CacheHandle(Arc<Cache>);

impl CacheHandle {
    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub fn obj_size(&self) -> usize {
        self.0.obj_size()
    }
}

/// A snapshot of one cache's bookkeeping, for [`Kmem::stats_cache`].
pub struct CacheStats {
    pub name: String,
    pub obj_size: usize,
    pub count_full: usize,
    pub count_partial: usize,
    pub count_free: usize,
    pub pages_new: u64,
    pub pages_del: u64,
}

/// The size-class multiplexer: arbitrary-size `malloc`/`realloc`/`free`
/// routed onto a fixed array of [`Cache`]s, plus a named-cache escape
/// hatch for callers that want their own object size.
pub struct Kmem {
    classes: Vec<(usize, Arc<Cache>)>,
    large_threshold: usize,
    supplier: Arc<PageSupplier>,
    ptr_map: Arc<PointerCacheMap>,
    registry: Registry,
    watermark_bytes: AtomicU64,
}

impl Kmem {
    pub fn init(config: KmemConfig) -> Result<Self> {
        let page_size = 1usize
            .checked_shl(config.page_shift)
            .ok_or(Error::InvalidArgument("page_shift too large"))?;

        let allocator: Box<dyn RawAllocator> = if config.use_host_malloc {
            Box::new(SystemAllocator)
        } else {
            Box::new(PooledAllocator::new())
        };
        let supplier = Arc::new(PageSupplier::new(page_size, allocator)?);
        let ptr_map = Arc::new(PointerCacheMap::new(page_size));
        let registry = Registry::new();

        let mut sizes = config.sizes.unwrap_or_else(|| DEFAULT_SIZE_CLASSES.to_vec());
        sizes.sort_unstable();
        sizes.dedup();
        // Mirror `Cache::new`'s own admission rule exactly, rather than
        // an independently-tuned `size < page_size / 2` cutoff: a class
        // only belongs in the table if a cache for it would actually
        // construct. Sizes that fail this are left to the large path.
        sizes.retain(|&size| cache::unit_size_for(size) <= page_size / 8);

        let mut classes = Vec::with_capacity(sizes.len());
        for size in sizes {
            let name = format!("size-{size}");
            let supplier = Arc::clone(&supplier);
            let ptr_map = Arc::clone(&ptr_map);
            let cache = registry.get_or_create(&name, || {
                Cache::new(&name, size, page_size, supplier, ptr_map, config.watermark_bytes)
            })?;
            classes.push((size, cache));
        }
        classes.sort_by_key(|(size, _)| *size);
        let large_threshold = classes.last().map_or(0, |(size, _)| *size);

        log::debug!("kmem: initialized with {} size classes, page_size={page_size}", classes.len());

        Ok(Self {
            classes,
            large_threshold,
            supplier,
            ptr_map,
            registry,
            watermark_bytes: AtomicU64::new(config.watermark_bytes),
        })
    }

    /// Tear the allocator down. Fails with [`Error::Busy`] and leaves
    /// everything untouched if any cache (size-class or named) still has
    /// outstanding objects.
    pub fn destroy(&self) -> Result<()> {
        let names = self.registry.names();
        for name in &names {
            if let Some(cache) = self.registry.find(name) {
                // Settle every magazine's cached objects back onto the
                // slab lists before judging busyness — otherwise an object
                // an application already freed, but that hasn't drained
                // out of its magazine yet, would look like it's still
                // checked out.
                cache.shrink();
                let (full, partial, _) = cache.list_counts();
                if full + partial > 0 {
                    return Err(Error::Busy);
                }
            }
        }
        for name in &names {
            if let Some(cache) = self.registry.remove(name) {
                cache.destroy()?;
            }
        }
        Ok(())
    }

    fn class_for(&self, size: usize) -> Option<&Arc<Cache>> {
        self.classes.iter().find(|(threshold, _)| *threshold >= size).map(|(_, cache)| cache)
    }

    pub fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        if size > self.large_threshold {
            let page_size = self.supplier.page_size();
            let pages = size.div_ceil(page_size);
            let ptr = self.supplier.acquire_pages(pages).ok()?;
            self.ptr_map.insert_large(ptr, pages * page_size);
            return Some(ptr);
        }

        let cache = self.class_for(size)?;
        cache.alloc().ok()
    }

    pub fn free(&self, ptr: NonNull<u8>) {
        match self.ptr_map.lookup(ptr) {
            Some(Lookup::Large { size }) => {
                let pages = size / self.supplier.page_size();
                self.ptr_map.remove(ptr);
                self.supplier.release(ptr, pages);
            }
            Some(Lookup::Small { cache, .. }) => cache.free(ptr),
            None => log::warn!("kmem: free() of a pointer this allocator never returned"),
        }
    }

    pub fn ptr_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        match self.ptr_map.lookup(ptr)? {
            Lookup::Large { size } => Some(size),
            Lookup::Small { cache, .. } => Some(cache.obj_size()),
        }
    }

    /// Grow, shrink, or resize in place. Returns a new pointer (the old
    /// one is freed) unless `new_size` still fits the current allocation.
    pub fn realloc(&self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        let lookup = self.ptr_map.lookup(ptr)?;
        let (old_size, fits) = match &lookup {
            Lookup::Small { cache, .. } => (cache.obj_size(), new_size <= cache.obj_size()),
            Lookup::Large { size } => {
                let needed = new_size.div_ceil(self.supplier.page_size()) * self.supplier.page_size();
                (*size, needed <= *size)
            }
        };
        if fits {
            return Some(ptr);
        }

        let new_ptr = self.malloc(new_size)?;
        let copy_len = old_size.min(new_size);
        // SAFETY: `ptr` is `old_size` live bytes previously handed out by
        // this allocator, `new_ptr` is `new_size` freshly allocated bytes
        // that cannot overlap it, and `copy_len` doesn't exceed either.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), copy_len);
        }
        self.free(ptr);
        Some(new_ptr)
    }

    /// Reclaim retained-but-free pages across every cache, size-class and
    /// named alike.
    pub fn shrink(&self) {
        for name in self.registry.names() {
            if let Some(cache) = self.registry.find(&name) {
                cache.shrink();
            }
        }
    }

    /// Set the reclaim watermark (in pages) applied by every existing and
    /// future cache: a slab that empties out is released back to the
    /// supplier once `count_free * page_size` would exceed this.
    pub fn set_watermark(&self, pages: u64) {
        let bytes = pages.saturating_mul(self.supplier.page_size() as u64);
        self.watermark_bytes.store(bytes, Ordering::Relaxed);
        for name in self.registry.names() {
            if let Some(cache) = self.registry.find(&name) {
                cache.set_watermark(bytes);
            }
        }
    }

    pub fn cache_create(&self, name: &str, size: usize) -> Result<CacheHandle> {
        let page_size = self.supplier.page_size();
        let watermark = self.watermark_bytes.load(Ordering::Relaxed);
        let supplier = Arc::clone(&self.supplier);
        let ptr_map = Arc::clone(&self.ptr_map);
        let cache = self
            .registry
            .get_or_create(name, || Cache::new(name, size, page_size, supplier, ptr_map, watermark))?;
        Ok(CacheHandle(cache))
    }

    pub fn cache_delete(&self, handle: CacheHandle) -> Result<()> {
        handle.0.shrink();
        let (full, partial, _) = handle.0.list_counts();
        if full + partial > 0 {
            return Err(Error::Busy);
        }
        self.registry.remove(handle.0.name());
        handle.0.destroy()
    }

    pub fn cache_alloc(&self, handle: &CacheHandle) -> Result<NonNull<u8>> {
        handle.0.alloc()
    }

    pub fn cache_free(&self, handle: &CacheHandle, ptr: NonNull<u8>) {
        handle.0.free(ptr);
    }

    pub fn cache_find(&self, name: &str) -> Option<CacheHandle> {
        self.registry.find(name).map(CacheHandle)
    }

    /// `(pages_in_use, pages_new, pages_del)`.
    pub fn stats_pages(&self) -> (u64, u64, u64) {
        self.supplier.stats()
    }

    fn all_caches(&self) -> Vec<Arc<Cache>> {
        let mut names = self.registry.names();
        names.sort();
        names.into_iter().filter_map(|name| self.registry.find(&name)).collect()
    }

    pub fn stats_cache(&self, index: usize) -> Option<CacheStats> {
        let cache = self.all_caches().into_iter().nth(index)?;
        let (count_full, count_partial, count_free) = cache.list_counts();
        let (pages_new, pages_del) = cache.page_counts();
        Some(CacheStats {
            name: cache.name().to_string(),
            obj_size: cache.obj_size(),
            count_full,
            count_partial,
            count_free,
            pages_new,
            pages_del,
        })
    }

    /// `(in_use_bytes, total_bytes)` across every page this allocator has
    /// drawn from the supplier.
    pub fn stats_waste(&self) -> (u64, u64) {
        let page_size = self.supplier.page_size() as u64;
        let (pages_in_use, ..) = self.supplier.stats();
        let total = pages_in_use * page_size;
        let in_use: u64 = self
            .all_caches()
            .iter()
            .map(|cache| (cache.objects_in_use() * cache.obj_size()) as u64)
            .sum();
        (in_use, total)
    }
}

/// A process-wide convenience instance, for callers that don't want to
/// thread a [`Kmem`] handle through their whole call graph. The design
/// notes call this out explicitly: keep the facade instantiable for
/// tests, but offer a default global on top.
pub mod global {
    use std::ptr::NonNull;
    use std::sync::Mutex;

    use super::{CacheHandle, CacheStats, Kmem, KmemConfig};
    use crate::error::{Error, Result};

    static GLOBAL: Mutex<Option<Kmem>> = Mutex::new(None);

    pub fn init(config: KmemConfig) -> Result<()> {
        let mut slot = GLOBAL.lock().expect("global allocator lock poisoned");
        if slot.is_some() {
            return Err(Error::AlreadyInitialized);
        }
        *slot = Some(Kmem::init(config)?);
        Ok(())
    }

    pub fn destroy() -> Result<()> {
        let mut slot = GLOBAL.lock().expect("global allocator lock poisoned");
        match slot.as_ref() {
            None => Err(Error::Uninitialized),
            Some(kmem) => {
                kmem.destroy()?;
                *slot = None;
                Ok(())
            }
        }
    }

    pub fn malloc(size: usize) -> Option<NonNull<u8>> {
        GLOBAL.lock().expect("global allocator lock poisoned").as_ref()?.malloc(size)
    }

    pub fn realloc(ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        GLOBAL
            .lock()
            .expect("global allocator lock poisoned")
            .as_ref()?
            .realloc(ptr, new_size)
    }

    pub fn free(ptr: NonNull<u8>) {
        if let Some(kmem) = GLOBAL.lock().expect("global allocator lock poisoned").as_ref() {
            kmem.free(ptr);
        }
    }

    pub fn ptr_size(ptr: NonNull<u8>) -> Option<usize> {
        GLOBAL
            .lock()
            .expect("global allocator lock poisoned")
            .as_ref()?
            .ptr_size(ptr)
    }

    pub fn set_watermark(pages: u64) -> Result<()> {
        let slot = GLOBAL.lock().expect("global allocator lock poisoned");
        slot.as_ref().ok_or(Error::Uninitialized)?.set_watermark(pages);
        Ok(())
    }

    pub fn cache_create(name: &str, size: usize) -> Result<CacheHandle> {
        GLOBAL
            .lock()
            .expect("global allocator lock poisoned")
            .as_ref()
            .ok_or(Error::Uninitialized)?
            .cache_create(name, size)
    }

    pub fn cache_delete(handle: CacheHandle) -> Result<()> {
        GLOBAL
            .lock()
            .expect("global allocator lock poisoned")
            .as_ref()
            .ok_or(Error::Uninitialized)?
            .cache_delete(handle)
    }

    pub fn cache_alloc(handle: &CacheHandle) -> Result<NonNull<u8>> {
        GLOBAL
            .lock()
            .expect("global allocator lock poisoned")
            .as_ref()
            .ok_or(Error::Uninitialized)?
            .cache_alloc(handle)
    }

    pub fn cache_free(handle: &CacheHandle, ptr: NonNull<u8>) {
        if let Some(kmem) = GLOBAL.lock().expect("global allocator lock poisoned").as_ref() {
            kmem.cache_free(handle, ptr);
        }
    }

    pub fn cache_find(name: &str) -> Option<CacheHandle> {
        GLOBAL.lock().expect("global allocator lock poisoned").as_ref()?.cache_find(name)
    }

    pub fn stats_pages() -> Result<(u64, u64, u64)> {
        Ok(GLOBAL
            .lock()
            .expect("global allocator lock poisoned")
            .as_ref()
            .ok_or(Error::Uninitialized)?
            .stats_pages())
    }

    pub fn stats_cache(index: usize) -> Option<CacheStats> {
        GLOBAL.lock().expect("global allocator lock poisoned").as_ref()?.stats_cache(index)
    }

    pub fn stats_waste() -> Result<(u64, u64)> {
        Ok(GLOBAL
            .lock()
            .expect("global allocator lock poisoned")
            .as_ref()
            .ok_or(Error::Uninitialized)?
            .stats_waste())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_succeeds_with_pure_defaults() {
        // `KmemConfig::default()` must build a working allocator out of
        // the box: every size in `DEFAULT_SIZE_CLASSES` that doesn't
        // survive `init`'s admission filter should simply be dropped to
        // the large path, never fail `Kmem::init` itself.
        let kmem = Kmem::init(KmemConfig::default()).expect("default config must initialize");
        let p = kmem.malloc(64).unwrap();
        kmem.free(p);
        kmem.destroy().unwrap();
    }

    #[test]
    fn s1_malloc_rounds_up_to_class_and_frees_cleanly() {
        let kmem = Kmem::init(KmemConfig::new().page_shift(16)).unwrap();
        let p = kmem.malloc(24).unwrap();
        assert_eq!(kmem.ptr_size(p), Some(32));
        kmem.free(p);
        kmem.destroy().unwrap();
    }

    #[test]
    fn s3_large_allocation_bypasses_the_size_classes() {
        let kmem = Kmem::init(KmemConfig::new().page_shift(16)).unwrap();
        let p = kmem.malloc(1 << 20).unwrap();
        assert_eq!(kmem.ptr_size(p), Some(1 << 20));
        kmem.free(p);
        kmem.destroy().unwrap();
    }

    #[test]
    fn destroy_refuses_while_anything_is_outstanding() {
        let kmem = Kmem::init(KmemConfig::new()).unwrap();
        let p = kmem.malloc(64).unwrap();
        assert!(matches!(kmem.destroy(), Err(Error::Busy)));
        kmem.free(p);
        kmem.destroy().unwrap();
    }

    #[test]
    fn realloc_in_place_when_it_still_fits_the_class() {
        let kmem = Kmem::init(KmemConfig::new()).unwrap();
        let p = kmem.malloc(10).unwrap();
        let q = kmem.realloc(p, 16).unwrap();
        assert_eq!(p, q, "16 still fits the size-16 class the 10-byte request landed in");
        kmem.free(q);
        kmem.destroy().unwrap();
    }

    #[test]
    fn realloc_growing_past_the_class_copies_and_frees_the_old_pointer() {
        let kmem = Kmem::init(KmemConfig::new()).unwrap();
        let p = kmem.malloc(8).unwrap();
        unsafe {
            p.as_ptr().write_bytes(0x42, 8);
        }
        let q = kmem.realloc(p, 4096).unwrap();
        assert_ne!(p, q);
        unsafe {
            assert_eq!(*q.as_ptr(), 0x42);
        }
        kmem.free(q);
        kmem.destroy().unwrap();
    }

    #[test]
    fn s6_duplicate_named_cache_returns_the_existing_handle() {
        let kmem = Kmem::init(KmemConfig::new()).unwrap();
        let a = kmem.cache_create("foo", 40).unwrap();
        let b = kmem.cache_create("foo", 40).unwrap();
        assert_eq!(a.name(), b.name());
        assert_eq!(a.obj_size(), b.obj_size());

        let p = kmem.cache_alloc(&a).unwrap();
        assert!(matches!(kmem.cache_delete(a), Err(Error::Busy)));
        kmem.cache_free(&b, p);
        kmem.destroy().unwrap();
    }

    #[test]
    fn set_watermark_of_zero_reclaims_once_the_freed_object_drains_out_of_its_magazine() {
        let kmem = Kmem::init(KmemConfig::new()).unwrap();
        kmem.set_watermark(0);
        let p = kmem.malloc(64).unwrap();
        kmem.free(p);
        // `free` only parks the object in a magazine; `shrink` is what
        // settles magazines back onto the slab lists and then applies the
        // watermark, so it's the point at which a zero watermark should
        // give the page back.
        kmem.shrink();
        let (in_use, ..) = kmem.stats_pages();
        assert_eq!(in_use, 0, "a zero watermark should release an emptied slab's page on shrink");
        kmem.destroy().unwrap();
    }

    #[test]
    fn stats_waste_reports_zero_in_use_after_everything_is_freed() {
        let kmem = Kmem::init(KmemConfig::new()).unwrap();
        let ptrs: Vec<_> = (0..64).map(|_| kmem.malloc(100).unwrap()).collect();
        let (in_use, total) = kmem.stats_waste();
        assert!(in_use > 0);
        assert!(total >= in_use);
        for p in ptrs {
            kmem.free(p);
        }
        kmem.shrink();
        let (in_use, _) = kmem.stats_waste();
        assert_eq!(in_use, 0);
        kmem.destroy().unwrap();
    }
}

//! Reverse lookup from any pointer the facade has handed out back to its
//! owning cache (or, for the large path, its recorded size).
//!
//! The original relies on slab headers sitting at the base of
//! page-aligned pages and recovers everything by pointer arithmetic. We
//! keep `Slab` off the page (see `slab.rs`'s module docs) for aliasing
//! safety, so that arithmetic trick isn't available — the design notes
//! anticipate exactly this ("a portable implementation ... should ...
//! keep a separate hash map keyed by page base"), which is what this is.
//!
//! Insertions happen once per new slab (or once per large allocation),
//! far rarer than lookups on the free/realloc/ptr_size path, so this is a
//! reader-writer lock rather than a plain mutex.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{RwLock, Weak};

use crate::cache::Cache;
use crate::slab::Slab;

#[derive(Clone, Copy)]
enum Entry {
    /// Lives in a size-class or named cache; `slab` lets the cache's
    /// `free` path find the owning `Slab` in O(1) without walking any
    /// list.
    Small { cache: Weak<Cache>, slab: NonNull<Slab> },
    /// A direct large allocation; `size` is what was actually requested
    /// rounded up to whole pages, i.e. what `ptr_size` should report.
    Large { size: usize },
}

// SAFETY: `Entry` is only ever read or written with `PointerCacheMap`'s
// `RwLock` held.
unsafe impl Send for Entry {}
unsafe impl Sync for Entry {}

pub enum Lookup {
    Small { cache: std::sync::Arc<Cache>, slab: NonNull<Slab> },
    Large { size: usize },
}

pub struct PointerCacheMap {
    page_size: usize,
    entries: RwLock<HashMap<usize, Entry>>,
}

impl PointerCacheMap {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn page_base(&self, ptr: NonNull<u8>) -> usize {
        (ptr.as_ptr() as usize) & !(self.page_size - 1)
    }

    pub fn insert_small(&self, page: NonNull<u8>, cache: &std::sync::Arc<Cache>, slab: NonNull<Slab>) {
        let base = self.page_base(page);
        self.entries.write().expect("ptr map lock poisoned").insert(
            base,
            Entry::Small {
                cache: std::sync::Arc::downgrade(cache),
                slab,
            },
        );
    }

    pub fn insert_large(&self, page: NonNull<u8>, size: usize) {
        let base = self.page_base(page);
        self.entries
            .write()
            .expect("ptr map lock poisoned")
            .insert(base, Entry::Large { size });
    }

    pub fn remove(&self, page: NonNull<u8>) {
        let base = self.page_base(page);
        self.entries.write().expect("ptr map lock poisoned").remove(&base);
    }

    pub fn lookup(&self, ptr: NonNull<u8>) -> Option<Lookup> {
        let base = self.page_base(ptr);
        let entries = self.entries.read().expect("ptr map lock poisoned");
        match *entries.get(&base)? {
            Entry::Small { ref cache, slab } => Some(Lookup::Small {
                cache: cache.upgrade()?,
                slab,
            }),
            Entry::Large { size } => Some(Lookup::Large { size }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::SystemAllocator;
    use crate::page::PageSupplier;

    #[test]
    fn large_round_trips() {
        let map = PointerCacheMap::new(65536);
        let supplier = PageSupplier::new(65536, Box::new(SystemAllocator)).unwrap();
        let page = supplier.acquire().unwrap();
        map.insert_large(page, 65536);

        match map.lookup(page) {
            Some(Lookup::Large { size }) => assert_eq!(size, 65536),
            _ => panic!("expected a large entry"),
        }

        // A pointer into the middle of the page still resolves to the
        // same entry.
        let mid = NonNull::new((page.as_ptr() as usize + 100) as *mut u8).unwrap();
        assert!(matches!(map.lookup(mid), Some(Lookup::Large { size: 65536 })));

        map.remove(page);
        assert!(map.lookup(page).is_none());
        supplier.release(page, 1);
    }

    #[test]
    fn missing_entry_is_none() {
        let map = PointerCacheMap::new(65536);
        let bogus = NonNull::new(0x1000 as *mut u8).unwrap();
        assert!(map.lookup(bogus).is_none());
    }

}

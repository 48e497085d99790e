//! The process-wide table of named caches, so that `cache_create` with a
//! name already in use hands back the existing cache instead of erroring
//! (`examples/original_source/imembase.h` describes `ikmem_cache_create`
//! doing exactly this rather than rejecting the duplicate; see DESIGN.md).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::cache::Cache;

#[derive(Default)]
pub struct Registry {
    by_name: Mutex<HashMap<String, Arc<Cache>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a cache by name, returning the one already registered if
    /// present, or registering and returning `make()`'s result otherwise.
    pub fn get_or_create<F, E>(&self, name: &str, make: F) -> Result<Arc<Cache>, E>
    where
        F: FnOnce() -> Result<Arc<Cache>, E>,
    {
        let mut by_name = self.by_name.lock().expect("cache registry lock poisoned");
        if let Some(existing) = by_name.get(name) {
            return Ok(Arc::clone(existing));
        }
        let cache = make()?;
        by_name.insert(name.to_string(), Arc::clone(&cache));
        Ok(cache)
    }

    pub fn find(&self, name: &str) -> Option<Arc<Cache>> {
        self.by_name.lock().expect("cache registry lock poisoned").get(name).cloned()
    }

    /// Remove `name` from the table so its `Cache` can be destroyed. No-op
    /// if it was already removed or never registered.
    pub fn remove(&self, name: &str) -> Option<Arc<Cache>> {
        self.by_name.lock().expect("cache registry lock poisoned").remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.by_name.lock().expect("cache registry lock poisoned").keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::SystemAllocator;
    use crate::page::PageSupplier;
    use crate::ptrmap::PointerCacheMap;

    fn supplier_and_map() -> (Arc<PageSupplier>, Arc<PointerCacheMap>) {
        let supplier = Arc::new(PageSupplier::new(65536, Box::new(SystemAllocator)).unwrap());
        let map = Arc::new(PointerCacheMap::new(65536));
        (supplier, map)
    }

    #[test]
    fn duplicate_create_returns_the_existing_cache() {
        let registry = Registry::new();
        let (supplier, map) = supplier_and_map();
        let first = registry
            .get_or_create("widgets", || Cache::new("widgets", 64, 65536, Arc::clone(&supplier), Arc::clone(&map), u64::MAX))
            .unwrap();
        let second = registry
            .get_or_create("widgets", || Cache::new("widgets", 999, 65536, Arc::clone(&supplier), Arc::clone(&map), u64::MAX))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.obj_size(), 64, "the first registration wins");
    }

    #[test]
    fn remove_then_create_makes_a_fresh_cache() {
        let registry = Registry::new();
        let (supplier, map) = supplier_and_map();
        let first = registry
            .get_or_create("widgets", || Cache::new("widgets", 64, 65536, Arc::clone(&supplier), Arc::clone(&map), u64::MAX))
            .unwrap();
        registry.remove("widgets");
        let second = registry
            .get_or_create("widgets", || Cache::new("widgets", 128, 65536, Arc::clone(&supplier), Arc::clone(&map), u64::MAX))
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.obj_size(), 128);
    }

    #[test]
    fn find_misses_on_unknown_name() {
        let registry = Registry::new();
        assert!(registry.find("nope").is_none());
    }
}

//! The per-cache magazine layer: a small bounded stack of already-freed
//! object pointers that lets the common allocate/free path avoid touching
//! the slab lists (and their lock) at all.
//!
//! Grounded on `examples/original_source/imembase.h`'s `IMEMLRU` (`avail`,
//! `limit`, `batchcount`, a mutex, and a fixed-size pointer array), renamed
//! to the term the design notes use throughout ("magazine").

use std::ptr::NonNull;
use std::sync::Mutex;

/// Hard upper bound on a magazine's `limit`, matching the fixed-size
/// backing array in the original (`IMCACHE_ARRAYLIMIT`).
pub const MAGAZINE_ARRAY_LIMIT: usize = 64;

/// Number of magazines a cache keeps, indexed by a round-robin counter.
/// The design notes treat thread-affinity here as an optimization only;
/// we pick plain round-robin (option (b)) since it needs no thread-local
/// state.
pub const MAGAZINE_COUNT: usize = 4;

struct MagazineInner {
    entries: Vec<NonNull<u8>>,
    limit: usize,
    batchcount: usize,
}

/// A single magazine: bounded stack, own lock.
pub struct Magazine {
    inner: Mutex<MagazineInner>,
}

impl Magazine {
    pub fn new(limit: usize, batchcount: usize) -> Self {
        let limit = limit.min(MAGAZINE_ARRAY_LIMIT);
        Self {
            inner: Mutex::new(MagazineInner {
                entries: Vec::with_capacity(limit),
                limit,
                batchcount: batchcount.min(limit),
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.inner.lock().expect("magazine lock poisoned").limit
    }

    pub fn batchcount(&self) -> usize {
        self.inner.lock().expect("magazine lock poisoned").batchcount
    }

    pub fn avail(&self) -> usize {
        self.inner.lock().expect("magazine lock poisoned").entries.len()
    }

    /// Fast-path allocation: pop one cached object. `None` on a miss,
    /// which the caller must treat as "go refill from the slab lists".
    pub fn pop(&self) -> Option<NonNull<u8>> {
        self.inner.lock().expect("magazine lock poisoned").entries.pop()
    }

    /// Fast-path free: push one object back. Returns `Err(ptr)` if the
    /// magazine is already full, so the caller can drain it to the slab
    /// lists instead.
    pub fn push(&self, ptr: NonNull<u8>) -> Result<(), NonNull<u8>> {
        let mut inner = self.inner.lock().expect("magazine lock poisoned");
        if inner.entries.len() >= inner.limit {
            return Err(ptr);
        }
        inner.entries.push(ptr);
        Ok(())
    }

    /// Push a freshly-refilled batch in one locked section.
    pub fn fill(&self, batch: Vec<NonNull<u8>>) {
        let mut inner = self.inner.lock().expect("magazine lock poisoned");
        debug_assert!(inner.entries.len() + batch.len() <= inner.limit);
        inner.entries.extend(batch);
    }

    /// Drain up to `batchcount` objects back out, for returning to the
    /// slab lists when a push finds the magazine full.
    pub fn drain_batch(&self) -> Vec<NonNull<u8>> {
        let mut inner = self.inner.lock().expect("magazine lock poisoned");
        let n = inner.batchcount.min(inner.entries.len());
        inner.entries.split_off(inner.entries.len() - n)
    }

    /// Drain every cached object, not just one `batchcount` batch. Used by
    /// cache-wide reaping (`Cache::shrink`), which wants every object a
    /// magazine is holding back on the slab lists before it looks at which
    /// slabs are free to release.
    pub fn drain_all(&self) -> Vec<NonNull<u8>> {
        let mut inner = self.inner.lock().expect("magazine lock poisoned");
        std::mem::take(&mut inner.entries)
    }
}

// SAFETY: the pointers held here are plain object addresses; all access
// goes through `inner`'s mutex, so there's no data race regardless of
// which thread happens to hold the `Magazine`.
unsafe impl Send for Magazine {}
unsafe impl Sync for Magazine {}

#[cfg(test)]
mod tests {
    use super::*;

    fn ptr(addr: usize) -> NonNull<u8> {
        NonNull::new(addr as *mut u8).unwrap()
    }

    #[test]
    fn push_pop_round_trip() {
        let mag = Magazine::new(4, 2);
        assert!(mag.push(ptr(0x1000)).is_ok());
        assert_eq!(mag.avail(), 1);
        assert_eq!(mag.pop(), Some(ptr(0x1000)));
        assert_eq!(mag.pop(), None);
    }

    #[test]
    fn push_fails_once_full() {
        let mag = Magazine::new(2, 1);
        assert!(mag.push(ptr(0x1000)).is_ok());
        assert!(mag.push(ptr(0x2000)).is_ok());
        assert_eq!(mag.push(ptr(0x3000)), Err(ptr(0x3000)));
    }

    #[test]
    fn drain_batch_respects_batchcount() {
        let mag = Magazine::new(8, 3);
        for i in 0..8 {
            mag.push(ptr(0x1000 + i * 0x10)).unwrap();
        }
        let batch = mag.drain_batch();
        assert_eq!(batch.len(), 3);
        assert_eq!(mag.avail(), 5);
    }

    #[test]
    fn limit_is_clamped_to_array_limit() {
        let mag = Magazine::new(1000, 1000);
        assert_eq!(mag.limit(), MAGAZINE_ARRAY_LIMIT);
    }
}

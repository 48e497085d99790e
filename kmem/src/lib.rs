//! A Bonwick-style slab allocator and `kmem` size-class multiplexer for
//! user space.
//!
//! Leaves-first, matching the way the modules build on one another:
//! [`allocator`] is the raw byte source; [`page`] turns that into
//! page-aligned wholesale regions; [`slab`] carves a page into fixed-size
//! objects; [`magazine`] gives each [`cache::Cache`] a lock-light fast
//! path on top of its slabs; [`ptrmap`] recovers a pointer's owning cache
//! in O(1); and [`facade`] ties a fixed size-class array plus a
//! named-cache registry into the `malloc`/`realloc`/`free` surface most
//! callers want.

pub mod allocator;
pub mod cache;
pub mod error;
pub mod facade;
pub mod magazine;
pub mod page;
pub mod ptrmap;
pub mod registry;
pub mod slab;

#[cfg(feature = "global-allocator")]
pub mod global_alloc;

pub use cache::Cache;
pub use error::{Error, Result};
pub use facade::{CacheHandle, CacheStats, Kmem, KmemConfig};

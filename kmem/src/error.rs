//! Error taxonomy for the allocator, matching the kinds a caller can act on
//! rather than the shape of any particular internal failure.

use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

/// Everything that can go wrong calling into `kmem`.
///
/// Variants mirror the kinds named in the design, not the specific code
/// path that raised them: two different internal checks that both mean
/// "this size doesn't fit anywhere" both surface as
/// [`Error::InvalidArgument`].
#[derive(Debug, Error)]
pub enum Error {
    /// The page supplier or the allocator backing it returned nothing.
    #[error("out of memory")]
    OutOfMemory,

    /// A cache (or the whole allocator) can't be torn down while objects
    /// are still outstanding.
    #[error("busy: outstanding allocations exist")]
    Busy,

    /// A size, alignment, or name is outside what the allocator supports.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A named cache lookup missed.
    #[error("cache not found")]
    NotFound,

    /// `cache_create` was asked to enforce name uniqueness and the name
    /// is already registered.
    #[error("cache already exists")]
    AlreadyExists,

    /// The facade was used before `init`, or `init` ran twice.
    #[error("allocator not initialized")]
    Uninitialized,

    #[error("allocator already initialized")]
    AlreadyInitialized,
}

//! Slab object allocator built on buddy page runs.
//!
//! Layout:
//! - [`layout`]: per-cache geometry (cell size, gfp order, colouring),
//! - [`slab`]: one slab's bookkeeping (intrusive u16 free list),
//! - [`cache`]: an object cache with per-CPU arrays and slab lists,
//! - [`registry`]: named caches plus the general size-class table.

pub mod cache;
pub mod layout;
pub mod registry;
pub mod slab;

pub use cache::{Cache, CacheStats, ObjectCtor};
pub use layout::CacheLayout;
pub use registry::{CacheRef, CacheRegistry};
pub use slab::Slab;

use crate::{AllocPolicy, AllocResult};

bitflags::bitflags! {
    /// Cache creation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CacheFlags: u32 {
        /// Bracket each object with guard words, checked on both transitions.
        const RED_ZONE = 1 << 0;
        /// Fill free objects with a known pattern, verified on allocation.
        /// Incompatible with a constructor.
        const POISON = 1 << 1;
    }
}

/// Page-run provider for slab growth. Implemented by the buddy front-end;
/// the annotation calls maintain the page-descriptor back-pointers that make
/// object-to-cache resolution O(1).
pub trait SlabPageSource: Send + Sync {
    /// Allocate a `2^order` run for a new slab.
    fn alloc_slab_pages(&self, order: usize, policy: AllocPolicy) -> AllocResult<usize>;

    /// Return a slab's run. The provider clears the slab annotation.
    fn free_slab_pages(&self, addr: usize, order: usize) -> AllocResult;

    /// Stamp every page of the run with the owning `(cache, slab)` pair.
    fn annotate_slab(&self, addr: usize, order: usize, cache: u32, slab: u32) -> AllocResult;

    /// Resolve the `(cache, slab)` pair owning the page containing `addr`.
    fn slab_owner(&self, addr: usize) -> Option<(u32, u32)>;
}

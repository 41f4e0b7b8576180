//! Zoned physical-memory allocator stack.
//!
//! Two cooperating layers:
//! - a zoned buddy page allocator: power-of-two page-run allocation with
//!   per-zone free lists, per-CPU hot/cold page stashes and watermark-based
//!   admission control,
//! - a slab object allocator built on page runs from the buddy layer, with
//!   per-CPU object arrays, slab colouring and optional debug decorators.
//!
//! Both layers are owned by an explicit [`MemorySystem`] context seeded once
//! from the bootstrap collaborator's memory banks. Reclaim is an injected
//! [`ReclaimHook`]; this crate never blocks while holding one of its locks.

#![no_std]

extern crate alloc;

// Logging support - conditionally import log crate
#[cfg(feature = "log")]
extern crate log;

// Stub macros when log is disabled - these become no-ops
#[cfg(not(feature = "log"))]
macro_rules! error {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! info {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

/// Size of one physical page.
pub const PAGE_SIZE: usize = 0x1000;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: usize = 12;

/// Number of buddy orders. The largest run is `2^(MAX_ORDER - 1)` pages.
pub const MAX_ORDER: usize = 11;

/// The error type used for allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Invalid size, alignment, order, CPU id or policy combination.
    InvalidParam,
    /// A memory bank overlapped with an already-registered zone.
    MemoryOverlap,
    /// No free run or object available after all escalation steps.
    NoMemory,
    /// Freeing an address this allocator does not own.
    NotAllocated,
    /// Destroying a cache that still has outstanding objects.
    Busy,
}

/// A [`Result`] type with [`AllocError`] as the error type.
pub type AllocResult<T = ()> = Result<T, AllocError>;

bitflags::bitflags! {
    /// Caller-supplied allocation policy.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocPolicy: u32 {
        /// The caller may sleep; enables the synchronous-reclaim escalation.
        const WAIT = 1 << 0;
        /// Atomic/interrupt-context caller; the watermark is halved for it.
        /// Mutually exclusive with `WAIT`.
        const HIGH = 1 << 1;
        /// May dig a further quarter into the watermark reserve.
        const HARDER = 1 << 2;
        /// Privileged caller: the emergency pass ignores watermarks.
        const EMERGENCY = 1 << 3;
        /// Give up after the first reclaim attempt.
        const NO_RETRY = 1 << 4;
        /// Keep retrying while reclaim makes progress.
        const NO_FAIL = 1 << 5;
        /// Prefer the cold per-CPU page stash (data not expected in cache).
        const COLD = 1 << 6;
        /// The caller can use high-memory zones.
        const HIGHMEM = 1 << 7;
    }
}

impl AllocPolicy {
    /// Ordinary kernel allocation: may block and reclaim.
    pub const NORMAL: AllocPolicy = AllocPolicy::WAIT;
    /// Interrupt-context allocation: never blocks, digs into reserves.
    pub const ATOMIC: AllocPolicy = AllocPolicy::HIGH;
    /// Memory-dying caller: bypass watermarks entirely.
    pub const EMERGENCY_RESERVE: AllocPolicy = AllocPolicy::EMERGENCY;
}

/// External reclaim collaborator (background scanner plus the synchronous
/// direct-reclaim entry point). Both calls are made with no allocator locks
/// held.
pub trait ReclaimHook: Send + Sync {
    /// Watermark breached in `zone_id` while searching for a `2^order` run;
    /// wake the background reclaimer for that zone.
    fn wake_reclaimer(&self, zone_id: usize, order: usize);

    /// Synchronous reclaim pass on behalf of a blocked caller. Returns the
    /// number of pages freed back to the allocator.
    fn try_to_free_pages(&self, policy: AllocPolicy) -> usize;
}

#[inline]
pub(crate) const fn align_up(pos: usize, align: usize) -> usize {
    (pos + align - 1) & !(align - 1)
}

#[inline]
pub(crate) const fn align_down(pos: usize, align: usize) -> usize {
    pos & !(align - 1)
}

/// Checks whether the address has the demanded alignment.
///
/// Equivalent to `addr % align == 0`, but the alignment must be a power of two.
#[inline]
pub(crate) const fn is_aligned(base_addr: usize, align: usize) -> bool {
    base_addr & (align - 1) == 0
}

pub mod buddy;
pub use buddy::{BuddyAllocator, MemoryBank, Watermarks, Zone, ZoneClass, ZoneStats};

pub mod slab;
pub use slab::{CacheFlags, CacheRef, CacheStats, ObjectCtor, SlabPageSource};

pub mod system;
pub use system::MemorySystem;

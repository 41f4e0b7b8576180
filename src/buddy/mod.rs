//! Zoned buddy page allocator.
//!
//! Layout:
//! - [`page`]: per-page descriptors (state tag, flags, biased refcount),
//! - [`free_area`]: one doubly linked free list per order,
//! - [`percpu`]: per-CPU hot/cold page stashes,
//! - [`zone`]: a contiguous bank with its free lists and watermarks,
//! - [`allocator`]: the multi-zone front-end with the escalation ladder,
//! - [`stats`]: introspection snapshots and failure reporting.

pub mod allocator;
pub mod free_area;
pub mod page;
pub mod percpu;
pub mod stats;
pub mod zone;

pub use allocator::BuddyAllocator;
pub use free_area::FreeArea;
pub use page::{PageDescriptor, PageFlags, PageState};
pub use stats::{MemoryStatsReporter, ZoneStats};
pub use zone::{MemoryBank, Watermarks, Zone, ZoneClass};

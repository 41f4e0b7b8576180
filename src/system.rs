//! The process-wide memory system: buddy zones plus the cache registry
//! behind one explicit context object.

use alloc::string::String;
use alloc::vec::Vec;

use kspin::SpinNoIrq;

#[cfg(feature = "log")]
use log::info;

use crate::buddy::{BuddyAllocator, MemoryBank, ZoneStats};
use crate::slab::cache::{CacheStats, ObjectCtor};
use crate::slab::registry::CacheRegistry;
use crate::slab::{CacheFlags, CacheRef};
use crate::{AllocError, AllocPolicy, AllocResult, ReclaimHook, PAGE_SIZE};

/// Largest size served by the general caches; bigger requests fall back to
/// raw page runs.
const MAX_CLASS_SIZE: usize = 131072;

/// Retry cap for the front door's own reclaim loop around cache operations.
const MAX_RECLAIM_RETRIES: usize = 3;

/// Owner of both allocator layers.
///
/// Created once with the CPU count, seeded once with the bootstrap memory
/// banks, then shared immutably. Every lock in the system lives below this
/// struct, so callers never see a blocking call made while one is held: the
/// slab path is entered with `WAIT` stripped, and the reclaim retry loop
/// here runs lock-free between attempts.
pub struct MemorySystem {
    buddy: BuddyAllocator,
    registry: SpinNoIrq<CacheRegistry>,
    reclaim: Option<&'static dyn ReclaimHook>,
    initialized: bool,
}

impl MemorySystem {
    pub fn new(num_cpus: usize) -> Self {
        let num_cpus = num_cpus.max(1);
        Self {
            buddy: BuddyAllocator::new(num_cpus),
            registry: SpinNoIrq::new(CacheRegistry::new(num_cpus)),
            reclaim: None,
            initialized: false,
        }
    }

    /// Seed the zones from the bootstrap collaborator's bank list and create
    /// the general size-class caches. Callable once.
    pub fn init(&mut self, banks: &[MemoryBank]) -> AllocResult {
        if self.initialized || banks.is_empty() {
            return Err(AllocError::InvalidParam);
        }
        for bank in banks {
            self.buddy.add_zone(*bank)?;
        }
        self.registry.lock().create_general_caches()?;
        self.initialized = true;
        info!(
            "memory system up: {} zones, {} pages free",
            self.buddy.zone_count(),
            self.buddy.free_page_total()
        );
        Ok(())
    }

    /// Wire in the reclaim collaborator for both layers.
    pub fn set_reclaim_hook(&mut self, hook: &'static dyn ReclaimHook) {
        self.reclaim = Some(hook);
        self.buddy.set_reclaim_hook(hook);
    }

    pub fn num_cpus(&self) -> usize {
        self.buddy.num_cpus()
    }

    pub fn buddy(&self) -> &BuddyAllocator {
        &self.buddy
    }

    // ---- page interface ---------------------------------------------------

    pub fn allocate_pages(&self, order: usize, policy: AllocPolicy, cpu: usize) -> AllocResult<usize> {
        self.buddy.allocate_pages(order, policy, cpu)
    }

    pub fn free_pages(&self, addr: usize, order: usize, policy: AllocPolicy, cpu: usize) -> AllocResult {
        self.buddy.free_pages(addr, order, policy, cpu)
    }

    // ---- object interface -------------------------------------------------

    pub fn create_cache(
        &self,
        name: &str,
        size: usize,
        align: usize,
        flags: CacheFlags,
        ctor: Option<ObjectCtor>,
        dtor: Option<ObjectCtor>,
    ) -> AllocResult<CacheRef> {
        self.registry
            .lock()
            .create(String::from(name), size, align, flags, ctor, dtor)
    }

    /// Allocate one object from `cache`.
    ///
    /// The cache itself never sleeps: growth runs with `WAIT` stripped, and
    /// on exhaustion this method drops every lock, asks the reclaim hook for
    /// pages, and retries.
    pub fn cache_allocate(
        &self,
        cache: &CacheRef,
        policy: AllocPolicy,
        cpu: usize,
    ) -> AllocResult<usize> {
        if policy.contains(AllocPolicy::WAIT) && policy.contains(AllocPolicy::HIGH) {
            return Err(AllocError::InvalidParam);
        }
        // Slab bookkeeping is walked through direct addresses, so slabs
        // never live in high memory.
        let inner = policy - AllocPolicy::WAIT - AllocPolicy::HIGHMEM;

        match cache.lock().alloc(&self.buddy, inner, cpu) {
            Ok(obj) => return Ok(obj),
            Err(AllocError::NoMemory) => {}
            Err(e) => return Err(e),
        }

        if policy.contains(AllocPolicy::WAIT) {
            if let Some(hook) = self.reclaim {
                let mut attempts = 0;
                loop {
                    let freed = hook.try_to_free_pages(policy);
                    attempts += 1;
                    match cache.lock().alloc(&self.buddy, inner, cpu) {
                        Ok(obj) => return Ok(obj),
                        Err(AllocError::NoMemory) => {}
                        Err(e) => return Err(e),
                    }
                    if policy.contains(AllocPolicy::NO_RETRY) || freed == 0 {
                        break;
                    }
                    if attempts >= MAX_RECLAIM_RETRIES && !policy.contains(AllocPolicy::NO_FAIL) {
                        break;
                    }
                }
            }
        }
        Err(AllocError::NoMemory)
    }

    pub fn cache_free(&self, cache: &CacheRef, ptr: usize, cpu: usize) -> AllocResult {
        cache.lock().free(&self.buddy, ptr, cpu)
    }

    /// Fails `Busy` while objects are outstanding.
    pub fn destroy_cache(&self, cache: &CacheRef) -> AllocResult {
        self.registry.lock().destroy(cache, &self.buddy)
    }

    /// Release every freeable page of `cache`; returns the slabs still
    /// holding objects.
    pub fn shrink_cache(&self, cache: &CacheRef) -> AllocResult<usize> {
        cache.lock().shrink(&self.buddy)
    }

    // ---- byte convenience interface ---------------------------------------

    /// Size-class routed allocation; above the largest class this falls back
    /// to a raw page run.
    pub fn allocate_bytes(&self, size: usize, policy: AllocPolicy, cpu: usize) -> AllocResult<usize> {
        if size == 0 {
            return Err(AllocError::InvalidParam);
        }
        if size > MAX_CLASS_SIZE {
            return self.allocate_pages(order_for_bytes(size)?, policy, cpu);
        }
        let cache = match self.registry.lock().class_for(size) {
            Some(c) => c.clone(),
            None => return Err(AllocError::InvalidParam),
        };
        self.cache_allocate(&cache, policy, cpu)
    }

    /// Free a byte allocation. `size` must be the size it was requested with.
    pub fn free_bytes(&self, ptr: usize, size: usize, cpu: usize) -> AllocResult {
        if size == 0 {
            return Err(AllocError::InvalidParam);
        }
        if size > MAX_CLASS_SIZE {
            return self.free_pages(ptr, order_for_bytes(size)?, AllocPolicy::empty(), cpu);
        }
        let cache = match self.registry.lock().class_for(size) {
            Some(c) => c.clone(),
            None => return Err(AllocError::InvalidParam),
        };
        self.cache_free(&cache, ptr, cpu)
    }

    // ---- housekeeping and diagnostics -------------------------------------

    /// One periodic housekeeping pass over at most `budget` caches.
    pub fn reap(&self, budget: usize) -> AllocResult<usize> {
        self.registry.lock().reap(&self.buddy, budget)
    }

    /// Flush one CPU's object arrays and page stashes (offline path).
    pub fn drain_cpu(&self, cpu: usize) -> AllocResult {
        self.registry.lock().drain_cpu(&self.buddy, cpu)?;
        self.buddy.drain_cpu(cpu)
    }

    pub fn zone_stats(&self) -> Vec<ZoneStats> {
        self.buddy.zone_stats()
    }

    pub fn cache_stats(&self) -> Vec<CacheStats> {
        self.registry.lock().stats()
    }
}

/// Smallest order whose run holds `size` bytes. Sizes beyond the largest
/// run are rejected rather than rounded down: a short run would let the
/// caller scribble past pages it owns.
fn order_for_bytes(size: usize) -> AllocResult<usize> {
    if size > PAGE_SIZE << (crate::MAX_ORDER - 1) {
        return Err(AllocError::InvalidParam);
    }
    let pages = size.div_ceil(PAGE_SIZE);
    Ok(pages.next_power_of_two().trailing_zeros() as usize)
}

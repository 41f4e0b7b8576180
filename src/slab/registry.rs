//! Cache registry: named caches, the general size-class table, and the
//! periodic reap cursor.

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use kspin::SpinNoIrq;

#[cfg(feature = "log")]
use log::info;

use crate::{AllocError, AllocResult};

use super::cache::{Cache, ObjectCtor};
use super::{CacheFlags, SlabPageSource};

/// General-purpose size classes. Requests above the last class fall back to
/// raw page runs.
pub(crate) const SIZE_CLASSES: [usize; 13] = [
    32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768, 65536, 131072,
];

/// Shared handle to one cache. Cloning is cheap; the cache itself lives
/// behind the lock until the registry drops its last reference.
#[derive(Clone)]
pub struct CacheRef(Arc<SpinNoIrq<Cache>>);

impl CacheRef {
    fn new(cache: Cache) -> Self {
        Self(Arc::new(SpinNoIrq::new(cache)))
    }

    pub fn lock(&self) -> kspin::SpinNoIrqGuard<'_, Cache> {
        self.0.lock()
    }

    fn ptr_eq(&self, other: &CacheRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// All caches known to the system.
pub struct CacheRegistry {
    caches: Vec<CacheRef>,
    size_classes: Vec<(usize, CacheRef)>,
    num_cpus: usize,
    next_id: u32,
    reap_cursor: usize,
}

impl CacheRegistry {
    pub fn new(num_cpus: usize) -> Self {
        Self {
            caches: Vec::new(),
            size_classes: Vec::new(),
            num_cpus: num_cpus.max(1),
            next_id: 0,
            reap_cursor: 0,
        }
    }

    /// Create and register a cache.
    pub fn create(
        &mut self,
        name: String,
        size: usize,
        align: usize,
        flags: CacheFlags,
        ctor: Option<ObjectCtor>,
        dtor: Option<ObjectCtor>,
    ) -> AllocResult<CacheRef> {
        let id = self.next_id;
        let cache = Cache::new(id, name, size, align, flags, ctor, dtor, self.num_cpus)?;
        self.next_id += 1;
        let cref = CacheRef::new(cache);
        self.caches.push(cref.clone());
        Ok(cref)
    }

    /// Seed one cache per general size class.
    pub fn create_general_caches(&mut self) -> AllocResult {
        for &size in SIZE_CLASSES.iter() {
            let cref = self.create(
                format!("size-{}", size),
                size,
                0,
                CacheFlags::empty(),
                None,
                None,
            )?;
            self.size_classes.push((size, cref));
        }
        info!("registered {} general size-class caches", SIZE_CLASSES.len());
        Ok(())
    }

    /// Smallest general cache fitting `size`, if any.
    pub fn class_for(&self, size: usize) -> Option<&CacheRef> {
        self.size_classes
            .iter()
            .find(|&&(class, _)| size <= class)
            .map(|(_, cref)| cref)
    }

    /// Tear a cache down and unregister it.
    pub fn destroy(&mut self, cache: &CacheRef, source: &dyn SlabPageSource) -> AllocResult {
        let pos = self
            .caches
            .iter()
            .position(|c| c.ptr_eq(cache))
            .ok_or(AllocError::NotAllocated)?;
        cache.lock().destroy(source)?;
        self.caches.swap_remove(pos);
        Ok(())
    }

    /// Reap up to `budget` caches, resuming where the last pass stopped.
    /// Returns pages released.
    pub fn reap(&mut self, source: &dyn SlabPageSource, budget: usize) -> AllocResult<usize> {
        if self.caches.is_empty() {
            return Ok(0);
        }
        let mut pages = 0;
        for _ in 0..budget.min(self.caches.len()) {
            self.reap_cursor %= self.caches.len();
            let cref = self.caches[self.reap_cursor].clone();
            self.reap_cursor += 1;
            pages += cref.lock().reap(source)?;
        }
        Ok(pages)
    }

    /// Flush one CPU's object array in every cache.
    pub fn drain_cpu(&self, source: &dyn SlabPageSource, cpu: usize) -> AllocResult {
        for cref in &self.caches {
            cref.lock().drain_cpu(source, cpu)?;
        }
        Ok(())
    }

    pub fn cache_count(&self) -> usize {
        self.caches.len()
    }

    pub fn stats(&self) -> Vec<super::cache::CacheStats> {
        self.caches.iter().map(|c| c.lock().stats()).collect()
    }
}

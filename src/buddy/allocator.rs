//! Multi-zone buddy allocator front-end.
//!
//! Owns every zone behind its own lock, orders candidate zones by
//! allocation policy, and drives the watermark-check / allocate /
//! reclaim-retry escalation ladder.

use alloc::vec::Vec;

use kspin::SpinNoIrq;

use crate::slab::SlabPageSource;
use crate::{AllocError, AllocPolicy, AllocResult, ReclaimHook, MAX_ORDER, PAGE_SIZE};

#[cfg(feature = "log")]
use log::{debug, error, warn};

use super::stats::{MemoryStatsReporter, ZoneStats};
use super::zone::{MemoryBank, Zone, ZoneClass};

/// Bounded retry count for the synchronous-reclaim escalation. `NO_FAIL`
/// callers may go past it while reclaim keeps making progress.
const MAX_RECLAIM_RETRIES: usize = 3;

struct ZoneExtent {
    base: usize,
    end: usize,
    class: ZoneClass,
}

/// Zoned buddy page allocator.
///
/// Zones are registered once at initialization; afterwards every method
/// works through `&self`, taking each zone's lock only for the span of one
/// buddy operation.
pub struct BuddyAllocator {
    zones: Vec<SpinNoIrq<Zone>>,
    extents: Vec<ZoneExtent>,
    num_cpus: usize,
    reclaim: Option<&'static dyn ReclaimHook>,
}

impl BuddyAllocator {
    pub fn new(num_cpus: usize) -> Self {
        Self {
            zones: Vec::new(),
            extents: Vec::new(),
            num_cpus: num_cpus.max(1),
            reclaim: None,
        }
    }

    pub fn num_cpus(&self) -> usize {
        self.num_cpus
    }

    /// Wire in the reclaim collaborator.
    pub fn set_reclaim_hook(&mut self, hook: &'static dyn ReclaimHook) {
        self.reclaim = Some(hook);
    }

    /// Register one memory bank as a new zone and seed its free lists.
    pub fn add_zone(&mut self, bank: MemoryBank) -> AllocResult<usize> {
        let aligned_base = crate::align_up(bank.base, PAGE_SIZE);
        let aligned_end = crate::align_down(bank.base + bank.size, PAGE_SIZE);
        if aligned_end <= aligned_base || aligned_end - aligned_base < PAGE_SIZE {
            warn!(
                "buddy allocator: bank [{:#x}, {:#x}) too small, skipping",
                bank.base,
                bank.base + bank.size
            );
            return Err(AllocError::InvalidParam);
        }

        for (i, ext) in self.extents.iter().enumerate() {
            if !(aligned_end <= ext.base || aligned_base >= ext.end) {
                error!(
                    "buddy allocator: bank [{:#x}, {:#x}) overlaps zone {} [{:#x}, {:#x})",
                    aligned_base, aligned_end, i, ext.base, ext.end
                );
                return Err(AllocError::MemoryOverlap);
            }
        }

        let zone_id = self.zones.len();
        let zone = Zone::new(
            zone_id,
            bank.class,
            aligned_base,
            aligned_end - aligned_base,
            self.num_cpus,
        )?;
        self.zones.push(SpinNoIrq::new(zone));
        self.extents.push(ZoneExtent {
            base: aligned_base,
            end: aligned_end,
            class: bank.class,
        });
        Ok(zone_id)
    }

    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }

    /// Direct access to one zone's lock (watermark tuning, introspection).
    pub fn zone(&self, zone_id: usize) -> Option<&SpinNoIrq<Zone>> {
        self.zones.get(zone_id)
    }

    /// Candidate zone ids in allocation-priority order for `policy`.
    fn zonelist(&self, policy: AllocPolicy) -> Vec<usize> {
        let mut list = Vec::with_capacity(self.zones.len());
        if policy.contains(AllocPolicy::HIGHMEM) {
            for (i, ext) in self.extents.iter().enumerate() {
                if ext.class == ZoneClass::HighMem {
                    list.push(i);
                }
            }
        }
        for (i, ext) in self.extents.iter().enumerate() {
            if ext.class == ZoneClass::Normal {
                list.push(i);
            }
        }
        list
    }

    fn rmqueue(zone: &mut Zone, order: usize, policy: AllocPolicy, cpu: usize) -> AllocResult<usize> {
        if order == 0 {
            zone.alloc_single(cpu, policy.contains(AllocPolicy::COLD))
        } else {
            zone.alloc_run(order)
        }
    }

    /// One pass over the zonelist at the given watermark.
    fn try_zones(
        &self,
        zonelist: &[usize],
        order: usize,
        policy: AllocPolicy,
        cpu: usize,
        mark_of: impl Fn(&Zone) -> usize,
    ) -> Option<usize> {
        for &idx in zonelist {
            let mut zone = self.zones[idx].lock();
            let mark = mark_of(&zone);
            if !zone.watermark_ok(order, mark, policy) {
                continue;
            }
            if let Ok(addr) = Self::rmqueue(&mut zone, order, policy, cpu) {
                return Some(addr);
            }
        }
        None
    }

    /// One pass ignoring watermarks entirely (emergency reserve).
    fn try_zones_unchecked(
        &self,
        zonelist: &[usize],
        order: usize,
        policy: AllocPolicy,
        cpu: usize,
    ) -> Option<usize> {
        for &idx in zonelist {
            let mut zone = self.zones[idx].lock();
            if let Ok(addr) = Self::rmqueue(&mut zone, order, policy, cpu) {
                return Some(addr);
            }
        }
        None
    }

    /// Allocate a `2^order` page run.
    ///
    /// Escalation: low watermark, wake reclaimers, min watermark with a
    /// relaxed threshold, emergency reserve for privileged callers, then a
    /// bounded synchronous-reclaim retry loop for callers that may block.
    pub fn allocate_pages(&self, order: usize, policy: AllocPolicy, cpu: usize) -> AllocResult<usize> {
        if order >= MAX_ORDER || cpu >= self.num_cpus {
            return Err(AllocError::InvalidParam);
        }
        if policy.contains(AllocPolicy::WAIT) && policy.contains(AllocPolicy::HIGH) {
            // Blocking from an atomic context is a programming error.
            return Err(AllocError::InvalidParam);
        }

        let zonelist = self.zonelist(policy);
        if zonelist.is_empty() {
            return Err(AllocError::NoMemory);
        }

        if let Some(addr) = self.try_zones(&zonelist, order, policy, cpu, |z| z.watermarks.low) {
            return Ok(addr);
        }

        if let Some(hook) = self.reclaim {
            for &idx in &zonelist {
                hook.wake_reclaimer(idx, order);
            }
        }

        let relaxed = policy | AllocPolicy::HARDER;
        if let Some(addr) = self.try_zones(&zonelist, order, relaxed, cpu, |z| z.watermarks.min) {
            return Ok(addr);
        }

        if policy.contains(AllocPolicy::EMERGENCY) {
            if let Some(addr) = self.try_zones_unchecked(&zonelist, order, policy, cpu) {
                return Ok(addr);
            }
        }

        if policy.contains(AllocPolicy::WAIT) {
            if let Some(hook) = self.reclaim {
                let mut attempts = 0;
                loop {
                    // All zone locks are free here; this call may block.
                    let freed = hook.try_to_free_pages(policy);
                    attempts += 1;
                    if let Some(addr) =
                        self.try_zones(&zonelist, order, relaxed, cpu, |z| z.watermarks.min)
                    {
                        return Ok(addr);
                    }
                    if policy.contains(AllocPolicy::NO_RETRY) {
                        break;
                    }
                    if freed == 0 {
                        if policy.contains(AllocPolicy::NO_FAIL) {
                            error!(
                                "buddy allocator: reclaim made no progress for a NO_FAIL caller"
                            );
                        }
                        break;
                    }
                    if attempts >= MAX_RECLAIM_RETRIES && !policy.contains(AllocPolicy::NO_FAIL) {
                        break;
                    }
                }
            }
        }

        debug!(
            "buddy allocator: order-{} allocation failed, policy {:?}",
            order, policy
        );
        MemoryStatsReporter::print_alloc_failure(&self.zone_stats(), order);
        Err(AllocError::NoMemory)
    }

    /// Free a `2^order` run previously returned by [`Self::allocate_pages`].
    /// [`AllocPolicy::COLD`] routes an order-0 page to the cold stash.
    pub fn free_pages(&self, addr: usize, order: usize, policy: AllocPolicy, cpu: usize) -> AllocResult {
        if order >= MAX_ORDER || cpu >= self.num_cpus {
            return Err(AllocError::InvalidParam);
        }
        let idx = self.zone_for_addr(addr).ok_or(AllocError::NotAllocated)?;
        let mut zone = self.zones[idx].lock();
        if order == 0 {
            zone.free_single(cpu, addr, policy.contains(AllocPolicy::COLD))
        } else {
            zone.free_run(addr, order)
        }
    }

    fn zone_for_addr(&self, addr: usize) -> Option<usize> {
        self.extents
            .iter()
            .position(|ext| addr >= ext.base && addr < ext.end)
    }

    /// Flush one CPU's page stashes in every zone.
    pub fn drain_cpu(&self, cpu: usize) -> AllocResult {
        for zone in &self.zones {
            zone.lock().drain_cpu(cpu)?;
        }
        Ok(())
    }

    /// Total free pages across all zones (per-CPU residents included).
    pub fn free_page_total(&self) -> usize {
        self.zones.iter().map(|z| z.lock().free_pages()).sum()
    }

    /// Snapshot every zone for introspection tooling.
    pub fn zone_stats(&self) -> Vec<ZoneStats> {
        self.zones.iter().map(|z| z.lock().stats()).collect()
    }
}

impl SlabPageSource for BuddyAllocator {
    fn alloc_slab_pages(&self, order: usize, policy: AllocPolicy) -> AllocResult<usize> {
        // Slab growth bypasses the per-CPU stashes: slab runs live long and
        // would only churn the hot lists.
        if order >= MAX_ORDER {
            return Err(AllocError::InvalidParam);
        }
        let zonelist = self.zonelist(policy);
        for &idx in &zonelist {
            let mut zone = self.zones[idx].lock();
            if !zone.watermark_ok(order, zone.watermarks.low, policy)
                && !policy.contains(AllocPolicy::EMERGENCY)
            {
                continue;
            }
            if let Ok(addr) = zone.alloc_run(order) {
                return Ok(addr);
            }
        }
        Err(AllocError::NoMemory)
    }

    fn free_slab_pages(&self, addr: usize, order: usize) -> AllocResult {
        let idx = self.zone_for_addr(addr).ok_or(AllocError::NotAllocated)?;
        self.zones[idx].lock().free_slab_run(addr, order)
    }

    fn annotate_slab(&self, addr: usize, order: usize, cache: u32, slab: u32) -> AllocResult {
        let idx = self.zone_for_addr(addr).ok_or(AllocError::NotAllocated)?;
        self.zones[idx].lock().set_slab_owner(addr, order, cache, slab)
    }

    fn slab_owner(&self, addr: usize) -> Option<(u32, u32)> {
        let idx = self.zone_for_addr(addr)?;
        self.zones[idx].lock().slab_owner(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::alloc::{alloc, dealloc};
    use core::alloc::Layout;

    const TEST_HEAP_SIZE: usize = 4 * 1024 * 1024;

    fn test_heap(size: usize) -> (*mut u8, Layout) {
        let layout = Layout::from_size_align(size, PAGE_SIZE).unwrap();
        let ptr = unsafe { alloc(layout) };
        assert!(!ptr.is_null());
        (ptr, layout)
    }

    fn test_allocator(heap: usize, size: usize) -> BuddyAllocator {
        let mut a = BuddyAllocator::new(1);
        a.add_zone(MemoryBank {
            base: heap,
            size,
            class: ZoneClass::Normal,
        })
        .unwrap();
        a
    }

    #[test]
    fn test_alloc_free_round_trip() {
        let (ptr, layout) = test_heap(TEST_HEAP_SIZE);
        let a = test_allocator(ptr as usize, TEST_HEAP_SIZE);

        let total = a.free_page_total();
        let run = a.allocate_pages(3, AllocPolicy::NORMAL, 0).unwrap();
        assert_eq!(a.free_page_total(), total - 8);
        a.free_pages(run, 3, AllocPolicy::empty(), 0).unwrap();
        assert_eq!(a.free_page_total(), total);

        unsafe { dealloc(ptr, layout) };
    }

    #[test]
    fn test_policy_violation_rejected() {
        let (ptr, layout) = test_heap(TEST_HEAP_SIZE);
        let a = test_allocator(ptr as usize, TEST_HEAP_SIZE);

        let bad = AllocPolicy::WAIT | AllocPolicy::HIGH;
        assert_eq!(a.allocate_pages(0, bad, 0), Err(AllocError::InvalidParam));
        assert_eq!(
            a.allocate_pages(MAX_ORDER, AllocPolicy::NORMAL, 0),
            Err(AllocError::InvalidParam)
        );
        assert_eq!(
            a.allocate_pages(0, AllocPolicy::NORMAL, 9),
            Err(AllocError::InvalidParam)
        );

        unsafe { dealloc(ptr, layout) };
    }

    #[test]
    fn test_overlapping_bank_rejected() {
        let (ptr, layout) = test_heap(TEST_HEAP_SIZE);
        let heap = ptr as usize;
        let mut a = BuddyAllocator::new(1);
        a.add_zone(MemoryBank {
            base: heap,
            size: TEST_HEAP_SIZE,
            class: ZoneClass::Normal,
        })
        .unwrap();
        assert_eq!(
            a.add_zone(MemoryBank {
                base: heap + PAGE_SIZE,
                size: PAGE_SIZE * 4,
                class: ZoneClass::Normal,
            }),
            Err(AllocError::MemoryOverlap)
        );

        unsafe { dealloc(ptr, layout) };
    }

    #[test]
    fn test_highmem_preference() {
        let (normal_ptr, normal_layout) = test_heap(TEST_HEAP_SIZE);
        let (high_ptr, high_layout) = test_heap(TEST_HEAP_SIZE);

        let mut a = BuddyAllocator::new(1);
        a.add_zone(MemoryBank {
            base: normal_ptr as usize,
            size: TEST_HEAP_SIZE,
            class: ZoneClass::Normal,
        })
        .unwrap();
        let high_id = a
            .add_zone(MemoryBank {
                base: high_ptr as usize,
                size: TEST_HEAP_SIZE,
                class: ZoneClass::HighMem,
            })
            .unwrap();

        // A highmem-capable request drains the high zone first.
        let addr = a
            .allocate_pages(2, AllocPolicy::NORMAL | AllocPolicy::HIGHMEM, 0)
            .unwrap();
        let high_base = a.zone(high_id).unwrap().lock().base_addr();
        assert!(addr >= high_base && addr < high_base + TEST_HEAP_SIZE);

        // A plain request never touches the high zone.
        let addr2 = a.allocate_pages(2, AllocPolicy::NORMAL, 0).unwrap();
        assert!(addr2 < high_base || addr2 >= high_base + TEST_HEAP_SIZE);

        a.free_pages(addr, 2, AllocPolicy::empty(), 0).unwrap();
        a.free_pages(addr2, 2, AllocPolicy::empty(), 0).unwrap();

        unsafe { dealloc(normal_ptr, normal_layout) };
        unsafe { dealloc(high_ptr, high_layout) };
    }
}

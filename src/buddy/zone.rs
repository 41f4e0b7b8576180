//! Single memory zone: buddy free lists, watermarks, per-CPU page stashes.
//!
//! All mutation of a zone happens under its owning lock in the front-end;
//! methods here take `&mut self` and assume that serialization.

use alloc::vec;
use alloc::vec::Vec;

use crate::{AllocError, AllocResult, AllocPolicy, MAX_ORDER, PAGE_SIZE};

#[cfg(feature = "log")]
use log::{error, warn};

use super::free_area::FreeArea;
use super::page::{PageDescriptor, PageFlags, PageState};
use super::percpu::PerCpuPages;
use super::stats::ZoneStats;

/// Allocation-priority class of a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneClass {
    /// Directly-mapped memory, usable by every caller.
    Normal,
    /// High memory, only for callers that asked for it.
    HighMem,
}

impl ZoneClass {
    pub fn name(&self) -> &'static str {
        match self {
            ZoneClass::Normal => "normal",
            ZoneClass::HighMem => "highmem",
        }
    }
}

/// One physical memory bank from the bootstrap collaborator.
#[derive(Debug, Clone, Copy)]
pub struct MemoryBank {
    pub base: usize,
    pub size: usize,
    pub class: ZoneClass,
}

/// Free-page admission thresholds, increasing: min <= low <= high.
#[derive(Debug, Clone, Copy)]
pub struct Watermarks {
    pub min: usize,
    pub low: usize,
    pub high: usize,
}

impl Watermarks {
    /// Default thresholds derived from the zone size.
    fn for_span(span_pages: usize) -> Self {
        let min = (span_pages / 128).clamp(8, 2048);
        Self {
            min,
            low: min + min / 4,
            high: min + min / 2,
        }
    }
}

/// A contiguous page-frame range managed by one buddy allocator instance.
pub struct Zone {
    id: usize,
    class: ZoneClass,
    base_addr: usize,
    span_pages: usize,
    pages: Vec<PageDescriptor>,
    free_areas: [FreeArea; MAX_ORDER],
    /// Pages currently sitting in the free areas (per-CPU residents excluded).
    area_free_pages: usize,
    pub watermarks: Watermarks,
    /// Pages kept back from this zone for lower-priority allocation classes.
    pub protection: usize,
    percpu: Vec<PerCpuPages>,
}

impl Zone {
    /// Build a zone over `[base_addr, base_addr + size)` and seed every page
    /// into the free lists. `base_addr` and `size` must be page-aligned.
    pub fn new(
        id: usize,
        class: ZoneClass,
        base_addr: usize,
        size: usize,
        num_cpus: usize,
    ) -> AllocResult<Self> {
        if size < PAGE_SIZE
            || !crate::is_aligned(base_addr, PAGE_SIZE)
            || !crate::is_aligned(size, PAGE_SIZE)
        {
            return Err(AllocError::InvalidParam);
        }

        let span_pages = size / PAGE_SIZE;
        let mut zone = Self {
            id,
            class,
            base_addr,
            span_pages,
            pages: vec![PageDescriptor::reserved(); span_pages],
            free_areas: [const { FreeArea::new() }; MAX_ORDER],
            area_free_pages: 0,
            watermarks: Watermarks::for_span(span_pages),
            protection: 0,
            percpu: (0..num_cpus.max(1))
                .map(|_| PerCpuPages::new(span_pages))
                .collect(),
        };

        // Seed by freeing each frame; coalescing rebuilds the large runs.
        for pfn in 0..span_pages {
            zone.pages[pfn].flags.remove(PageFlags::RESERVED);
            zone.pages[pfn].set_holders(1);
            let addr = zone.addr_of(pfn);
            zone.free_run(addr, 0)?;
        }
        Ok(zone)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn class(&self) -> ZoneClass {
        self.class
    }

    pub fn base_addr(&self) -> usize {
        self.base_addr
    }

    pub fn span_pages(&self) -> usize {
        self.span_pages
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base_addr && addr < self.base_addr + self.span_pages * PAGE_SIZE
    }

    fn pfn_of(&self, addr: usize) -> AllocResult<usize> {
        if !self.contains(addr) {
            return Err(AllocError::NotAllocated);
        }
        if !crate::is_aligned(addr, PAGE_SIZE) {
            return Err(AllocError::InvalidParam);
        }
        Ok((addr - self.base_addr) / PAGE_SIZE)
    }

    fn addr_of(&self, pfn: usize) -> usize {
        self.base_addr + pfn * PAGE_SIZE
    }

    /// Free pages tracked by this zone: free-area pages plus pages resident
    /// in the per-CPU stashes.
    pub fn free_pages(&self) -> usize {
        self.area_free_pages + self.percpu.iter().map(|p| p.resident()).sum::<usize>()
    }

    /// Number of free runs currently listed at `order`.
    pub fn free_run_count(&self, order: usize) -> usize {
        if order < MAX_ORDER {
            self.free_areas[order].count()
        } else {
            0
        }
    }

    /// Pages resident in one CPU's stashes.
    pub fn percpu_resident(&self, cpu: usize) -> usize {
        self.percpu.get(cpu).map_or(0, |p| p.resident())
    }

    /// Pop a `2^order` run, splitting a larger run if necessary. The whole
    /// split sequence runs under the caller's zone lock.
    pub fn alloc_run(&mut self, order: usize) -> AllocResult<usize> {
        if order >= MAX_ORDER {
            return Err(AllocError::InvalidParam);
        }

        let mut found = None;
        for o in order..MAX_ORDER {
            if let Some(pfn) = self.free_areas[o].pop_head(&mut self.pages) {
                found = Some((pfn as usize, o));
                break;
            }
        }
        let (pfn, mut cur) = found.ok_or(AllocError::NoMemory)?;

        // Halve until the requested order remains, parking each upper half.
        while cur > order {
            cur -= 1;
            let upper = pfn + (1 << cur);
            self.free_areas[cur].push_head(&mut self.pages, upper as u32, cur as u8);
        }

        for i in pfn..pfn + (1 << order) {
            let page = &mut self.pages[i];
            debug_assert!(page.is_free());
            page.state = PageState::Owned { private: 0 };
            page.set_holders(1);
        }
        self.area_free_pages -= 1 << order;
        Ok(self.addr_of(pfn))
    }

    /// Return a `2^order` run, merging with free buddies as far as possible.
    ///
    /// Panics on double free or when any page of the run is still
    /// slab-owned: both mean the free lists can no longer be trusted.
    pub fn free_run(&mut self, addr: usize, order: usize) -> AllocResult {
        if order >= MAX_ORDER {
            return Err(AllocError::InvalidParam);
        }
        let pfn = self.pfn_of(addr)?;
        if pfn & ((1 << order) - 1) != 0 || pfn + (1 << order) > self.span_pages {
            error!(
                "zone {}: run [{:#x}, order {}] not aligned to its order",
                self.id, addr, order
            );
            return Err(AllocError::InvalidParam);
        }

        for i in pfn..pfn + (1 << order) {
            let page = &self.pages[i];
            if page.is_free() || page.flags.contains(PageFlags::STASHED) {
                panic!(
                    "zone {}: double free of page {} in run [{:#x}, order {}]",
                    self.id, i, addr, order
                );
            }
            if page.flags.contains(PageFlags::SLAB) {
                panic!(
                    "zone {}: page {} freed while still slab-owned",
                    self.id, i
                );
            }
        }

        for i in pfn..pfn + (1 << order) {
            let page = &mut self.pages[i];
            page.state = PageState::FreeTail;
            page.set_holders(0);
            page.flags.remove(PageFlags::ACTIVE | PageFlags::DIRTY);
        }

        let mut pfn = pfn;
        let mut merged_order = order;
        while merged_order < MAX_ORDER - 1 {
            let buddy = pfn ^ (1 << merged_order);
            if buddy + (1 << merged_order) > self.span_pages {
                break;
            }
            if !self.pages[buddy].is_buddy_of_order(merged_order) {
                break;
            }
            self.free_areas[merged_order].remove(&mut self.pages, buddy as u32);
            pfn &= !(1 << merged_order);
            merged_order += 1;
        }

        self.free_areas[merged_order].push_head(&mut self.pages, pfn as u32, merged_order as u8);
        self.area_free_pages += 1 << order;
        Ok(())
    }

    /// Watermark admission check.
    ///
    /// Starts from the free-page count minus the pages this request would
    /// take, deducts the reserve protected for lower-priority classes, then
    /// walks the lower orders deducting pages that cannot service higher
    /// orders while relaxing the threshold.
    pub fn watermark_ok(&self, order: usize, mark: usize, policy: AllocPolicy) -> bool {
        let mut min = (mark + self.protection) as isize;
        let mut free = self.free_pages() as isize - ((1isize << order) - 1);

        if policy.contains(AllocPolicy::HIGH) {
            min -= min / 2;
        }
        if policy.contains(AllocPolicy::HARDER) {
            min -= min / 4;
        }

        if free <= min {
            return false;
        }
        for o in 0..order {
            free -= (self.free_areas[o].count() << o) as isize;
            min /= 2;
            if free <= min {
                return false;
            }
        }
        true
    }

    /// Order-0 fast path through the per-CPU stash, refilling a batch from
    /// the buddy lists on underflow.
    pub fn alloc_single(&mut self, cpu: usize, cold: bool) -> AllocResult<usize> {
        let stash = self.percpu.get(cpu).ok_or(AllocError::InvalidParam)?.stash(cold);
        let batch = stash.batch;

        if stash.is_empty() {
            let mut refill = Vec::with_capacity(batch);
            for _ in 0..batch {
                match self.alloc_run(0) {
                    Ok(addr) => refill.push(addr),
                    Err(_) => break,
                }
            }
            if refill.is_empty() {
                return Err(AllocError::NoMemory);
            }
            for addr in refill {
                let pfn = self.pfn_of(addr)?;
                self.pages[pfn].flags.insert(PageFlags::STASHED);
                self.percpu[cpu].stash_mut(cold).push(addr);
            }
        }

        let addr = self.percpu[cpu]
            .stash_mut(cold)
            .pop()
            .ok_or(AllocError::NoMemory)?;
        let pfn = self.pfn_of(addr)?;
        self.pages[pfn].flags.remove(PageFlags::STASHED);
        Ok(addr)
    }

    /// Order-0 free through the per-CPU stash, flushing a batch back to the
    /// buddy lists when the stash would overflow its high-water mark.
    pub fn free_single(&mut self, cpu: usize, addr: usize, cold: bool) -> AllocResult {
        let pfn = self.pfn_of(addr)?;
        if self.pages[pfn].is_free() || self.pages[pfn].flags.contains(PageFlags::STASHED) {
            panic!("zone {}: double free of page {} via per-CPU stash", self.id, pfn);
        }
        if self.percpu.get(cpu).is_none() {
            return Err(AllocError::InvalidParam);
        }

        let stash = self.percpu[cpu].stash(cold);
        if stash.len() >= stash.high {
            let batch = stash.batch;
            let mut drained = Vec::with_capacity(batch);
            let stash = self.percpu[cpu].stash_mut(cold);
            for _ in 0..batch {
                match stash.pop() {
                    Some(a) => drained.push(a),
                    None => break,
                }
            }
            for a in drained {
                let p = self.pfn_of(a)?;
                self.pages[p].flags.remove(PageFlags::STASHED);
                self.free_run(a, 0)?;
            }
        }

        self.pages[pfn].flags.insert(PageFlags::STASHED);
        self.percpu[cpu].stash_mut(cold).push(addr);
        Ok(())
    }

    /// Flush both stashes of one CPU back to the buddy lists.
    pub fn drain_cpu(&mut self, cpu: usize) -> AllocResult {
        if self.percpu.get(cpu).is_none() {
            return Err(AllocError::InvalidParam);
        }
        for cold in [false, true] {
            loop {
                let Some(addr) = self.percpu[cpu].stash_mut(cold).pop() else {
                    break;
                };
                let pfn = self.pfn_of(addr)?;
                self.pages[pfn].flags.remove(PageFlags::STASHED);
                self.free_run(addr, 0)?;
            }
        }
        Ok(())
    }

    /// Mark a caller-owned run as belonging to slab `slab` of cache `cache`.
    pub fn set_slab_owner(&mut self, addr: usize, order: usize, cache: u32, slab: u32) -> AllocResult {
        let pfn = self.pfn_of(addr)?;
        for i in pfn..pfn + (1 << order) {
            let page = &mut self.pages[i];
            if page.is_free() {
                panic!("zone {}: slab annotation of free page {}", self.id, i);
            }
            page.flags.insert(PageFlags::SLAB);
            page.state = PageState::Slab { cache, slab };
        }
        Ok(())
    }

    /// Resolve the slab back-pointers of an address, if it is slab-owned.
    pub fn slab_owner(&self, addr: usize) -> Option<(u32, u32)> {
        if !self.contains(addr) {
            return None;
        }
        let pfn = (addr - self.base_addr) / PAGE_SIZE;
        match self.pages[pfn].state {
            PageState::Slab { cache, slab } => Some((cache, slab)),
            _ => None,
        }
    }

    /// Strip slab ownership from a run and return it to the free lists.
    pub fn free_slab_run(&mut self, addr: usize, order: usize) -> AllocResult {
        let pfn = self.pfn_of(addr)?;
        for i in pfn..pfn + (1 << order) {
            let page = &mut self.pages[i];
            if !page.flags.contains(PageFlags::SLAB) {
                panic!(
                    "zone {}: slab release of page {} not owned by a slab",
                    self.id, i
                );
            }
            page.flags.remove(PageFlags::SLAB);
            page.state = PageState::Owned { private: 0 };
        }
        self.free_run(addr, order)
    }

    /// Snapshot for introspection and failure dumps.
    pub fn stats(&self) -> ZoneStats {
        let mut free_runs_by_order = [0usize; MAX_ORDER];
        for (order, area) in self.free_areas.iter().enumerate() {
            free_runs_by_order[order] = area.count();
        }
        ZoneStats {
            zone_id: self.id,
            class: self.class,
            base_addr: self.base_addr,
            total_pages: self.span_pages,
            free_pages: self.free_pages(),
            percpu_pages: self.percpu.iter().map(|p| p.resident()).sum(),
            free_runs_by_order,
        }
    }

    #[allow(dead_code)]
    pub(crate) fn debug_check_conservation(&self) -> bool {
        let area_sum: usize = self
            .free_areas
            .iter()
            .enumerate()
            .map(|(o, a)| a.count() << o)
            .sum();
        if area_sum != self.area_free_pages {
            warn!(
                "zone {}: free-area sum {} != tracked {}",
                self.id, area_sum, self.area_free_pages
            );
            return false;
        }
        for (order, area) in self.free_areas.iter().enumerate() {
            let listed = area.heads(&self.pages).count();
            if listed != area.count() {
                warn!(
                    "zone {}: order {} lists {} heads but counts {}",
                    self.id,
                    order,
                    listed,
                    area.count()
                );
                return false;
            }
        }
        true
    }
}

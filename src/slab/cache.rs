//! Object cache: per-CPU arrays in front of colour-cycled slabs.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::ptr::NonNull;

#[cfg(feature = "log")]
use log::debug;

use crate::{AllocError, AllocPolicy, AllocResult, PAGE_SIZE};

use super::layout::{CacheLayout, POISON_BYTE, POISON_END, REDZONE_FREED, REDZONE_LIVE};
use super::slab::{ListKind, Slab};
use super::{CacheFlags, SlabPageSource};

/// Constructor/destructor run on each object when its slab is created or
/// torn down. The pointer is the object, the usize its size.
pub type ObjectCtor = Box<dyn Fn(NonNull<u8>, usize) + Send>;

/// Per-CPU stash of ready cells for one cache.
struct ArrayCache {
    entries: Vec<usize>,
    limit: usize,
    batch: usize,
    touched: bool,
}

impl ArrayCache {
    /// Capacity scales down as cells get bigger.
    fn for_cell(cell_size: usize) -> Self {
        let limit = if cell_size > PAGE_SIZE {
            8
        } else if cell_size > 1024 {
            24
        } else if cell_size > 256 {
            54
        } else {
            120
        };
        Self {
            entries: Vec::with_capacity(limit),
            limit,
            batch: limit / 2,
            touched: false,
        }
    }

    fn pop(&mut self) -> Option<usize> {
        let cell = self.entries.pop();
        if cell.is_some() {
            self.touched = true;
        }
        cell
    }

    fn push(&mut self, cell: usize) {
        self.entries.push(cell);
        self.touched = true;
    }

    fn is_full(&self) -> bool {
        self.entries.len() >= self.limit
    }
}

/// Usage snapshot for one cache.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub name: String,
    pub obj_size: usize,
    pub objs_per_slab: usize,
    /// Objects currently held by callers.
    pub active_objects: usize,
    /// Objects sitting free in slabs.
    pub free_objects: usize,
    /// Objects staged in per-CPU arrays.
    pub array_objects: usize,
    /// Objects across all slabs, allocated or not.
    pub total_objects: usize,
    pub active_slabs: usize,
    pub total_slabs: usize,
}

/// One object cache.
///
/// All mutation happens under the registry-issued lock around the whole
/// struct; the per-CPU arrays are plain fields because that lock already
/// serializes them.
pub struct Cache {
    id: u32,
    name: String,
    layout: CacheLayout,
    flags: CacheFlags,

    slabs: Vec<Option<Slab>>,
    free_slots: Vec<u32>,
    empty: Vec<u32>,
    partial: Vec<u32>,
    full: Vec<u32>,

    free_objects: usize,
    free_limit: usize,
    outstanding: usize,
    colour_next: usize,
    grown: bool,

    cpu_arrays: Vec<ArrayCache>,
    ctor: Option<ObjectCtor>,
    dtor: Option<ObjectCtor>,
}

impl Cache {
    pub(crate) fn new(
        id: u32,
        name: String,
        size: usize,
        align: usize,
        flags: CacheFlags,
        ctor: Option<ObjectCtor>,
        dtor: Option<ObjectCtor>,
        num_cpus: usize,
    ) -> AllocResult<Self> {
        let layout = CacheLayout::compute(size, align, flags, ctor.is_some())?;
        let num_cpus = num_cpus.max(1);
        let cpu_arrays: Vec<ArrayCache> = (0..num_cpus)
            .map(|_| ArrayCache::for_cell(layout.cell_size))
            .collect();
        let batch = cpu_arrays[0].batch;
        let free_limit = (1 + num_cpus) * batch + layout.objs_per_slab;
        Ok(Self {
            id,
            name,
            layout,
            flags,
            slabs: Vec::new(),
            free_slots: Vec::new(),
            empty: Vec::new(),
            partial: Vec::new(),
            full: Vec::new(),
            free_objects: 0,
            free_limit,
            outstanding: 0,
            colour_next: 0,
            grown: false,
            cpu_arrays,
            ctor,
            dtor,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn obj_size(&self) -> usize {
        self.layout.obj_size
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    fn slab_mut(&mut self, slot: u32) -> &mut Slab {
        match self.slabs.get_mut(slot as usize).and_then(Option::as_mut) {
            Some(slab) => slab,
            None => panic!("slab corruption: cache {:#x} has no slab in slot {}", self.id, slot),
        }
    }

    fn list_mut(&mut self, kind: ListKind) -> &mut Vec<u32> {
        match kind {
            ListKind::Empty => &mut self.empty,
            ListKind::Partial => &mut self.partial,
            ListKind::Full => &mut self.full,
        }
    }

    /// Move a slab to the list matching its fill state.
    fn migrate(&mut self, slot: u32, to: ListKind) {
        let from = self.slab_mut(slot).list;
        if from == to {
            return;
        }
        let list = self.list_mut(from);
        match list.iter().position(|&s| s == slot) {
            Some(pos) => {
                list.swap_remove(pos);
            }
            None => panic!("slab corruption: slot {} missing from its list", slot),
        }
        self.list_mut(to).push(slot);
        self.slab_mut(slot).list = to;
    }

    // ---- debug decorators -------------------------------------------------

    fn redzone_words(&self, cell: usize) -> (*mut usize, *mut usize) {
        let lead = cell as *mut usize;
        let trail = (cell + self.layout.obj_offset + self.layout.obj_size) as *mut usize;
        (lead, trail)
    }

    fn swap_redzone(&self, cell: usize, expect: usize, set: usize, when: &str) {
        let (lead, trail) = self.redzone_words(cell);
        let (a, b) = unsafe { (lead.read_unaligned(), trail.read_unaligned()) };
        if a != expect || b != expect {
            panic!(
                "cache {}: redzone damage at {:#x} on {} ({:#x}/{:#x}, expected {:#x})",
                self.name, cell, when, a, b, expect
            );
        }
        unsafe {
            lead.write_unaligned(set);
            trail.write_unaligned(set);
        }
    }

    fn poison_cell(&self, cell: usize) {
        let obj = (cell + self.layout.obj_offset) as *mut u8;
        let size = self.layout.obj_size;
        unsafe {
            core::ptr::write_bytes(obj, POISON_BYTE, size - 1);
            *obj.add(size - 1) = POISON_END;
        }
    }

    fn check_poison(&self, cell: usize) {
        let obj = (cell + self.layout.obj_offset) as *const u8;
        let size = self.layout.obj_size;
        for i in 0..size {
            let want = if i == size - 1 { POISON_END } else { POISON_BYTE };
            let got = unsafe { *obj.add(i) };
            if got != want {
                panic!(
                    "cache {}: poison overwritten at {:#x}+{} ({:#x} != {:#x})",
                    self.name,
                    cell + self.layout.obj_offset,
                    i,
                    got,
                    want
                );
            }
        }
    }

    fn init_cell(&self, cell: usize) {
        if self.flags.contains(CacheFlags::RED_ZONE) {
            let (lead, trail) = self.redzone_words(cell);
            unsafe {
                lead.write_unaligned(REDZONE_FREED);
                trail.write_unaligned(REDZONE_FREED);
            }
        }
        if self.flags.contains(CacheFlags::POISON) {
            self.poison_cell(cell);
        }
        if let Some(ctor) = &self.ctor {
            let obj = (cell + self.layout.obj_offset) as *mut u8;
            // Object addresses come from nonzero page runs.
            ctor(unsafe { NonNull::new_unchecked(obj) }, self.layout.obj_size);
        }
    }

    fn decorate_alloc(&self, cell: usize) -> usize {
        if self.flags.contains(CacheFlags::POISON) {
            self.check_poison(cell);
        }
        if self.flags.contains(CacheFlags::RED_ZONE) {
            self.swap_redzone(cell, REDZONE_FREED, REDZONE_LIVE, "allocation");
        }
        cell + self.layout.obj_offset
    }

    fn decorate_free(&self, cell: usize) {
        if self.flags.contains(CacheFlags::RED_ZONE) {
            self.swap_redzone(cell, REDZONE_LIVE, REDZONE_FREED, "free");
        }
        if self.flags.contains(CacheFlags::POISON) {
            self.poison_cell(cell);
        }
    }

    // ---- growth and release ----------------------------------------------

    /// Add one slab. Colour offsets cycle so successive slabs stagger their
    /// object start lines across the cache.
    fn grow(&mut self, source: &dyn SlabPageSource, policy: AllocPolicy) -> AllocResult {
        let order = self.layout.gfp_order;
        let base = source.alloc_slab_pages(order, policy)?;

        let colour_off = self.colour_next * self.layout.colour_align;
        self.colour_next = (self.colour_next + 1) % self.layout.colour_range;

        let slab = Slab::new(base, colour_off, &self.layout);
        for i in 0..self.layout.objs_per_slab {
            self.init_cell(slab.cell_addr(&self.layout, i));
        }

        let slot = match self.free_slots.pop() {
            Some(s) => {
                self.slabs[s as usize] = Some(slab);
                s
            }
            None => {
                self.slabs.push(Some(slab));
                (self.slabs.len() - 1) as u32
            }
        };
        if let Err(e) = source.annotate_slab(base, order, self.id, slot) {
            self.slabs[slot as usize] = None;
            self.free_slots.push(slot);
            source.free_slab_pages(base, order)?;
            return Err(e);
        }
        self.empty.push(slot);
        self.free_objects += self.layout.objs_per_slab;
        self.grown = true;
        debug!(
            "cache {}: grew by slab {:#x} (colour {:#x})",
            self.name, base, colour_off
        );
        Ok(())
    }

    /// Pull one cell out of the partial (preferred) or empty lists.
    fn take_from_slabs(&mut self) -> Option<usize> {
        let slot = self
            .partial
            .first()
            .copied()
            .or_else(|| self.empty.first().copied())?;
        let layout = self.layout;
        let slab = self.slab_mut(slot);
        let cell = match slab.pop_free(&layout) {
            Some(c) => c,
            None => panic!("slab corruption: slot {} listed as having free objects", slot),
        };
        let kind = if slab.is_full(&layout) {
            ListKind::Full
        } else {
            ListKind::Partial
        };
        self.free_objects -= 1;
        self.migrate(slot, kind);
        Some(cell)
    }

    fn refill(&mut self, source: &dyn SlabPageSource, policy: AllocPolicy, cpu: usize) -> AllocResult {
        let batch = self.cpu_arrays[cpu].batch.max(1);
        let mut cells = Vec::with_capacity(batch);
        while cells.len() < batch {
            match self.take_from_slabs() {
                Some(c) => cells.push(c),
                None => {
                    if !cells.is_empty() {
                        break;
                    }
                    self.grow(source, policy)?;
                }
            }
        }
        self.cpu_arrays[cpu].entries.extend(cells);
        Ok(())
    }

    /// Return a cell to its slab, migrating lists and trimming empty slabs
    /// beyond the free ceiling.
    fn release_cell(&mut self, source: &dyn SlabPageSource, cell: usize) -> AllocResult {
        let (_, slot) = source.slab_owner(cell).ok_or(AllocError::NotAllocated)?;
        let layout = self.layout;
        let slab = self.slab_mut(slot);
        let idx = match slab.index_of(&layout, cell) {
            Some(i) => i,
            None => panic!(
                "cache corruption: {:#x} is not an object boundary in slab {}",
                cell, slot
            ),
        };
        slab.push_free(idx);
        self.free_objects += 1;
        let kind = if self.slab_mut(slot).is_empty() {
            ListKind::Empty
        } else {
            ListKind::Partial
        };
        self.migrate(slot, kind);
        if kind == ListKind::Empty && self.free_objects > self.free_limit {
            self.destroy_slab(source, slot)?;
        }
        Ok(())
    }

    /// Tear one empty slab down: run destructors, release its run.
    fn destroy_slab(&mut self, source: &dyn SlabPageSource, slot: u32) -> AllocResult {
        let slab = match self.slabs.get_mut(slot as usize).and_then(Option::take) {
            Some(s) => s,
            None => panic!("slab corruption: destroying empty slot {}", slot),
        };
        if !slab.is_empty() {
            panic!(
                "cache {}: destroying slab {:#x} with {} live objects",
                self.name,
                slab.base(),
                slab.in_use()
            );
        }
        let list = self.list_mut(slab.list);
        match list.iter().position(|&s| s == slot) {
            Some(pos) => {
                list.swap_remove(pos);
            }
            None => panic!("slab corruption: slot {} missing from its list", slot),
        }
        if let Some(dtor) = &self.dtor {
            for i in 0..self.layout.objs_per_slab {
                let obj = (slab.cell_addr(&self.layout, i) + self.layout.obj_offset) as *mut u8;
                dtor(unsafe { NonNull::new_unchecked(obj) }, self.layout.obj_size);
            }
        }
        self.free_objects -= self.layout.objs_per_slab;
        self.free_slots.push(slot);
        source.free_slab_pages(slab.base(), self.layout.gfp_order)
    }

    // ---- public operations ------------------------------------------------

    /// Allocate one object. `policy` only reaches the page source on growth.
    pub fn alloc(
        &mut self,
        source: &dyn SlabPageSource,
        policy: AllocPolicy,
        cpu: usize,
    ) -> AllocResult<usize> {
        if cpu >= self.cpu_arrays.len() {
            return Err(AllocError::InvalidParam);
        }
        let cell = match self.cpu_arrays[cpu].pop() {
            Some(c) => c,
            None => {
                self.refill(source, policy, cpu)?;
                self.cpu_arrays[cpu].pop().ok_or(AllocError::NoMemory)?
            }
        };
        self.outstanding += 1;
        Ok(self.decorate_alloc(cell))
    }

    /// Free one object previously returned by [`Self::alloc`].
    pub fn free(&mut self, source: &dyn SlabPageSource, ptr: usize, cpu: usize) -> AllocResult {
        if cpu >= self.cpu_arrays.len() || ptr < self.layout.obj_offset {
            return Err(AllocError::InvalidParam);
        }
        let cell = ptr - self.layout.obj_offset;
        match source.slab_owner(cell) {
            Some((cache, _)) if cache == self.id => {}
            Some((cache, _)) => panic!(
                "cache {}: object {:#x} belongs to cache id {}",
                self.name, ptr, cache
            ),
            None => return Err(AllocError::NotAllocated),
        }
        self.outstanding = match self.outstanding.checked_sub(1) {
            Some(n) => n,
            None => panic!("cache {}: free with no outstanding objects", self.name),
        };
        self.decorate_free(cell);
        if self.cpu_arrays[cpu].is_full() {
            let batch = self.cpu_arrays[cpu].batch.max(1);
            let drained: Vec<usize> = self.cpu_arrays[cpu].entries.drain(..batch).collect();
            for c in drained {
                self.release_cell(source, c)?;
            }
        }
        self.cpu_arrays[cpu].push(cell);
        Ok(())
    }

    /// Flush one CPU's array back into the slabs.
    pub fn drain_cpu(&mut self, source: &dyn SlabPageSource, cpu: usize) -> AllocResult {
        if cpu >= self.cpu_arrays.len() {
            return Err(AllocError::InvalidParam);
        }
        let drained: Vec<usize> = self.cpu_arrays[cpu].entries.drain(..).collect();
        for c in drained {
            self.release_cell(source, c)?;
        }
        Ok(())
    }

    /// Release every freeable page. Returns the number of slabs still
    /// holding objects.
    pub fn shrink(&mut self, source: &dyn SlabPageSource) -> AllocResult<usize> {
        for cpu in 0..self.cpu_arrays.len() {
            self.drain_cpu(source, cpu)?;
        }
        while let Some(&slot) = self.empty.first() {
            self.destroy_slab(source, slot)?;
        }
        Ok(self.partial.len() + self.full.len())
    }

    /// Full teardown. Fails `Busy` while callers still hold objects.
    pub fn destroy(&mut self, source: &dyn SlabPageSource) -> AllocResult {
        if self.outstanding > 0 {
            return Err(AllocError::Busy);
        }
        let populated = self.shrink(source)?;
        if populated != 0 {
            panic!(
                "cache {}: {} populated slabs with zero outstanding objects",
                self.name, populated
            );
        }
        Ok(())
    }

    /// One housekeeping pass: skip if recently grown, otherwise trim idle
    /// per-CPU arrays and excess empty slabs. Returns pages released.
    pub fn reap(&mut self, source: &dyn SlabPageSource) -> AllocResult<usize> {
        if self.grown {
            self.grown = false;
            return Ok(0);
        }
        for cpu in 0..self.cpu_arrays.len() {
            if self.cpu_arrays[cpu].touched {
                self.cpu_arrays[cpu].touched = false;
                continue;
            }
            let n = self.cpu_arrays[cpu].batch.min(self.cpu_arrays[cpu].entries.len());
            let drained: Vec<usize> = self.cpu_arrays[cpu].entries.drain(..n).collect();
            for c in drained {
                self.release_cell(source, c)?;
            }
        }
        let mut pages = 0;
        let target = self.empty.len().div_ceil(2);
        for _ in 0..target {
            if self.free_objects <= self.free_limit {
                break;
            }
            let Some(&slot) = self.empty.first() else {
                break;
            };
            self.destroy_slab(source, slot)?;
            pages += 1 << self.layout.gfp_order;
        }
        Ok(pages)
    }

    pub fn stats(&self) -> CacheStats {
        let total_slabs = self.empty.len() + self.partial.len() + self.full.len();
        CacheStats {
            name: self.name.clone(),
            obj_size: self.layout.obj_size,
            objs_per_slab: self.layout.objs_per_slab,
            active_objects: self.outstanding,
            free_objects: self.free_objects,
            array_objects: self.cpu_arrays.iter().map(|a| a.entries.len()).sum(),
            total_objects: total_slabs * self.layout.objs_per_slab,
            active_slabs: self.partial.len() + self.full.len(),
            total_slabs,
        }
    }
}

//! One slab: a page run carved into cells, with an intrusive u16 free list.

use alloc::boxed::Box;
use alloc::vec;

use crate::align_up;

use super::layout::CacheLayout;

/// Free-list terminator.
pub const BUFCTL_END: u16 = u16::MAX;
/// Sentinel stored in the table slot of an allocated cell. Turns a double
/// free into an O(1) detection.
pub const BUFCTL_ALLOC: u16 = u16::MAX - 1;

/// Which cache list a slab currently sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Empty,
    Partial,
    Full,
}

/// Free-list table storage. Small cells keep it inside the run itself;
/// large cells get separately allocated bookkeeping so the run stays
/// densely packed.
enum Table {
    OnSlab(usize),
    OffSlab(Box<[u16]>),
}

/// Bookkeeping for one page run owned by a cache.
pub struct Slab {
    base: usize,
    objs_base: usize,
    colour_off: usize,
    in_use: usize,
    free_head: u16,
    table: Table,
    pub(crate) list: ListKind,
}

impl Slab {
    /// Build the bookkeeping for a freshly allocated run and chain every
    /// cell onto the free list.
    ///
    /// # Safety-relevant layout
    /// With on-slab tables the first `objs_per_slab * 2` bytes after the
    /// colour offset hold the table; objects follow, aligned up. The caller
    /// guarantees the run is `PAGE_SIZE << layout.gfp_order` bytes and
    /// exclusively owned.
    pub fn new(base: usize, colour_off: usize, layout: &CacheLayout) -> Self {
        let num = layout.objs_per_slab;
        let (table, objs_base) = if layout.off_slab {
            let table = vec![0u16; num].into_boxed_slice();
            (Table::OffSlab(table), base + colour_off)
        } else {
            let table_base = base + colour_off;
            let objs = align_up(table_base + layout.on_slab_table_bytes(), layout.align);
            (Table::OnSlab(table_base), objs)
        };

        let mut slab = Self {
            base,
            objs_base,
            colour_off,
            in_use: 0,
            free_head: 0,
            table,
            list: ListKind::Empty,
        };
        for i in 0..num {
            let next = if i + 1 == num { BUFCTL_END } else { (i + 1) as u16 };
            slab.set_link(i, next);
        }
        slab
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn colour_off(&self) -> usize {
        self.colour_off
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    pub fn is_empty(&self) -> bool {
        self.in_use == 0
    }

    pub fn is_full(&self, layout: &CacheLayout) -> bool {
        self.in_use == layout.objs_per_slab
    }

    fn link(&self, idx: usize) -> u16 {
        match &self.table {
            Table::OnSlab(base) => unsafe { *(*base as *const u16).add(idx) },
            Table::OffSlab(t) => t[idx],
        }
    }

    fn set_link(&mut self, idx: usize, val: u16) {
        match &mut self.table {
            Table::OnSlab(base) => unsafe { *(*base as *mut u16).add(idx) = val },
            Table::OffSlab(t) => t[idx] = val,
        }
    }

    /// Address of cell `idx`.
    pub fn cell_addr(&self, layout: &CacheLayout, idx: usize) -> usize {
        self.objs_base + idx * layout.cell_size
    }

    /// Cell index for an address inside this slab's object area.
    pub fn index_of(&self, layout: &CacheLayout, addr: usize) -> Option<usize> {
        if addr < self.objs_base {
            return None;
        }
        let off = addr - self.objs_base;
        if off % layout.cell_size != 0 {
            return None;
        }
        let idx = off / layout.cell_size;
        (idx < layout.objs_per_slab).then_some(idx)
    }

    /// Take one cell off the free list.
    pub fn pop_free(&mut self, layout: &CacheLayout) -> Option<usize> {
        if self.free_head == BUFCTL_END {
            return None;
        }
        let idx = self.free_head as usize;
        self.free_head = self.link(idx);
        self.set_link(idx, BUFCTL_ALLOC);
        self.in_use += 1;
        Some(self.cell_addr(layout, idx))
    }

    /// Return cell `idx` to the free list.
    ///
    /// Panics if the slot is not marked allocated.
    pub fn push_free(&mut self, idx: usize) {
        if self.link(idx) != BUFCTL_ALLOC {
            panic!("slab corruption: double free of object {} in slab {:#x}", idx, self.base);
        }
        self.set_link(idx, self.free_head);
        self.free_head = idx as u16;
        self.in_use -= 1;
    }
}

//! Per-order free run list.
//!
//! Each order keeps a doubly-linked list of free run heads, threaded through
//! the zone's descriptor arena by page index. No policy lives here; split
//! and merge decisions belong to the zone.

use super::page::{PageDescriptor, PageState, LINK_NONE};

/// Free list of `2^order` runs, identified by the index of each head page.
#[derive(Debug)]
pub struct FreeArea {
    head: u32,
    count: usize,
}

impl FreeArea {
    pub const fn new() -> Self {
        Self {
            head: LINK_NONE,
            count: 0,
        }
    }

    /// Number of free runs at this order.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Link `pfn` in as a run head of `order`, marking its descriptor.
    pub(crate) fn push_head(&mut self, pages: &mut [PageDescriptor], pfn: u32, order: u8) {
        let page = &mut pages[pfn as usize];
        page.state = PageState::FreeHead { order };
        page.prev_free = LINK_NONE;
        page.next_free = self.head;

        if self.head != LINK_NONE {
            pages[self.head as usize].prev_free = pfn;
        }
        self.head = pfn;
        self.count += 1;
    }

    /// Unlink and return the first run head, demoting it to a plain free
    /// body page; the caller decides what the run becomes next.
    pub(crate) fn pop_head(&mut self, pages: &mut [PageDescriptor]) -> Option<u32> {
        if self.head == LINK_NONE {
            return None;
        }
        let pfn = self.head;
        self.unlink(pages, pfn);
        pages[pfn as usize].state = PageState::FreeTail;
        Some(pfn)
    }

    /// Unlink a specific run head (used when its buddy is being merged).
    ///
    /// Panics if `pfn` is not linked at this order: a corrupted free list is
    /// an invariant violation and continuing risks silent corruption.
    pub(crate) fn remove(&mut self, pages: &mut [PageDescriptor], pfn: u32) {
        if !matches!(pages[pfn as usize].state, PageState::FreeHead { .. }) {
            panic!("free list corruption: page {} removed but not a run head", pfn);
        }
        self.unlink(pages, pfn);
        pages[pfn as usize].state = PageState::FreeTail;
    }

    fn unlink(&mut self, pages: &mut [PageDescriptor], pfn: u32) {
        let (prev, next) = {
            let page = &pages[pfn as usize];
            (page.prev_free, page.next_free)
        };

        if prev != LINK_NONE {
            pages[prev as usize].next_free = next;
        } else {
            debug_assert_eq!(self.head, pfn);
            self.head = next;
        }
        if next != LINK_NONE {
            pages[next as usize].prev_free = prev;
        }

        let page = &mut pages[pfn as usize];
        page.prev_free = LINK_NONE;
        page.next_free = LINK_NONE;
        self.count -= 1;
    }

    /// Iterate the head indices (diagnostics only).
    pub(crate) fn heads<'a>(&self, pages: &'a [PageDescriptor]) -> FreeAreaIter<'a> {
        FreeAreaIter {
            pages,
            current: self.head,
        }
    }
}

impl Default for FreeArea {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct FreeAreaIter<'a> {
    pages: &'a [PageDescriptor],
    current: u32,
}

impl Iterator for FreeAreaIter<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current == LINK_NONE {
            return None;
        }
        let pfn = self.current;
        self.current = self.pages[pfn as usize].next_free;
        Some(pfn)
    }
}

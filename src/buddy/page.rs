//! Per-page descriptor.
//!
//! One descriptor per page frame in a zone's arena. The descriptor carries a
//! biased reference count, a flags bitset, the free-list index links, and a
//! tagged state word that says who owns the page right now.

bitflags::bitflags! {
    /// Page status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u16 {
        /// Never enters the buddy lists (holes, bookkeeping carve-outs).
        const RESERVED = 1 << 0;
        /// On the active LRU side (maintained by the reclaim collaborator).
        const ACTIVE = 1 << 1;
        /// Contents newer than backing store.
        const DIRTY = 1 << 2;
        /// Under I/O or otherwise pinned.
        const LOCKED = 1 << 3;
        /// Part of a slab-owned page run.
        const SLAB = 1 << 4;
        /// Parked in a per-CPU page stash; not free-listed, not caller-owned.
        const STASHED = 1 << 5;
    }
}

/// What the descriptor's private word currently means.
///
/// The buddy order of a free run, the slab back-pointers of a slab page and
/// the private word of a caller-owned page are mutually exclusive, so they
/// are spelled out as variants instead of sharing one raw integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Head of a free `2^order` run, linked into `FreeArea[order]`.
    FreeHead { order: u8 },
    /// Body page of a free run; the head carries the order.
    FreeTail,
    /// Owned by slab `slab` of cache `cache`.
    Slab { cache: u32, slab: u32 },
    /// Handed to a caller; the private word is theirs.
    Owned { private: usize },
}

/// Sentinel for "no link" in the free-list index chains.
pub(crate) const LINK_NONE: u32 = u32::MAX;

/// One physical page frame.
#[derive(Debug, Clone)]
pub struct PageDescriptor {
    /// Holder count biased by -1: -1 means no holders, 0 means one holder.
    count: i32,
    pub flags: PageFlags,
    pub state: PageState,
    pub(crate) prev_free: u32,
    pub(crate) next_free: u32,
}

impl PageDescriptor {
    /// A reserved, unowned frame; zones start every descriptor like this
    /// and clear `RESERVED` when the bootstrap collaborator seeds the range.
    pub(crate) const fn reserved() -> Self {
        Self {
            count: -1,
            flags: PageFlags::RESERVED,
            state: PageState::Owned { private: 0 },
            prev_free: LINK_NONE,
            next_free: LINK_NONE,
        }
    }

    /// Number of holders (unbiased).
    pub fn holders(&self) -> i32 {
        self.count + 1
    }

    pub(crate) fn set_holders(&mut self, holders: i32) {
        self.count = holders - 1;
    }

    /// Take an additional reference.
    pub fn get(&mut self) {
        self.count += 1;
    }

    /// Drop a reference; returns true when the last holder is gone.
    pub fn put(&mut self) -> bool {
        self.count -= 1;
        self.count < 0
    }

    pub fn is_free(&self) -> bool {
        matches!(
            self.state,
            PageState::FreeHead { .. } | PageState::FreeTail
        )
    }

    /// True if this page heads a free run of exactly `order`.
    pub(crate) fn is_buddy_of_order(&self, order: usize) -> bool {
        matches!(self.state, PageState::FreeHead { order: o } if o as usize == order)
            && !self.flags.contains(PageFlags::RESERVED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refcount_bias() {
        let mut page = PageDescriptor::reserved();
        assert_eq!(page.holders(), 0);

        page.set_holders(1);
        assert_eq!(page.holders(), 1);

        page.get();
        assert_eq!(page.holders(), 2);

        assert!(!page.put());
        assert!(page.put());
        assert_eq!(page.holders(), 0);
    }

    #[test]
    fn test_buddy_state_match() {
        let mut page = PageDescriptor::reserved();
        page.state = PageState::FreeHead { order: 3 };
        // Reserved pages never count as buddies even when marked free.
        assert!(!page.is_buddy_of_order(3));

        page.flags.remove(PageFlags::RESERVED);
        assert!(page.is_buddy_of_order(3));
        assert!(!page.is_buddy_of_order(2));

        page.state = PageState::FreeTail;
        assert!(!page.is_buddy_of_order(3));
        assert!(page.is_free());
    }
}

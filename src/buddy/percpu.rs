//! Per-CPU hot/cold page stashes.
//!
//! Small LIFO arrays of order-0 pages in front of the zone free lists. They
//! are only ever touched under the owning zone's lock with local interrupts
//! disabled, so the structures themselves need no synchronization.

use alloc::vec::Vec;

/// A single LIFO stash of order-0 page addresses.
#[derive(Debug)]
pub(crate) struct PageStash {
    entries: Vec<usize>,
    /// Occupancy never exceeds this.
    pub high: usize,
    /// Bulk refill/flush quantum.
    pub batch: usize,
}

impl PageStash {
    fn new(high: usize, batch: usize) -> Self {
        Self {
            entries: Vec::with_capacity(high),
            high,
            batch,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, addr: usize) {
        debug_assert!(self.entries.len() < self.high);
        self.entries.push(addr);
    }

    pub fn pop(&mut self) -> Option<usize> {
        self.entries.pop()
    }
}

/// Hot and cold stash pair for one CPU.
#[derive(Debug)]
pub(crate) struct PerCpuPages {
    pub hot: PageStash,
    pub cold: PageStash,
}

impl PerCpuPages {
    /// Batch size is a density heuristic over the zone size, clamped so tiny
    /// zones still batch and huge zones do not hoard.
    pub fn new(zone_pages: usize) -> Self {
        let batch = (zone_pages / 1024).clamp(1, 32);
        Self {
            hot: PageStash::new(batch * 6, batch),
            cold: PageStash::new(batch * 2, batch),
        }
    }

    pub fn stash(&self, cold: bool) -> &PageStash {
        if cold {
            &self.cold
        } else {
            &self.hot
        }
    }

    pub fn stash_mut(&mut self, cold: bool) -> &mut PageStash {
        if cold {
            &mut self.cold
        } else {
            &mut self.hot
        }
    }

    /// Total pages parked in both stashes.
    pub fn resident(&self) -> usize {
        self.hot.len() + self.cold.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_clamp() {
        assert_eq!(PerCpuPages::new(16).hot.batch, 1);
        assert_eq!(PerCpuPages::new(4096).hot.batch, 4);
        assert_eq!(PerCpuPages::new(1 << 20).hot.batch, 32);
    }

    #[test]
    fn test_high_water_marks() {
        let pcp = PerCpuPages::new(8192);
        assert_eq!(pcp.hot.high, pcp.hot.batch * 6);
        assert_eq!(pcp.cold.high, pcp.cold.batch * 2);
    }

    #[test]
    fn test_lifo() {
        let mut pcp = PerCpuPages::new(1024);
        pcp.hot.push(0x1000);
        pcp.hot.push(0x2000);
        assert_eq!(pcp.resident(), 2);
        assert_eq!(pcp.hot.pop(), Some(0x2000));
        assert_eq!(pcp.hot.pop(), Some(0x1000));
        assert_eq!(pcp.hot.pop(), None);
    }
}

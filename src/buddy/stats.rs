//! Zone statistics and allocation-failure reporting.
//!
//! Diagnostic only; the format is not a stability contract.

use crate::{MAX_ORDER, PAGE_SIZE};

use super::zone::ZoneClass;

/// Snapshot of one zone's free-page state.
#[derive(Debug, Clone, Copy)]
pub struct ZoneStats {
    pub zone_id: usize,
    pub class: ZoneClass,
    pub base_addr: usize,
    pub total_pages: usize,
    /// Free-area pages plus per-CPU stash residents.
    pub free_pages: usize,
    /// Pages parked in per-CPU stashes (included in `free_pages`).
    pub percpu_pages: usize,
    pub free_runs_by_order: [usize; MAX_ORDER],
}

/// Detailed memory statistics reporter.
pub struct MemoryStatsReporter;

impl MemoryStatsReporter {
    /// Print a per-zone breakdown when an allocation request fails for good.
    #[allow(unused_variables)]
    pub fn print_alloc_failure(zones: &[ZoneStats], order: usize) {
        #[cfg(feature = "log")]
        use log::error;

        error!("========================================");
        error!(
            "Request: order {} ({} KB) failed after all escalation passes",
            order,
            ((1 << order) * PAGE_SIZE) / 1024
        );

        for z in zones {
            error!(
                "Zone {} ({}): [{:#x}, {:#x})",
                z.zone_id,
                z.class.name(),
                z.base_addr,
                z.base_addr + z.total_pages * PAGE_SIZE
            );
            error!(
                "  Free pages: {} / {} ({} in per-CPU stashes)",
                z.free_pages, z.total_pages, z.percpu_pages
            );
            for o in (0..MAX_ORDER).rev() {
                let count = z.free_runs_by_order[o];
                if count > 0 {
                    error!(
                        "    Order {}: {} runs ({} KB each)",
                        o,
                        count,
                        ((1 << o) * PAGE_SIZE) / 1024
                    );
                }
            }
            error!("----------------------------------------");
        }
        error!("========================================");
    }
}

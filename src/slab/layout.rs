//! Cache geometry: cell size, page order, objects per slab, colouring.

use crate::{align_up, AllocError, AllocResult, PAGE_SIZE};

use super::CacheFlags;

/// Largest page order tried for a single slab.
const MAX_GFP_ORDER: usize = 5;

/// Accept a slab geometry once internal fragmentation drops to 1/8 of the
/// slab or less.
const FRAG_DENOMINATOR: usize = 8;

/// Guard word written around live objects.
pub(crate) const REDZONE_LIVE: usize = 0x5A2C_F071;
/// Guard word written around freed objects.
pub(crate) const REDZONE_FREED: usize = 0x170F_C2A5;
/// Fill byte for the body of a poisoned free object.
pub(crate) const POISON_BYTE: u8 = 0x5A;
/// Fill byte for the last byte of a poisoned free object.
pub(crate) const POISON_END: u8 = 0xA5;

const WORD: usize = core::mem::size_of::<usize>();

/// Computed geometry of one cache, fixed at creation.
#[derive(Debug, Clone, Copy)]
pub struct CacheLayout {
    /// Caller-visible object size.
    pub obj_size: usize,
    /// Full cell size including decorations, padded to the alignment.
    pub cell_size: usize,
    /// Offset of the object within its cell (nonzero with `RED_ZONE`).
    pub obj_offset: usize,
    /// Object alignment.
    pub align: usize,
    /// Page order of one slab's run.
    pub gfp_order: usize,
    /// Objects per slab.
    pub objs_per_slab: usize,
    /// Free-list table lives outside the run when true.
    pub off_slab: bool,
    /// Number of distinct colour offsets to cycle through.
    pub colour_range: usize,
    /// Granularity of one colour step.
    pub colour_align: usize,
}

impl CacheLayout {
    /// Compute the geometry for `(size, align, flags)`.
    ///
    /// Rejects zero or oversized objects, non-power-of-two alignment, and
    /// the `POISON`-with-constructor combination.
    pub fn compute(
        size: usize,
        align: usize,
        flags: CacheFlags,
        has_ctor: bool,
    ) -> AllocResult<Self> {
        if size == 0 || size > PAGE_SIZE << MAX_GFP_ORDER {
            return Err(AllocError::InvalidParam);
        }
        if align != 0 && (!align.is_power_of_two() || align > PAGE_SIZE) {
            return Err(AllocError::InvalidParam);
        }
        if flags.contains(CacheFlags::POISON) && has_ctor {
            // The constructor's work would be destroyed by the fill pattern.
            return Err(AllocError::InvalidParam);
        }

        let align = align.max(WORD);
        let obj_offset = if flags.contains(CacheFlags::RED_ZONE) {
            align_up(WORD, align)
        } else {
            0
        };
        let mut cell_size = obj_offset + size;
        if flags.contains(CacheFlags::RED_ZONE) {
            cell_size += WORD;
        }
        let cell_size = align_up(cell_size, align);

        let off_slab = cell_size >= PAGE_SIZE / 8;

        let mut chosen: Option<(usize, usize, usize)> = None;
        for order in 0..=MAX_GFP_ORDER {
            let (num, left) = cache_estimate(order, cell_size, off_slab);
            if num == 0 {
                continue;
            }
            if chosen.is_none() {
                chosen = Some((order, num, left));
            }
            if left * FRAG_DENOMINATOR <= (PAGE_SIZE << order) {
                chosen = Some((order, num, left));
                break;
            }
        }
        let (gfp_order, objs_per_slab, left_over) = chosen.ok_or(AllocError::InvalidParam)?;

        let colour_align = align.max(64);
        let colour_range = left_over / colour_align + 1;

        Ok(Self {
            obj_size: size,
            cell_size,
            obj_offset,
            align,
            gfp_order,
            objs_per_slab,
            off_slab,
            colour_range,
            colour_align,
        })
    }

    /// Bytes of free-list table stored inside the run (zero when off-slab).
    pub fn on_slab_table_bytes(&self) -> usize {
        if self.off_slab {
            0
        } else {
            self.objs_per_slab * core::mem::size_of::<u16>()
        }
    }
}

/// How many cells fit in a `2^gfp_order` run, and the bytes left over.
///
/// On-slab slabs carry one u16 free-list entry per object inside the run,
/// so each object effectively costs `cell_size + 2` during the fit.
fn cache_estimate(gfp_order: usize, cell_size: usize, off_slab: bool) -> (usize, usize) {
    let slab_size = PAGE_SIZE << gfp_order;
    let per_obj = if off_slab {
        cell_size
    } else {
        cell_size + core::mem::size_of::<u16>()
    };
    let num = slab_size / per_obj;
    (num, slab_size - num * per_obj)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_object_on_slab() {
        let l = CacheLayout::compute(64, 0, CacheFlags::empty(), false).unwrap();
        assert_eq!(l.cell_size, 64);
        assert_eq!(l.obj_offset, 0);
        assert!(!l.off_slab);
        assert_eq!(l.gfp_order, 0);
        // 4096 / (64 + 2) = 62 objects per page.
        assert_eq!(l.objs_per_slab, 62);
        assert!(l.colour_range >= 1);
    }

    #[test]
    fn test_large_object_off_slab() {
        let l = CacheLayout::compute(2048, 0, CacheFlags::empty(), false).unwrap();
        assert!(l.off_slab);
        assert_eq!(l.cell_size, 2048);
        assert_eq!(l.objs_per_slab, (PAGE_SIZE << l.gfp_order) / 2048);
    }

    #[test]
    fn test_redzone_grows_cell() {
        let plain = CacheLayout::compute(64, 0, CacheFlags::empty(), false).unwrap();
        let guarded = CacheLayout::compute(64, 0, CacheFlags::RED_ZONE, false).unwrap();
        assert!(guarded.cell_size > plain.cell_size);
        assert!(guarded.obj_offset >= core::mem::size_of::<usize>());
    }

    #[test]
    fn test_poison_with_ctor_rejected() {
        assert_eq!(
            CacheLayout::compute(64, 0, CacheFlags::POISON, true).err(),
            Some(AllocError::InvalidParam)
        );
        assert!(CacheLayout::compute(64, 0, CacheFlags::POISON, false).is_ok());
    }

    #[test]
    fn test_invalid_sizes_rejected() {
        assert!(CacheLayout::compute(0, 0, CacheFlags::empty(), false).is_err());
        assert!(CacheLayout::compute(usize::MAX / 2, 0, CacheFlags::empty(), false).is_err());
        assert!(CacheLayout::compute(64, 3, CacheFlags::empty(), false).is_err());
    }

    #[test]
    fn test_largest_class_fits() {
        // 131072 bytes is exactly one order-5 run: one object per slab.
        let l = CacheLayout::compute(131072, 0, CacheFlags::empty(), false).unwrap();
        assert!(l.off_slab);
        assert_eq!(l.gfp_order, 5);
        assert_eq!(l.objs_per_slab, 1);
        assert!(CacheLayout::compute(131073, 0, CacheFlags::empty(), false).is_err());
    }

    #[test]
    fn test_fragmentation_bound() {
        for size in [32usize, 96, 200, 1000, 4096, 10000] {
            let l = CacheLayout::compute(size, 0, CacheFlags::empty(), false).unwrap();
            assert!(l.objs_per_slab >= 1);
            let slab = PAGE_SIZE << l.gfp_order;
            let used = l.objs_per_slab * l.cell_size + l.on_slab_table_bytes();
            assert!(used <= slab);
        }
    }
}

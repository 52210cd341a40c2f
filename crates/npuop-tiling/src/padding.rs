//! Pad/unpad protocol for chunks whose byte footprint is not block aligned.
//!
//! Copy-in always moves the aligned footprint. Copy-out picks one of three
//! strategies so that pad bytes never land on data another core owns.

use npuop_common::math::{ceil_align, floor_align};

use crate::planner::{ChunkDescriptor, PlanGeometry};
use crate::workspace::scratch_slot_offset;

/// Raw and aligned footprint of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PadSpec {
    pub raw_bytes: u64,
    pub aligned_bytes: u64,
    pub pad_bytes: u64,
}

impl PadSpec {
    pub fn new(elems: u64, elem_bytes: u64, align_bytes: u64) -> Self {
        let raw_bytes = elems * elem_bytes;
        let aligned_bytes = ceil_align(raw_bytes, align_bytes);
        Self { raw_bytes, aligned_bytes, pad_bytes: aligned_bytes - raw_bytes }
    }

    pub fn of(geometry: &PlanGeometry, chunk: &ChunkDescriptor) -> Self {
        Self::new(chunk.elems, geometry.elem_bytes, geometry.align_bytes)
    }

    pub fn is_aligned(&self) -> bool {
        self.pad_bytes == 0
    }
}

/// How a chunk's result reaches global memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOut {
    /// Footprint is aligned; write it as is.
    Direct { bytes: u64 },
    /// Write the aligned footprint. Only used where the bytes past the end
    /// are either slack after the tensor or rewritten later by this core.
    OverwritePastEnd { aligned_bytes: u64, pad_bytes: u64 },
    /// Write the aligned prefix directly, stage the trailing partial block in
    /// this core's scratch slot, fence, then copy back exactly
    /// `boundary_bytes`.
    MergeThroughScratch { prefix_bytes: u64, boundary_bytes: u64, scratch_offset: u64 },
}

/// Whether the aligned footprint of `chunk` reaches past the last element
/// its core owns. Always true for an unaligned final iteration; an earlier
/// one only crosses when the core's remaining elements are shorter than
/// its pad.
fn crosses_core_end(geometry: &PlanGeometry, chunk: &ChunkDescriptor, pad: &PadSpec) -> bool {
    geometry.core_end_elem(chunk.core).is_some_and(|end| {
        chunk.byte_offset(geometry.elem_bytes) + pad.aligned_bytes > end * geometry.elem_bytes
    })
}

/// Pick the copy-out strategy for `chunk`.
pub fn copy_out_plan(geometry: &PlanGeometry, chunk: &ChunkDescriptor) -> CopyOut {
    let pad = PadSpec::of(geometry, chunk);
    if pad.is_aligned() {
        return CopyOut::Direct { bytes: pad.raw_bytes };
    }

    let ends_tensor = chunk.elem_offset + chunk.elems == geometry.total_elems();
    let neighbour_follows =
        !ends_tensor && geometry.used_core_num() > 1 && crosses_core_end(geometry, chunk, &pad);
    if neighbour_follows && geometry.tail_merge {
        let prefix_bytes = floor_align(pad.raw_bytes, geometry.align_bytes);
        return CopyOut::MergeThroughScratch {
            prefix_bytes,
            boundary_bytes: pad.raw_bytes - prefix_bytes,
            scratch_offset: scratch_slot_offset(chunk.core, geometry.scratch_stride_bytes),
        };
    }
    CopyOut::OverwritePastEnd { aligned_bytes: pad.aligned_bytes, pad_bytes: pad.pad_bytes }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{CoreSplit, GridSplit, SizeRegime};

    fn geometry(tail_merge: bool, cores: CoreSplit) -> PlanGeometry {
        PlanGeometry {
            grid: GridSplit::new(4, 13, 1, 13).unwrap(),
            cores,
            pass_elems: 16,
            elem_bytes: 4,
            align_bytes: 32,
            tail_merge,
            scratch_stride_bytes: if tail_merge { 32 } else { 0 },
            buffer_num: 2,
            regime: SizeRegime::Unaligned,
        }
    }

    fn chunk(core: u64, block: u64) -> ChunkDescriptor {
        ChunkDescriptor { core, iter: 0, block, elem_offset: block * 13, elems: 13 }
    }

    #[test]
    fn pad_spec() {
        let pad = PadSpec::new(13, 4, 32);
        assert_eq!((pad.raw_bytes, pad.aligned_bytes, pad.pad_bytes), (52, 64, 12));
        assert!(PadSpec::new(8, 4, 32).is_aligned());
    }

    #[test]
    fn boundary_between_cores_goes_through_scratch() {
        let g = geometry(true, CoreSplit::even(4, 4));
        assert_eq!(
            copy_out_plan(&g, &chunk(1, 1)),
            CopyOut::MergeThroughScratch { prefix_bytes: 32, boundary_bytes: 20, scratch_offset: 32 }
        );
    }

    #[test]
    fn tensor_end_overwrites_into_slack() {
        let g = geometry(true, CoreSplit::even(4, 4));
        assert_eq!(
            copy_out_plan(&g, &chunk(3, 3)),
            CopyOut::OverwritePastEnd { aligned_bytes: 64, pad_bytes: 12 }
        );
    }

    #[test]
    fn early_chunk_whose_pad_outruns_its_core_merges() {
        let mut g = geometry(true, CoreSplit::even(2, 2));
        g.grid = GridSplit::new(1, 40, 1, 20).unwrap();
        g.elem_bytes = 1;
        let first = ChunkDescriptor { core: 0, iter: 0, block: 0, elem_offset: 0, elems: 16 };
        assert_eq!(
            copy_out_plan(&g, &first),
            CopyOut::MergeThroughScratch { prefix_bytes: 0, boundary_bytes: 16, scratch_offset: 0 }
        );

        // With more of the core behind it, the same chunk pads in place.
        g.grid = GridSplit::new(1, 96, 1, 48).unwrap();
        assert_eq!(copy_out_plan(&g, &first), CopyOut::OverwritePastEnd { aligned_bytes: 32, pad_bytes: 16 });
    }

    #[test]
    fn single_core_never_merges() {
        let g = geometry(false, CoreSplit::single(4));
        assert!(matches!(copy_out_plan(&g, &chunk(0, 1)), CopyOut::OverwritePastEnd { .. }));
    }
}

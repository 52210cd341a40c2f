//! DRAM workspace sizing.
//!
//! A launch's workspace is laid out as
//! `[system | tail_tmp_ws (used_core_num * stride) | family extra]`.

use serde::Serialize;

use crate::planner::PlanGeometry;

/// Byte layout of one launch's workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkspaceLayout {
    pub system_bytes: u64,
    pub tail_tmp_offset: u64,
    pub tail_tmp_bytes: u64,
    pub scratch_stride_bytes: u64,
    pub extra_offset: u64,
    pub extra_bytes: u64,
}

impl WorkspaceLayout {
    pub fn new(geometry: &PlanGeometry, system_bytes: u64, extra_bytes: u64) -> Self {
        let tail_tmp_bytes = tail_tmp_ws_bytes(geometry);
        Self {
            system_bytes,
            tail_tmp_offset: system_bytes,
            tail_tmp_bytes,
            scratch_stride_bytes: geometry.scratch_stride_bytes,
            extra_offset: system_bytes + tail_tmp_bytes,
            extra_bytes,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.system_bytes + self.tail_tmp_bytes + self.extra_bytes
    }

    /// Start of `core`'s private scratch slot, relative to the workspace base.
    pub fn scratch_offset(&self, core: u64) -> u64 {
        self.tail_tmp_offset + scratch_slot_offset(core, self.scratch_stride_bytes)
    }

    /// The host-visible workspace-size array (one entry per DRAM buffer).
    pub fn sizes(&self) -> Vec<u64> {
        vec![self.total_bytes()]
    }
}

/// Per-core scratch for the unaligned tail merge.
pub fn tail_tmp_ws_bytes(geometry: &PlanGeometry) -> u64 {
    if geometry.tail_merge {
        geometry.used_core_num() * geometry.scratch_stride_bytes
    } else {
        0
    }
}

/// Scratch slots never overlap: slot `core` starts at `core * stride`.
pub const fn scratch_slot_offset(core: u64, stride: u64) -> u64 {
    core * stride
}

pub fn workspace_bytes(geometry: &PlanGeometry, system_bytes: u64, extra_bytes: u64) -> u64 {
    WorkspaceLayout::new(geometry, system_bytes, extra_bytes).total_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{CoreSplit, GridSplit, SizeRegime};

    fn geometry(tail_merge: bool) -> PlanGeometry {
        PlanGeometry {
            grid: GridSplit::flat(1000, 100),
            cores: CoreSplit::even(10, 4),
            pass_elems: 100,
            elem_bytes: 2,
            align_bytes: 32,
            tail_merge,
            scratch_stride_bytes: if tail_merge { 32 } else { 0 },
            buffer_num: 2,
            regime: SizeRegime::Unaligned,
        }
    }

    #[test]
    fn tail_merge_adds_one_slot_per_core() {
        let layout = WorkspaceLayout::new(&geometry(true), 16 * 1024 * 1024, 0);
        assert_eq!(layout.tail_tmp_bytes, 4 * 32);
        assert_eq!(layout.total_bytes(), 16 * 1024 * 1024 + 128);
        assert_eq!(layout.scratch_offset(3), 16 * 1024 * 1024 + 96);
        assert_eq!(layout.sizes(), vec![16 * 1024 * 1024 + 128]);
    }

    #[test]
    fn no_merge_no_scratch() {
        assert_eq!(workspace_bytes(&geometry(false), 1024, 64), 1088);
    }
}

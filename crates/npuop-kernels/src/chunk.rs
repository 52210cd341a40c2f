//! The per-core chunk loop.
//!
//! Every core walks its chunks in order through three stages, copy-in,
//! compute and copy-out, connected by bounded queues. With two buffers the
//! copy-in of chunk `i + 1` is issued before chunk `i` is computed. Copy-out
//! follows [`copy_out_plan`], so a chunk whose footprint is not block aligned
//! never leaves pad bytes on another core's elements.

use tracing::{debug, trace};

use npuop_tiling::{copy_out_plan, ChunkDescriptor, CopyOut, PlanGeometry};

use crate::error::{DeviceFault, Result};
use crate::gm::{DeviceIo, Workspace, PAD_FILL};
use crate::queue::TQueue;

/// Where a chunk's results land in output 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMap {
    /// Output element `e` belongs to plan element `e`.
    Flat,
    /// As `Flat`, with output elements `elem_bytes` wide instead of the
    /// plan's element size.
    Narrow { elem_bytes: u64 },
    /// Plan element `e` is `(row, j) = (e / half, e % half)` and produces two
    /// output elements, `row * 2 * half + j` and the same plus `half`.
    /// `compute` returns all first-half values followed by all second-half
    /// values.
    SplitRows { half: u64 },
    /// Results are added into output 0 at offsets only the kernel knows;
    /// copy-out is [`ChunkKernel::accumulate`].
    Accumulate,
}

/// One kernel variant's view of a chunk.
pub trait ChunkKernel: Send + Sync {
    fn name(&self) -> &'static str;

    fn output_map(&self) -> OutputMap {
        OutputMap::Flat
    }

    /// Stage the operands `chunk` reads into local memory.
    fn copy_in(&self, io: &DeviceIo, chunk: &ChunkDescriptor) -> Result<Vec<u8>>;

    /// Produce the chunk's output bytes in the storage dtype, without padding.
    fn compute(&self, chunk: &ChunkDescriptor, staged: Vec<u8>) -> Result<Vec<u8>>;

    /// Atomic copy-out for [`OutputMap::Accumulate`] kernels.
    fn accumulate(&self, _io: &DeviceIo, chunk: &ChunkDescriptor, _local: &[u8]) -> Result<()> {
        Err(DeviceFault::core(chunk.core, format!("`{}` has no accumulating copy-out", self.name())).into())
    }

    /// Write outputs other than output 0 once `chunk` has been copied out.
    fn copy_out_side(&self, _io: &DeviceIo, _chunk: &ChunkDescriptor) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    CopyIn,
    Compute,
    CopyOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageEvent {
    pub stage: Stage,
    pub iter: u64,
}

/// What one core did during a launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreReport {
    pub core: u64,
    pub idle: bool,
    pub events: Vec<StageEvent>,
    /// Element count of the final iteration when it is a short tail, else 0.
    pub tail_elems: u64,
    /// Chunks written back through the scratch slot.
    pub merges: u64,
}

impl CoreReport {
    fn new(core: u64, idle: bool) -> Self {
        Self { core, idle, events: Vec::new(), tail_elems: 0, merges: 0 }
    }

    fn record(&mut self, stage: Stage, iter: u64) {
        trace!(core = self.core, iter, ?stage, "stage done");
        self.events.push(StageEvent { stage, iter });
    }
}

/// Drives one kernel over the chunks of a plan.
pub struct ChunkProcessor<'a> {
    geometry: &'a PlanGeometry,
    kernel: &'a dyn ChunkKernel,
    io: &'a DeviceIo,
    workspace: &'a Workspace,
}

impl<'a> ChunkProcessor<'a> {
    pub fn new(
        geometry: &'a PlanGeometry,
        kernel: &'a dyn ChunkKernel,
        io: &'a DeviceIo,
        workspace: &'a Workspace,
    ) -> Self {
        Self { geometry, kernel, io, workspace }
    }

    /// Run every chunk of `core`. A core past `used_core_num` returns at once.
    pub fn run(&self, core: u64) -> Result<CoreReport> {
        let chunks = self.geometry.core_chunks(core);
        if chunks.is_empty() {
            trace!(core, kernel = self.kernel.name(), "no blocks assigned, exiting");
            return Ok(CoreReport::new(core, true));
        }

        let mut report = CoreReport::new(core, false);
        let mut in_q = TQueue::new("copy-in", self.geometry.buffer_num);
        let mut out_q = TQueue::new("copy-out", self.geometry.buffer_num);
        let prefetch = in_q.depth() > 1;
        let main = self.geometry.main_chunk_elems();

        if prefetch {
            self.stage_in(&mut in_q, &chunks[0], &mut report)?;
        }
        for (i, chunk) in chunks.iter().enumerate() {
            let next = if prefetch { chunks.get(i + 1) } else { Some(chunk) };
            if let Some(next) = next {
                self.stage_in(&mut in_q, next, &mut report)?;
            }

            let staged = in_q.deque(core)?;
            let local = self.kernel.compute(chunk, staged)?;
            report.record(Stage::Compute, chunk.iter);
            out_q.enque(core, local)?;

            let last = i + 1 == chunks.len();
            if last && chunk.elems < main {
                debug!(core, iter = chunk.iter, elems = chunk.elems, main, "tail iteration");
                report.tail_elems = chunk.elems;
            }
            let local = out_q.deque(core)?;
            self.copy_out(chunk, local, &mut report)?;
            self.kernel.copy_out_side(self.io, chunk)?;
            report.record(Stage::CopyOut, chunk.iter);
        }

        if !in_q.is_empty() || !out_q.is_empty() {
            return Err(DeviceFault::core(core, "buffers still queued at exit").into());
        }
        Ok(report)
    }

    fn stage_in(&self, q: &mut TQueue<Vec<u8>>, chunk: &ChunkDescriptor, report: &mut CoreReport) -> Result<()> {
        let staged = self.kernel.copy_in(self.io, chunk)?;
        q.enque(chunk.core, staged)?;
        report.record(Stage::CopyIn, chunk.iter);
        Ok(())
    }

    fn copy_out(&self, chunk: &ChunkDescriptor, local: Vec<u8>, report: &mut CoreReport) -> Result<()> {
        match self.kernel.output_map() {
            OutputMap::Flat => self.copy_out_flat(chunk, self.geometry.elem_bytes, local, report),
            OutputMap::Narrow { elem_bytes } => self.copy_out_flat(chunk, elem_bytes, local, report),
            OutputMap::SplitRows { half } => self.copy_out_split(chunk, half, &local),
            OutputMap::Accumulate => self.kernel.accumulate(self.io, chunk, &local),
        }
    }

    fn copy_out_flat(
        &self,
        chunk: &ChunkDescriptor,
        elem_bytes: u64,
        mut local: Vec<u8>,
        report: &mut CoreReport,
    ) -> Result<()> {
        let g = &self.geometry.with_elem_bytes(elem_bytes);
        let core = chunk.core;
        let raw = chunk.byte_len(g.elem_bytes);
        if local.len() as u64 != raw {
            return Err(DeviceFault::core(core, format!("compute returned {} bytes, chunk holds {raw}", local.len())).into());
        }
        let out = self.io.output(0)?;
        let offset = chunk.byte_offset(g.elem_bytes);

        match copy_out_plan(g, chunk) {
            CopyOut::Direct { .. } => out.write(core, offset, &local)?,
            CopyOut::OverwritePastEnd { aligned_bytes, .. } => {
                local.resize(aligned_bytes as usize, PAD_FILL);
                out.write(core, offset, &local)?;
            }
            CopyOut::MergeThroughScratch { prefix_bytes, boundary_bytes, scratch_offset } => {
                let (prefix, partial) = local.split_at(prefix_bytes as usize);
                out.write(core, offset, prefix)?;
                let mut block = partial.to_vec();
                block.resize(g.align_bytes as usize, PAD_FILL);
                self.workspace.scratch_write(core, scratch_offset, &block)?;
                self.workspace.fence(core);
                let boundary = self.workspace.scratch_read(core, scratch_offset, boundary_bytes)?;
                out.write(core, offset + prefix_bytes, &boundary)?;
                report.merges += 1;
            }
        }
        Ok(())
    }

    fn copy_out_split(&self, chunk: &ChunkDescriptor, half: u64, local: &[u8]) -> Result<()> {
        let eb = self.geometry.elem_bytes;
        let core = chunk.core;
        let n = chunk.byte_len(eb) as usize;
        if half == 0 || local.len() != 2 * n {
            return Err(DeviceFault::core(core, format!("split output of {} bytes for a {n}-byte chunk", local.len())).into());
        }
        let (first, second) = local.split_at(n);
        let out = self.io.output(0)?;

        let end = chunk.elem_offset + chunk.elems;
        let mut e = chunk.elem_offset;
        while e < end {
            let (row, j) = (e / half, e % half);
            let run = (half - j).min(end - e);
            let src = ((e - chunk.elem_offset) * eb) as usize..((e - chunk.elem_offset + run) * eb) as usize;
            let dst = (row * 2 * half + j) * eb;
            out.write(core, dst, &first[src.clone()])?;
            out.write(core, dst + half * eb, &second[src])?;
            e += run;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use crate::gm::HostTensor;
    use npuop_common::DType;
    use npuop_tiling::{CoreSplit, GridSplit, SizeRegime};

    /// Copies `x` to `y` unchanged.
    struct Identity {
        elem_bytes: u64,
        align_bytes: u64,
    }

    impl ChunkKernel for Identity {
        fn name(&self) -> &'static str {
            "identity"
        }

        fn copy_in(&self, io: &DeviceIo, chunk: &ChunkDescriptor) -> Result<Vec<u8>> {
            let len = npuop_common::math::ceil_align(chunk.byte_len(self.elem_bytes), self.align_bytes);
            Ok(io.input(0)?.read(chunk.core, chunk.byte_offset(self.elem_bytes), len)?)
        }

        fn compute(&self, chunk: &ChunkDescriptor, mut staged: Vec<u8>) -> Result<Vec<u8>> {
            staged.truncate(chunk.byte_len(self.elem_bytes) as usize);
            Ok(staged)
        }
    }

    fn geometry(total: u64, cores: u64, pass: u64, buffer_num: u64, tail_merge: bool) -> PlanGeometry {
        let per_core = total.div_ceil(cores);
        PlanGeometry {
            grid: GridSplit::new(1, total, 1, per_core).unwrap(),
            cores: CoreSplit::even(total.div_ceil(per_core), cores),
            pass_elems: pass,
            elem_bytes: 4,
            align_bytes: 32,
            tail_merge,
            scratch_stride_bytes: if tail_merge { 32 } else { 0 },
            buffer_num,
            regime: SizeRegime::Unaligned,
        }
    }

    fn io(total: u64) -> (DeviceIo, Vec<f32>) {
        let values: Vec<f32> = (0..total).map(|i| i as f32 + 1.0).collect();
        let x = HostTensor::from_f32(vec![total], DType::Float32, &values).unwrap();
        let y = HostTensor::zeros(vec![total], DType::Float32);
        (DeviceIo::with_inputs(&[&x], &[y], 32), values)
    }

    fn run_all(g: &PlanGeometry, io: &DeviceIo, order: impl Iterator<Item = u64>) -> Vec<CoreReport> {
        let ws = Workspace::new(g);
        let kernel = Identity { elem_bytes: 4, align_bytes: 32 };
        let p = ChunkProcessor::new(g, &kernel, io, &ws);
        order.map(|core| p.run(core).unwrap()).collect()
    }

    #[test]
    fn copy_in_runs_one_chunk_ahead() {
        // One core, 40 elements in passes of 16: 16, 16, 8.
        let g = geometry(40, 1, 16, 2, false);
        let (io, _) = io(40);
        let report = run_all(&g, &io, 0..1).remove(0);
        let order: Vec<(Stage, u64)> = report.events.iter().map(|e| (e.stage, e.iter)).collect();
        assert_eq!(
            order,
            vec![
                (Stage::CopyIn, 0),
                (Stage::CopyIn, 1),
                (Stage::Compute, 0),
                (Stage::CopyOut, 0),
                (Stage::CopyIn, 2),
                (Stage::Compute, 1),
                (Stage::CopyOut, 1),
                (Stage::Compute, 2),
                (Stage::CopyOut, 2),
            ]
        );
        assert_eq!(report.tail_elems, 8);
    }

    #[test]
    fn single_buffer_does_not_prefetch() {
        let g = geometry(40, 1, 16, 1, false);
        let (io, _) = io(40);
        let report = run_all(&g, &io, 0..1).remove(0);
        assert_eq!(report.events[1], StageEvent { stage: Stage::Compute, iter: 0 });
    }

    #[test]
    fn idle_cores_exit_without_touching_memory() {
        let g = geometry(40, 2, 16, 2, false);
        let (io, _) = io(40);
        let reports = run_all(&g, &io, 5..6);
        assert!(reports[0].idle && reports[0].events.is_empty());
        let y = io.into_outputs().remove(0);
        assert!(y.bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn merge_keeps_the_neighbour_intact_in_any_order() {
        // 4 cores of 13 elements: every boundary is unaligned.
        let g = geometry(52, 4, 16, 2, true);
        let (io, values) = io(52);
        let reports = run_all(&g, &io, (0..4).rev());
        assert_eq!(reports.iter().map(|r| r.merges).sum::<u64>(), 3);
        assert_eq!(io.into_outputs().remove(0).to_f32().unwrap(), values);
    }

    #[test]
    fn padding_without_merge_corrupts_the_next_core() {
        let g = geometry(52, 4, 16, 2, false);
        let (io, _) = io(52);
        run_all(&g, &io, (0..4).rev());
        let y = io.into_outputs().remove(0);
        // Core 0 ran last and padded over elements 13..16 of core 1.
        assert!(y.bytes[52..64].iter().all(|&b| b == PAD_FILL));
    }

    /// Writes each fp32 value as one byte.
    struct LowByte;

    impl ChunkKernel for LowByte {
        fn name(&self) -> &'static str {
            "low_byte"
        }

        fn output_map(&self) -> OutputMap {
            OutputMap::Narrow { elem_bytes: 1 }
        }

        fn copy_in(&self, io: &DeviceIo, chunk: &ChunkDescriptor) -> Result<Vec<u8>> {
            Ok(io.input(0)?.read(chunk.core, chunk.byte_offset(4), chunk.byte_len(4))?)
        }

        fn compute(&self, _: &ChunkDescriptor, staged: Vec<u8>) -> Result<Vec<u8>> {
            Ok(crate::convert::to_f32(DType::Float32, &staged)?.into_iter().map(|v| v as u8).collect())
        }
    }

    #[test]
    fn narrow_output_merges_every_chunk_that_outruns_its_core() {
        // 24 elements per core in passes of 16: as bytes, both passes pad
        // past the core's end.
        let g = geometry(96, 4, 16, 2, true);
        let values: Vec<f32> = (0..96).map(|i| i as f32 + 1.0).collect();
        let x = HostTensor::from_f32(vec![96], DType::Float32, &values).unwrap();
        let io = DeviceIo::with_inputs(&[&x], &[HostTensor::zeros(vec![96], DType::Int8)], 32);
        let ws = Workspace::new(&g);
        let p = ChunkProcessor::new(&g, &LowByte, &io, &ws);
        let merges: u64 = (0..4).rev().map(|core| p.run(core).unwrap().merges).sum();
        assert_eq!(merges, 7);
        let want: Vec<u8> = (1..=96).collect();
        assert_eq!(io.into_outputs().remove(0).bytes, want);
    }

    #[test]
    fn short_compute_output_is_a_core_fault() {
        struct Short;
        impl ChunkKernel for Short {
            fn name(&self) -> &'static str {
                "short"
            }
            fn copy_in(&self, _: &DeviceIo, _: &ChunkDescriptor) -> Result<Vec<u8>> {
                Ok(Vec::new())
            }
            fn compute(&self, _: &ChunkDescriptor, _: Vec<u8>) -> Result<Vec<u8>> {
                Ok(vec![0; 4])
            }
        }
        let g = geometry(40, 1, 16, 2, false);
        let (io, _) = io(40);
        let ws = Workspace::new(&g);
        let err = ChunkProcessor::new(&g, &Short, &io, &ws).run(0).unwrap_err();
        assert!(matches!(err, DispatchError::DeviceAbort(DeviceFault::CoreFault { core: 0, .. })));
    }
}

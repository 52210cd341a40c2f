//! Core-count and chunk-size solver shared by every operator family.
//!
//! The planner works on a two-level decomposition of the problem:
//!
//! * a [`GridSplit`] cuts the `rows x row_elems` problem into contiguous
//!   *blocks* (several whole rows, or a column slice of one row);
//! * a [`CoreSplit`] hands out consecutive block ranges to cores.
//!
//! Inside a block the kernel walks passes of at most `pass_elems` elements,
//! one pass per copy-in/compute/copy-out iteration. Families with their own
//! grid heuristics build a [`GridSplit`] themselves and call
//! [`TilingPlanner::distribute`]; the rest go through [`TilingPlanner::split`].

use serde::Serialize;
use std::fmt;
use std::ops::Range;
use tracing::{debug, warn};

use npuop_common::math::{block_elems, ceil_align, ceil_div, floor_align};
use npuop_common::{HardwareProfile, Result, TilingError};

use crate::key::TilingKey;
use crate::profile::{DistributionPolicy, OperatorProfile};

/// Coarse size classification used for kernel variant selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SizeRegime {
    /// The whole operand fits one buffer pass.
    Small,
    /// Every chunk footprint is block aligned and rows fit the buffer.
    Aligned,
    /// Rows exceed the buffer and are themselves looped.
    AlignedLastAxisBig,
    /// Some chunk footprint needs the pad/unpad protocol.
    Unaligned,
}

impl fmt::Display for SizeRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Small => write!(f, "small"),
            Self::Aligned => write!(f, "aligned"),
            Self::AlignedLastAxisBig => write!(f, "aligned_big"),
            Self::Unaligned => write!(f, "unaligned"),
        }
    }
}

/// Which axis the planner tiles along.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TileAxis {
    /// Treat the operand as one flat run of elements.
    Flat,
    /// Keep rows whole where they fit, packing several per block.
    Rows,
}

/// Problem-size scalars derived by the shape analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProblemSize {
    pub rows: u64,
    pub row_elems: u64,
    pub elem_bytes: u64,
    pub axis: TileAxis,
}

impl ProblemSize {
    pub fn flat(total: u64, elem_bytes: u64) -> Self {
        Self { rows: 1, row_elems: total, elem_bytes, axis: TileAxis::Flat }
    }

    pub fn rows(rows: u64, row_elems: u64, elem_bytes: u64) -> Self {
        Self { rows, row_elems, elem_bytes, axis: TileAxis::Rows }
    }

    pub fn total(&self) -> u64 {
        self.rows * self.row_elems
    }
}

// ---------------------------------------------------------------------------
// Grid
// ---------------------------------------------------------------------------

/// Contiguous element range of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    pub elem_offset: u64,
    pub elems: u64,
}

/// Cut of a `rows x row_elems` problem into blocks of `row_inner` rows by
/// `col_inner` columns. A block spanning several rows always spans whole
/// rows, so every block is contiguous in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GridSplit {
    pub rows: u64,
    pub row_elems: u64,
    pub row_inner: u64,
    pub col_inner: u64,
}

impl GridSplit {
    pub fn new(rows: u64, row_elems: u64, row_inner: u64, col_inner: u64) -> Result<Self> {
        let row_inner = row_inner.clamp(1, rows.max(1));
        let col_inner = col_inner.clamp(1, row_elems.max(1));
        if row_inner > 1 && col_inner < row_elems {
            return Err(TilingError::Schema(format!(
                "grid block of {row_inner} rows must span whole rows of {row_elems}, got {col_inner} columns"
            )));
        }
        Ok(Self { rows, row_elems, row_inner, col_inner })
    }

    /// One block per `chunk` elements of a flat run.
    pub fn flat(total: u64, chunk: u64) -> Self {
        Self { rows: 1, row_elems: total, row_inner: 1, col_inner: chunk.clamp(1, total.max(1)) }
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.row_elems == 0
    }

    pub fn total_elems(&self) -> u64 {
        self.rows * self.row_elems
    }

    pub fn row_outer(&self) -> u64 {
        ceil_div(self.rows, self.row_inner)
    }

    pub fn row_tail(&self) -> u64 {
        self.rows - self.row_outer().saturating_sub(1) * self.row_inner
    }

    pub fn col_outer(&self) -> u64 {
        ceil_div(self.row_elems, self.col_inner)
    }

    pub fn col_tail(&self) -> u64 {
        self.row_elems - self.col_outer().saturating_sub(1) * self.col_inner
    }

    pub fn block_count(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.row_outer() * self.col_outer()
        }
    }

    pub fn block_span(&self, block: u64) -> BlockSpan {
        let col_outer = self.col_outer().max(1);
        let r = block / col_outer;
        let c = block % col_outer;
        let rows_here = if r + 1 == self.row_outer() { self.row_tail() } else { self.row_inner };
        let cols_here = if c + 1 == col_outer { self.col_tail() } else { self.col_inner };
        BlockSpan {
            elem_offset: r * self.row_inner * self.row_elems + c * self.col_inner,
            elems: rows_here * cols_here,
        }
    }

    /// Distinct block sizes, for footprint checks without walking every block.
    fn block_sizes(&self) -> Vec<u64> {
        let mut sizes = if self.col_outer() == 1 {
            vec![self.row_inner * self.row_elems, self.row_tail() * self.row_elems]
        } else {
            vec![self.col_inner, self.col_tail()]
        };
        sizes.sort_unstable();
        sizes.dedup();
        sizes
    }
}

// ---------------------------------------------------------------------------
// Core split
// ---------------------------------------------------------------------------

/// Assignment of consecutive block ranges to cores: the first `big_cores`
/// cores take `normal_blocks` each, the remaining ones `small_blocks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CoreSplit {
    pub used_core_num: u64,
    pub normal_blocks: u64,
    pub big_cores: u64,
    pub small_blocks: u64,
}

impl CoreSplit {
    /// Everything on core 0.
    pub fn single(blocks: u64) -> Self {
        Self { used_core_num: 1, normal_blocks: blocks, big_cores: 1, small_blocks: 0 }
    }

    pub fn even(blocks: u64, core_count: u64) -> Self {
        if blocks == 0 || core_count <= 1 {
            return Self::single(blocks);
        }
        let used = core_count.min(blocks);
        let base = blocks / used;
        let extra = blocks % used;
        if extra == 0 {
            Self { used_core_num: used, normal_blocks: base, big_cores: used, small_blocks: base }
        } else {
            Self { used_core_num: used, normal_blocks: base + 1, big_cores: extra, small_blocks: base }
        }
    }

    pub fn last_core_tail(blocks: u64, core_count: u64, min_blocks: u64) -> Self {
        if blocks == 0 || core_count <= 1 {
            return Self::single(blocks);
        }
        let normal = ceil_div(blocks, core_count).max(min_blocks).max(1);
        let used = ceil_div(blocks, normal);
        let last = blocks - (used - 1) * normal;
        Self { used_core_num: used, normal_blocks: normal, big_cores: used - 1, small_blocks: last }
    }

    pub fn for_policy(policy: DistributionPolicy, blocks: u64, core_count: u64) -> Self {
        match policy {
            DistributionPolicy::EvenBlocks => Self::even(blocks, core_count),
            DistributionPolicy::LastCoreTail { min_blocks } => {
                Self::last_core_tail(blocks, core_count, min_blocks)
            }
        }
    }

    pub fn block_range(&self, core: u64) -> Range<u64> {
        if core >= self.used_core_num {
            return 0..0;
        }
        if core < self.big_cores {
            let start = core * self.normal_blocks;
            start..start + self.normal_blocks
        } else {
            let start = self.big_cores * self.normal_blocks + (core - self.big_cores) * self.small_blocks;
            start..start + self.small_blocks
        }
    }

    pub fn total_blocks(&self) -> u64 {
        let big = self.big_cores.min(self.used_core_num);
        big * self.normal_blocks + (self.used_core_num - big) * self.small_blocks
    }
}

// ---------------------------------------------------------------------------
// Geometry and chunks
// ---------------------------------------------------------------------------

/// One copy-in/compute/copy-out iteration on one core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub core: u64,
    /// Iteration index on this core, counted across blocks.
    pub iter: u64,
    pub block: u64,
    pub elem_offset: u64,
    pub elems: u64,
}

impl ChunkDescriptor {
    pub fn byte_offset(&self, elem_bytes: u64) -> u64 {
        self.elem_offset * elem_bytes
    }

    pub fn byte_len(&self, elem_bytes: u64) -> u64 {
        self.elems * elem_bytes
    }

    pub fn elem_range(&self) -> Range<u64> {
        self.elem_offset..self.elem_offset + self.elems
    }
}

/// Everything the device side needs to walk its chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlanGeometry {
    pub grid: GridSplit,
    pub cores: CoreSplit,
    /// Elements per buffer pass.
    pub pass_elems: u64,
    pub elem_bytes: u64,
    pub align_bytes: u64,
    /// Unaligned core boundaries are staged through per-core scratch.
    pub tail_merge: bool,
    pub scratch_stride_bytes: u64,
    pub buffer_num: u64,
    pub regime: SizeRegime,
}

impl PlanGeometry {
    pub fn used_core_num(&self) -> u64 {
        self.cores.used_core_num
    }

    pub fn total_elems(&self) -> u64 {
        self.grid.total_elems()
    }

    fn passes(&self, elems: u64) -> u64 {
        ceil_div(elems, self.pass_elems.max(1))
    }

    /// Chunks of `core` in execution order; empty for idle cores.
    pub fn core_chunks(&self, core: u64) -> Vec<ChunkDescriptor> {
        let pass = self.pass_elems.max(1);
        let mut chunks = Vec::new();
        let mut iter = 0;
        for block in self.cores.block_range(core) {
            let span = self.grid.block_span(block);
            let mut done = 0;
            while done < span.elems {
                let elems = pass.min(span.elems - done);
                chunks.push(ChunkDescriptor {
                    core,
                    iter,
                    block,
                    elem_offset: span.elem_offset + done,
                    elems,
                });
                done += elems;
                iter += 1;
            }
        }
        chunks
    }

    /// All chunks of all cores, core-major.
    pub fn chunks(&self) -> Vec<ChunkDescriptor> {
        (0..self.used_core_num()).flat_map(|core| self.core_chunks(core)).collect()
    }

    /// Element count of the uniform iteration.
    pub fn main_chunk_elems(&self) -> u64 {
        if self.grid.is_empty() {
            return 0;
        }
        self.grid.block_span(0).elems.min(self.pass_elems.max(1))
    }

    /// Element count of `core`'s final iteration when it is shorter than the
    /// uniform one, else 0.
    pub fn core_tail_elems(&self, core: u64) -> u64 {
        let main = self.main_chunk_elems();
        match self.last_chunk_elems(core) {
            Some(last) if last < main => last,
            _ => 0,
        }
    }

    pub fn tail_chunk_elems(&self) -> u64 {
        self.core_tail_elems(self.used_core_num().saturating_sub(1))
    }

    /// One past the last element `core` owns; `None` for idle cores.
    pub fn core_end_elem(&self, core: u64) -> Option<u64> {
        let blocks = self.cores.block_range(core);
        if blocks.is_empty() || self.grid.is_empty() {
            return None;
        }
        let span = self.grid.block_span(blocks.end - 1);
        Some(span.elem_offset + span.elems)
    }

    /// Element count of `core`'s final iteration; `None` for idle cores.
    fn last_chunk_elems(&self, core: u64) -> Option<u64> {
        let blocks = self.cores.block_range(core);
        if blocks.is_empty() || self.grid.is_empty() {
            return None;
        }
        let span = self.grid.block_span(blocks.end - 1).elems;
        let pass = self.pass_elems.max(1);
        match span % pass {
            0 => Some(pass.min(span)),
            rem => Some(rem),
        }
    }

    /// Iterations of exactly `main_chunk_elems` on `core`. Blocks fall into
    /// four size classes (last grid row or not, last grid column or not), so
    /// the count is a sum over classes rather than over chunks.
    fn full_chunks_on(&self, core: u64) -> u64 {
        let main = self.main_chunk_elems();
        let Range { start, end } = self.cores.block_range(core);
        if main == 0 || start >= end {
            return 0;
        }
        let g = &self.grid;
        let cols = g.col_outer().max(1);
        let last_block = g.row_outer() * cols - 1;
        let last_row = end.saturating_sub(start.max(last_block + 1 - cols));
        let last_col = end / cols - start / cols;
        let corner = u64::from((start..end).contains(&last_block));
        let interior = (end - start) + corner - last_row - last_col;

        let full = |rows: u64, cols: u64| rows * cols / main;
        let (ri, rt, ci, ct) = (g.row_inner, g.row_tail(), g.col_inner, g.col_tail());
        interior * full(ri, ci)
            + (last_col - corner) * full(ri, ct)
            + (last_row - corner) * full(rt, ci)
            + corner * full(rt, ct)
    }

    pub fn loop_num_per_core(&self) -> u64 {
        self.full_chunks_on(0)
    }

    pub fn tail_loop_num_on_last_core(&self) -> u64 {
        self.full_chunks_on(self.used_core_num().saturating_sub(1))
    }

    /// Whether some core's final chunk, with another core after it, has a
    /// footprint that is not block aligned. Padding that chunk would write
    /// into the neighbour's first elements.
    pub fn has_unaligned_core_boundary(&self) -> bool {
        let last = self.used_core_num().saturating_sub(1);
        (0..last).any(|core| {
            self.last_chunk_elems(core)
                .is_some_and(|elems| elems * self.elem_bytes % self.align_bytes != 0)
        })
    }

    /// The same chunking viewed in elements of `elem_bytes`.
    pub fn with_elem_bytes(&self, elem_bytes: u64) -> Self {
        Self { elem_bytes, ..*self }
    }

    /// Distinct iteration sizes in elements.
    pub fn chunk_sizes(&self) -> Vec<u64> {
        if self.grid.is_empty() {
            return Vec::new();
        }
        let pass = self.pass_elems.max(1);
        let mut sizes = Vec::new();
        for block in self.grid.block_sizes() {
            if block >= pass {
                sizes.push(pass);
            }
            if block % pass != 0 {
                sizes.push(block % pass);
            }
        }
        sizes.sort_unstable();
        sizes.dedup();
        sizes
    }

    fn classify(&self) -> SizeRegime {
        let blocks = self.grid.block_count();
        if blocks <= 1 && self.passes(self.grid.total_elems()) <= 1 {
            return SizeRegime::Small;
        }
        let unaligned =
            self.chunk_sizes().iter().any(|&e| (e * self.elem_bytes) % self.align_bytes != 0);
        if unaligned {
            SizeRegime::Unaligned
        } else if self.grid.col_outer() > 1 {
            SizeRegime::AlignedLastAxisBig
        } else {
            SizeRegime::Aligned
        }
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Output of one tiling run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TilingPlan {
    pub geometry: PlanGeometry,
    pub workspace_bytes: u64,
    pub tiling_key: TilingKey,
}

impl TilingPlan {
    pub fn used_core_num(&self) -> u64 {
        self.geometry.used_core_num()
    }

    pub fn main_chunk_elems(&self) -> u64 {
        self.geometry.main_chunk_elems()
    }

    pub fn tail_chunk_elems(&self) -> u64 {
        self.geometry.tail_chunk_elems()
    }

    pub fn loop_num_per_core(&self) -> u64 {
        self.geometry.loop_num_per_core()
    }

    pub fn tail_loop_num_on_last_core(&self) -> u64 {
        self.geometry.tail_loop_num_on_last_core()
    }

    pub fn regime(&self) -> SizeRegime {
        self.geometry.regime
    }
}

impl fmt::Display for TilingPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let g = &self.geometry;
        let wire = self.tiling_key.to_wire().map(|k| k.to_string()).unwrap_or_else(|_| "-".into());
        writeln!(f, "tiling_key: {wire} ({})", self.tiling_key)?;
        writeln!(f, "regime: {}", g.regime)?;
        writeln!(f, "used_core_num: {}", g.used_core_num())?;
        writeln!(
            f,
            "grid: rows={} row_elems={} row_inner={} col_inner={} blocks={}",
            g.grid.rows,
            g.grid.row_elems,
            g.grid.row_inner,
            g.grid.col_inner,
            g.grid.block_count()
        )?;
        writeln!(
            f,
            "cores: normal_blocks={} big_cores={} small_blocks={}",
            g.cores.normal_blocks, g.cores.big_cores, g.cores.small_blocks
        )?;
        writeln!(f, "pass_elems: {}", g.pass_elems)?;
        writeln!(f, "main_chunk_elems: {}", self.main_chunk_elems())?;
        writeln!(f, "tail_chunk_elems: {}", self.tail_chunk_elems())?;
        writeln!(f, "loop_num_per_core: {}", self.loop_num_per_core())?;
        writeln!(f, "tail_loop_num_on_last_core: {}", self.tail_loop_num_on_last_core())?;
        writeln!(f, "tail_merge: {}", g.tail_merge)?;
        write!(f, "workspace_bytes: {}", self.workspace_bytes)
    }
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

/// Parameterised chunking solver for one operator profile on one platform.
#[derive(Debug, Clone, Copy)]
pub struct TilingPlanner<'a> {
    profile: &'a OperatorProfile,
    hardware: &'a HardwareProfile,
}

impl<'a> TilingPlanner<'a> {
    pub fn new(profile: &'a OperatorProfile, hardware: &'a HardwareProfile) -> Self {
        Self { profile, hardware }
    }

    pub fn profile(&self) -> &OperatorProfile {
        self.profile
    }

    pub fn hardware(&self) -> &HardwareProfile {
        self.hardware
    }

    /// Elements per DMA block for `elem_bytes`, raised to the profile's
    /// granularity.
    pub fn granule(&self, elem_bytes: u64) -> u64 {
        let block = block_elems(self.hardware.align_bytes, elem_bytes);
        ceil_align(self.profile.min_align_granularity.max(1), block)
    }

    /// Largest aligned element count one buffer slot can hold.
    pub fn max_elems_per_chunk(&self, elem_bytes: u64) -> Result<u64> {
        let usable = self.hardware.ub_bytes.saturating_sub(self.profile.reserved_ub_bytes);
        let buffers = self.profile.buffers_per_element.max(1);
        let granule = self.granule(elem_bytes);
        let raw = usable / buffers / elem_bytes.max(1);
        let max = floor_align(raw, granule);
        if max == 0 {
            return Err(TilingError::InsufficientBuffer {
                required: granule * elem_bytes * buffers + self.profile.reserved_ub_bytes,
                available: self.hardware.ub_bytes,
            });
        }
        Ok(max)
    }

    /// Solve the grid for `problem` and distribute it over cores.
    pub fn split(&self, problem: &ProblemSize) -> Result<PlanGeometry> {
        let total = problem.total();
        if total == 0 {
            if !self.profile.allow_empty {
                return Err(TilingError::empty(
                    self.profile.name,
                    "input",
                    &[problem.rows, problem.row_elems],
                ));
            }
            let grid = GridSplit::new(problem.rows, problem.row_elems, 1, 1)?;
            return self.distribute(grid, 1, problem.elem_bytes);
        }

        let max = self.max_elems_per_chunk(problem.elem_bytes)?;
        let grid = match problem.axis {
            TileAxis::Flat => GridSplit::flat(total, max),
            TileAxis::Rows => {
                let block = block_elems(self.hardware.align_bytes, problem.elem_bytes);
                let row_aligned = ceil_align(problem.row_elems, block);
                let rows_per_chunk = max / row_aligned;
                if rows_per_chunk == 0 {
                    GridSplit::new(problem.rows, problem.row_elems, 1, max)?
                } else {
                    GridSplit::new(problem.rows, problem.row_elems, rows_per_chunk, problem.row_elems)?
                }
            }
        };
        self.distribute(grid, max, problem.elem_bytes)
    }

    /// Spread a precomputed grid over cores.
    pub fn distribute(&self, grid: GridSplit, pass_elems: u64, elem_bytes: u64) -> Result<PlanGeometry> {
        self.distribute_for_output(grid, pass_elems, elem_bytes, elem_bytes)
    }

    /// [`distribute`](Self::distribute) for kernels whose output elements
    /// are `out_elem_bytes` wide. A core boundary that is unaligned in
    /// either width needs the tail merge.
    pub fn distribute_for_output(
        &self,
        grid: GridSplit,
        pass_elems: u64,
        elem_bytes: u64,
        out_elem_bytes: u64,
    ) -> Result<PlanGeometry> {
        self.hardware.check()?;
        let blocks = grid.block_count();
        let cores = CoreSplit::for_policy(self.profile.distribution, blocks, self.hardware.core_count);
        let mut geometry = self.assign(grid, cores, pass_elems, elem_bytes);

        let unaligned = geometry.has_unaligned_core_boundary()
            || geometry.with_elem_bytes(out_elem_bytes).has_unaligned_core_boundary();
        if unaligned {
            if self.profile.supports_tail_merge_across_cores {
                geometry.tail_merge = true;
                geometry.scratch_stride_bytes = self.hardware.align_bytes;
            } else {
                warn!(
                    op = self.profile.name,
                    used_core_num = cores.used_core_num,
                    "unaligned core boundary without tail merge support, falling back to one core"
                );
                geometry.cores = CoreSplit::single(blocks);
            }
        }

        debug!(
            op = self.profile.name,
            used_core_num = geometry.cores.used_core_num,
            blocks,
            pass_elems = geometry.pass_elems,
            regime = %geometry.regime,
            tail_merge = geometry.tail_merge,
            "tiling geometry computed"
        );
        Ok(geometry)
    }

    /// Geometry over a caller-chosen core split. No boundary check is made,
    /// so this is only for kernels that combine results with atomics instead
    /// of copying chunks out.
    pub fn assign(&self, grid: GridSplit, cores: CoreSplit, pass_elems: u64, elem_bytes: u64) -> PlanGeometry {
        let mut geometry = PlanGeometry {
            grid,
            cores,
            pass_elems: pass_elems.max(1),
            elem_bytes,
            align_bytes: self.hardware.align_bytes,
            tail_merge: false,
            scratch_stride_bytes: 0,
            buffer_num: self.profile.buffer_num,
            regime: SizeRegime::Small,
        };
        geometry.regime = geometry.classify();
        geometry
    }

    /// Attach the key and workspace size. `extra_workspace` is whatever the
    /// family needs on top of the system workspace and tail-merge scratch.
    pub fn finish(
        &self,
        geometry: PlanGeometry,
        tiling_key: TilingKey,
        system_workspace_bytes: u64,
        extra_workspace: u64,
    ) -> TilingPlan {
        let workspace_bytes =
            crate::workspace::workspace_bytes(&geometry, system_workspace_bytes, extra_workspace);
        debug!(op = self.profile.name, key = %tiling_key, workspace_bytes, "tiling plan computed");
        TilingPlan { geometry, workspace_bytes, tiling_key }
    }

    /// Split and finish in one go, resolving the key from the geometry.
    pub fn plan<F>(&self, problem: &ProblemSize, system_workspace_bytes: u64, resolve_key: F) -> Result<TilingPlan>
    where
        F: FnOnce(&PlanGeometry) -> Result<TilingKey>,
    {
        let geometry = self.split(problem)?;
        let key = resolve_key(&geometry)?;
        Ok(self.finish(geometry, key, system_workspace_bytes, 0))
    }
}

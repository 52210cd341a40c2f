//! `scatter_add`: `var[indices[i], ..] += updates[i, ..]`.
//!
//! Rows of `updates` are the unit of work. Wide rows go to the SIMD kernel,
//! which cuts the `indices x var_cols` plane into a row by column grid of
//! tiles, one per core. Narrow rows go to the SIMT kernel, which strides over
//! every update element on all cores. Element types without a hardware
//! atomic add are first cast into an int32 shadow of `var` in workspace
//! (the copy phase), accumulated there and cast back.

use std::collections::BTreeSet;

use tracing::debug;

use npuop_common::math::{ceil_align, ceil_div, floor_align};
use npuop_common::{DType, HardwareProfile, Result, TilingError};

use crate::analyzer::{analyze_index_scatter, ScatterProblem};
use crate::blob::{concat_fields, u32f, u64f, BlobReader, BlobSchema, BlobWriter, FieldDef};
use crate::key::{KeySpace, ScatterKey, ScatterTemplate, TilingKey};
use crate::ops::{emit, OperatorTiling};
use crate::planner::{CoreSplit, GridSplit, PlanGeometry, ProblemSize, TilingPlanner};
use crate::profile::OperatorProfile;
use crate::registry::{TilingContext, TilingOutput};

pub const NAME: &str = "scatter_add";

/// Rows narrower than this many bytes take the SIMT kernel.
pub const SIMT_ROW_BYTES: u64 = 128;
/// Buffer the SIMD kernels keep back for their own use.
pub const SIMD_RESERVED_UB: u64 = 8 * 1024;
/// Data cache carved out of the buffer by the SIMT kernel.
pub const SIMT_DCACHE_BYTES: u64 = 128 * 1024;
/// The column base is not halved below this many elements.
pub const MIN_BASE_COL: u64 = 256;
/// Smallest copy-phase slice per core, in bytes.
pub const MIN_COPY_BYTES: u64 = 1024;

const BUFFER_NUM: u64 = 2;
const CAST_BYTES: u64 = 4;

/// Whether the kernel for `template` can atomically add `dtype` in place.
pub fn has_atomic_add(template: ScatterTemplate, dtype: DType) -> bool {
    match template {
        ScatterTemplate::Simd => dtype != DType::UInt8,
        ScatterTemplate::Simt => !matches!(dtype, DType::UInt8 | DType::Int8),
    }
}

// ---------------------------------------------------------------------------
// Row x column cut
// ---------------------------------------------------------------------------

/// Candidate row-tile counts for `cores`: every `m` up to `sqrt(cores) + 1`
/// and its cofactor `cores / m`.
pub fn unique_cuts(cores: u64) -> BTreeSet<u64> {
    let upper = ((cores as f64).sqrt() + 1.0).ceil() as u64;
    (1..upper).flat_map(|m| [m, cores / m]).collect()
}

/// Split `rows x col_pieces` over `cores` tiles. Prefers cuts that use every
/// core, then the smallest imbalance between a full tile and the tail tile,
/// then fewer row tiles. Rows no wider than `col_limit_bytes` are never cut
/// by column.
pub fn row_col_cut(cores: u64, rows: u64, col_pieces: u64, row_bytes: u64, col_limit_bytes: u64) -> (u64, u64) {
    let mut best: Option<(u64, u64, u64)> = None;
    for m in unique_cuts(cores) {
        if m > rows {
            continue;
        }
        let n = (cores / m).max(1);
        if n > col_pieces || (row_bytes <= col_limit_bytes && n > 1) {
            continue;
        }
        let row_block = ceil_div(rows, m);
        let col_block = ceil_div(col_pieces, n);
        let mut delta = row_block * col_block;
        if m * n == cores {
            let row_tail = rows % m;
            let col_tail = col_pieces % n;
            if row_tail == 0 && col_tail == 0 {
                return (m, n);
            }
            let row_part = if row_tail == 0 { row_block } else { rows % row_block };
            let col_part = if col_tail == 0 { col_block } else { col_pieces % col_block };
            delta -= row_part * col_part;
        }
        if best.map_or(true, |(d, bm, _)| (delta, m) < (d, bm)) {
            best = Some((delta, m, n));
        }
    }
    best.map_or((cores.min(rows).max(1), 1), |(_, m, n)| (m, n))
}

/// Tile cut of the SIMD kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TileCut {
    pub row_tile_num: u64,
    pub col_tile_num: u64,
    pub norm_block_row: u64,
    pub tail_block_row: u64,
    pub norm_block_col: u64,
    pub tail_block_col: u64,
    /// Update rows staged per buffer pass.
    pub ub_factor_row: u64,
    /// Columns staged per buffer pass.
    pub ub_factor_col: u64,
}

impl TileCut {
    pub fn tiles(&self) -> u64 {
        self.row_tile_num * self.col_tile_num
    }

    /// Normalize a `(rows, cols)` tile count into whole aligned blocks.
    fn from_counts(rows: u64, cols: u64, row_tiles: u64, col_tiles: u64, col_align: u64) -> Self {
        let norm_block_row = ceil_div(rows, row_tiles.max(1));
        let norm_block_col = ceil_align(ceil_div(cols, col_tiles.max(1)), col_align);
        let row_tile_num = ceil_div(rows, norm_block_row);
        let col_tile_num = ceil_div(cols, norm_block_col);
        Self {
            row_tile_num,
            col_tile_num,
            norm_block_row,
            tail_block_row: rows - (row_tile_num - 1) * norm_block_row,
            norm_block_col,
            tail_block_col: cols - (col_tile_num - 1) * norm_block_col,
            ub_factor_row: 0,
            ub_factor_col: 0,
        }
    }
}

/// Tiling of the cast/copy phase over the flattened `var`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CopyPhase {
    pub copy_core_num: u64,
    pub per_core_var: u64,
    pub ub_factor: u64,
}

impl CopyPhase {
    pub fn new(var_elems: u64, elem_bytes: u64, cores: u64, ub: u64) -> Self {
        let per_core_var = ceil_div(var_elems, cores).max(MIN_COPY_BYTES / elem_bytes);
        Self {
            copy_core_num: ceil_div(var_elems, per_core_var),
            per_core_var,
            ub_factor: floor_align(ub / BUFFER_NUM / (CAST_BYTES + elem_bytes), 32),
        }
    }
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

/// Everything decided for one call before serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScatterSchedule {
    pub template: ScatterTemplate,
    pub atomic_add: bool,
    pub ub_bytes: u64,
    pub cut: TileCut,
    pub atomic_core_num: u64,
    pub copy: CopyPhase,
}

impl ScatterSchedule {
    /// Cores the launch needs: every tile, or every copy slice if there are
    /// more of those. SIMT kernels run on the whole device.
    pub fn block_dim(&self, hardware: &HardwareProfile) -> u64 {
        match self.template {
            ScatterTemplate::Simt => hardware.core_count,
            ScatterTemplate::Simd => self.atomic_core_num.max(self.copy.copy_core_num).max(1),
        }
    }

    /// Extra workspace for the int32 shadow of `var`.
    pub fn extra_workspace(&self, var_elems: u64) -> u64 {
        if self.atomic_add {
            0
        } else {
            CAST_BYTES * var_elems
        }
    }
}

fn simd_atomic(p: &ScatterProblem, ub: u64, cores: u64, align: u64) -> Result<TileCut> {
    let upd = p.dtype.size_bytes();
    let idx = p.index_dtype.size_bytes();
    let col_align = (align / upd).max(1);

    let staged = ub.saturating_sub(BUFFER_NUM * (align + idx));
    let mut max_base_col = floor_align(staged / BUFFER_NUM / upd, col_align);
    if max_base_col == 0 {
        return Err(TilingError::InsufficientBuffer {
            required: BUFFER_NUM * (align + idx + col_align * upd),
            available: ub,
        });
    }
    let mut col_pieces = ceil_div(p.var_cols, max_base_col);
    let mut busy = cores.min(p.indices_num * col_pieces);
    while busy <= cores / 2 && max_base_col > MIN_BASE_COL {
        max_base_col = ceil_align(max_base_col / 2, col_align);
        col_pieces = ceil_div(p.var_cols, max_base_col);
        busy = cores.min(p.indices_num * col_pieces);
    }
    let busy = busy.max(1);

    let (m, n) = row_col_cut(busy, p.indices_num, col_pieces, p.var_cols * upd, max_base_col * upd);
    let mut cut = TileCut::from_counts(p.indices_num, p.var_cols, m, n, col_align);
    cut.ub_factor_col = cut.norm_block_col.min(max_base_col);
    cut.ub_factor_row = (ub - BUFFER_NUM * align) / BUFFER_NUM / (cut.ub_factor_col * upd + idx);
    debug!(max_base_col, busy, row_tiles = m, col_tiles = n, "scatter_add SIMD cut");
    Ok(cut)
}

/// Row-only cut for dtypes accumulated in the int32 shadow.
fn simd_shadow(p: &ScatterProblem, ub: u64, cores: u64, align: u64) -> TileCut {
    let var_bytes = p.dtype.size_bytes();
    let idx = p.index_dtype.size_bytes();
    let upd = if p.scalar_updates { CAST_BYTES } else { CAST_BYTES + var_bytes };
    let col_align = (align / var_bytes).max(1);

    let per_core = ceil_div(p.indices_num, cores);
    let mut cut = TileCut::from_counts(p.indices_num, p.var_cols, ceil_div(p.indices_num, per_core), 1, 1);

    let mut cols = ceil_align(p.var_cols, col_align);
    let rows = if cols * upd > (ub - MIN_COPY_BYTES) / BUFFER_NUM {
        let idx_bytes = MIN_COPY_BYTES.min(per_core * idx);
        let rows = ceil_align(idx_bytes, align) / idx;
        let available = (ub - rows * idx) / BUFFER_NUM / upd;
        cols = floor_align(p.var_cols.min(available), col_align);
        rows
    } else {
        floor_align(ub - cols * upd * BUFFER_NUM, align) / idx
    };
    cut.ub_factor_row = rows;
    cut.ub_factor_col = cols;
    cut
}

/// Choose kernel, cut and copy phase for a non-empty problem.
pub fn schedule(p: &ScatterProblem, hardware: &HardwareProfile) -> Result<ScatterSchedule> {
    let cores = hardware.core_count;
    let align = hardware.align_bytes;
    let template = if p.var_cols * p.dtype.size_bytes() < SIMT_ROW_BYTES {
        ScatterTemplate::Simt
    } else {
        ScatterTemplate::Simd
    };
    let atomic_add = has_atomic_add(template, p.dtype);

    let base_reserve = match template {
        ScatterTemplate::Simt => SIMT_DCACHE_BYTES,
        ScatterTemplate::Simd => SIMD_RESERVED_UB,
    };
    // The atomic SIMD kernel keeps a second reserve for its accumulator.
    let reserved = if template == ScatterTemplate::Simd && atomic_add {
        base_reserve + SIMD_RESERVED_UB
    } else {
        base_reserve
    };
    if hardware.ub_bytes <= reserved + MIN_COPY_BYTES {
        return Err(TilingError::InsufficientBuffer {
            required: reserved + MIN_COPY_BYTES + 1,
            available: hardware.ub_bytes,
        });
    }
    let ub = hardware.ub_bytes - base_reserve;

    let copy = if atomic_add {
        CopyPhase::default()
    } else {
        CopyPhase::new(p.var_elems(), p.dtype.size_bytes(), cores, ub)
    };

    let (cut, atomic_core_num) = match (template, atomic_add) {
        (ScatterTemplate::Simt, _) => (TileCut::default(), 0),
        (ScatterTemplate::Simd, true) => {
            let cut = simd_atomic(p, ub - SIMD_RESERVED_UB, cores, align)?;
            (cut, cut.tiles())
        }
        (ScatterTemplate::Simd, false) => {
            let cut = simd_shadow(p, ub, cores, align);
            (cut, cut.tiles())
        }
    };
    Ok(ScatterSchedule { template, atomic_add, ub_bytes: ub, cut, atomic_core_num, copy })
}

/// Header geometry: SIMD tiles as blocks of update elements, or for SIMT an
/// even spread of update rows over the device.
fn geometry(planner: &TilingPlanner<'_>, p: &ScatterProblem, s: &ScatterSchedule, cores: u64) -> Result<PlanGeometry> {
    let eb = p.dtype.size_bytes();
    let (grid, spread, pass) = match s.template {
        ScatterTemplate::Simd if s.cut.col_tile_num <= 1 => (
            GridSplit::new(p.indices_num, p.var_cols, s.cut.norm_block_row, p.var_cols)?,
            s.atomic_core_num,
            s.cut.ub_factor_row.max(1) * s.cut.ub_factor_col,
        ),
        ScatterTemplate::Simd => (
            GridSplit::new(p.indices_num, p.var_cols, 1, s.cut.norm_block_col)?,
            s.atomic_core_num,
            s.cut.ub_factor_col,
        ),
        ScatterTemplate::Simt => {
            let rows = ceil_div(p.indices_num, cores);
            (GridSplit::new(p.indices_num, p.var_cols, rows, p.var_cols)?, cores, rows * p.var_cols)
        }
    };
    let split = CoreSplit::last_core_tail(grid.block_count(), spread, 1);
    Ok(planner.assign(grid, split, pass, eb))
}

// ---------------------------------------------------------------------------
// Blob
// ---------------------------------------------------------------------------

const EXT_FIELDS: [FieldDef; 18] = [
    u64f("var_rows"),
    u64f("var_cols"),
    u64f("indices_num"),
    u64f("row_tile_num"),
    u64f("col_tile_num"),
    u64f("norm_block_row"),
    u64f("tail_block_row"),
    u64f("norm_block_col"),
    u64f("tail_block_col"),
    u64f("ub_factor_row"),
    u64f("ub_factor_col"),
    u64f("atomic_core_num"),
    u64f("copy_core_num"),
    u64f("per_core_var"),
    u64f("copy_ub_factor"),
    u64f("ub_bytes"),
    u32f("atomic_add"),
    u32f("index_bytes"),
];
static FIELDS: [FieldDef; 37] = concat_fields(&EXT_FIELDS);
pub static SCATTER_ADD_SCHEMA: BlobSchema = BlobSchema { name: NAME, version: 1, fields: &FIELDS };

/// Fields the kernel needs beyond the common header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScatterAddParams {
    pub var_rows: u64,
    pub var_cols: u64,
    pub indices_num: u64,
    pub cut: TileCut,
    pub atomic_core_num: u64,
    pub copy: CopyPhase,
    pub ub_bytes: u64,
    pub atomic_add: bool,
    pub index_bytes: u32,
}

impl ScatterAddParams {
    pub fn read(r: &mut BlobReader<'_>) -> Result<Self> {
        let var_rows = r.u64("var_rows")?;
        let var_cols = r.u64("var_cols")?;
        let indices_num = r.u64("indices_num")?;
        let cut = TileCut {
            row_tile_num: r.u64("row_tile_num")?,
            col_tile_num: r.u64("col_tile_num")?,
            norm_block_row: r.u64("norm_block_row")?,
            tail_block_row: r.u64("tail_block_row")?,
            norm_block_col: r.u64("norm_block_col")?,
            tail_block_col: r.u64("tail_block_col")?,
            ub_factor_row: r.u64("ub_factor_row")?,
            ub_factor_col: r.u64("ub_factor_col")?,
        };
        let atomic_core_num = r.u64("atomic_core_num")?;
        let copy = CopyPhase {
            copy_core_num: r.u64("copy_core_num")?,
            per_core_var: r.u64("per_core_var")?,
            ub_factor: r.u64("copy_ub_factor")?,
        };
        Ok(Self {
            var_rows,
            var_cols,
            indices_num,
            cut,
            atomic_core_num,
            copy,
            ub_bytes: r.u64("ub_bytes")?,
            atomic_add: r.u32("atomic_add")? != 0,
            index_bytes: r.u32("index_bytes")?,
        })
    }

    fn write(&self, w: &mut BlobWriter) -> Result<()> {
        w.put_u64("var_rows", self.var_rows)?;
        w.put_u64("var_cols", self.var_cols)?;
        w.put_u64("indices_num", self.indices_num)?;
        w.put_u64("row_tile_num", self.cut.row_tile_num)?;
        w.put_u64("col_tile_num", self.cut.col_tile_num)?;
        w.put_u64("norm_block_row", self.cut.norm_block_row)?;
        w.put_u64("tail_block_row", self.cut.tail_block_row)?;
        w.put_u64("norm_block_col", self.cut.norm_block_col)?;
        w.put_u64("tail_block_col", self.cut.tail_block_col)?;
        w.put_u64("ub_factor_row", self.cut.ub_factor_row)?;
        w.put_u64("ub_factor_col", self.cut.ub_factor_col)?;
        w.put_u64("atomic_core_num", self.atomic_core_num)?;
        w.put_u64("copy_core_num", self.copy.copy_core_num)?;
        w.put_u64("per_core_var", self.copy.per_core_var)?;
        w.put_u64("copy_ub_factor", self.copy.ub_factor)?;
        w.put_u64("ub_bytes", self.ub_bytes)?;
        w.put_u32("atomic_add", u32::from(self.atomic_add))?;
        w.put_u32("index_bytes", self.index_bytes)
    }
}

// ---------------------------------------------------------------------------
// Operator
// ---------------------------------------------------------------------------

const PROFILE: OperatorProfile = OperatorProfile::new(NAME, BUFFER_NUM).with_empty_allowed(true);

#[derive(Debug, Clone, Copy, Default)]
pub struct ScatterAdd;

impl OperatorTiling for ScatterAdd {
    fn name(&self) -> &'static str {
        NAME
    }

    fn key_space(&self) -> KeySpace {
        KeySpace::ScatterAdd
    }

    fn schema(&self) -> &'static BlobSchema {
        &SCATTER_ADD_SCHEMA
    }

    fn tile(&self, ctx: &TilingContext) -> Result<TilingOutput> {
        let var = ctx.input(NAME, 0, "var")?;
        let indices = ctx.input(NAME, 1, "indices")?;
        let updates = ctx.input(NAME, 2, "updates")?;
        let out = ctx.output(NAME, 0, "var")?;
        let problem = analyze_index_scatter(NAME, var, indices, updates, None, &ctx.attrs)?;
        if out.dims != var.dims || out.dtype != var.dtype {
            return Err(TilingError::shape_mismatch(
                NAME,
                format!("output {:?} {} must match var {:?} {}", out.dims, out.dtype, var.dims, var.dtype),
            ));
        }
        let planner = TilingPlanner::new(&PROFILE, &ctx.hardware);
        let index_bytes = problem.index_dtype.size_bytes() as u32;

        if problem.is_empty() {
            debug!(var = ?var.dims, indices = ?indices.dims, "scatter_add has nothing to do");
            let geometry = planner.split(&ProblemSize::rows(
                problem.indices_num,
                problem.var_cols,
                problem.dtype.size_bytes(),
            ))?;
            let plan = planner.finish(geometry, TilingKey::ScatterAdd(ScatterKey::Empty), ctx.system_workspace_bytes, 0);
            let params = ScatterAddParams {
                var_rows: problem.var_rows,
                var_cols: problem.var_cols,
                indices_num: problem.indices_num,
                cut: TileCut::default(),
                atomic_core_num: 0,
                copy: CopyPhase::default(),
                ub_bytes: ctx.hardware.ub_bytes,
                atomic_add: true,
                index_bytes,
            };
            return emit(&SCATTER_ADD_SCHEMA, plan, |w| params.write(w));
        }

        let sched = schedule(&problem, &ctx.hardware)?;
        let wide_addr = sched.template == ScatterTemplate::Simt
            && (problem.wide_addr || problem.var_cols * problem.indices_num > i32::MAX as u64);
        let key = TilingKey::ScatterAdd(ScatterKey::Active {
            sorted: false,
            template: sched.template,
            wide_addr,
            scalar_updates: problem.scalar_updates,
        });

        let geometry = geometry(&planner, &problem, &sched, ctx.hardware.core_count)?;
        let plan = planner.finish(
            geometry,
            key,
            ctx.system_workspace_bytes,
            sched.extra_workspace(problem.var_elems()),
        );
        let params = ScatterAddParams {
            var_rows: problem.var_rows,
            var_cols: problem.var_cols,
            indices_num: problem.indices_num,
            cut: sched.cut,
            atomic_core_num: sched.atomic_core_num,
            copy: sched.copy,
            ub_bytes: sched.ub_bytes,
            atomic_add: sched.atomic_add,
            index_bytes,
        };
        let mut output = emit(&SCATTER_ADD_SCHEMA, plan, |w| params.write(w))?;
        output.block_dim = sched.block_dim(&ctx.hardware);
        debug!(
            template = ?sched.template,
            atomic_add = sched.atomic_add,
            block_dim = output.block_dim,
            "scatter_add schedule chosen"
        );
        Ok(output)
    }
}

//! `gelu_quant`: GELU followed by static or dynamic quantization to an
//! 8-bit type.
//!
//! The last axis is the quantization axis; everything before it is folded
//! into `front` rows. Static quantization with a per-channel scale chooses
//! between a row-per-block schedule and a packed one, static per-tensor
//! quantization treats the operand as one flat run, and dynamic
//! quantization always gives each row its own block so the row maximum can
//! be reduced in place (or in workspace when a row overflows the buffer).
//!
//! Register-based SoCs double-buffer the dynamic kernels and support every
//! 8-bit target. Other SoCs run single-buffered dynamic kernels and only
//! quantize to int8.

use std::fmt;

use tracing::{debug, warn};

use npuop_common::math::{ceil_align, ceil_div, floor_align};
use npuop_common::{DType, Result, TensorShapeView, TilingError};

use crate::blob::{concat_fields, u32f, u64f, BlobReader, BlobSchema, BlobWriter, FieldDef};
use crate::key::{KeySpace, QuantInputs, QuantTemplate, TilingKey};
use crate::ops::{emit, OperatorTiling};
use crate::planner::{GridSplit, PlanGeometry, TilingPlanner};
use crate::profile::{DistributionPolicy, OperatorProfile};
use crate::registry::{TilingContext, TilingOutput};

pub const NAME: &str = "gelu_quant";

/// Buffer bytes the kernel keeps for itself.
pub const RESERVED_UB_BYTES: u64 = 1024;
/// fp32 nodes live at once in the static kernels.
pub const STATIC_NODE_NUM: u64 = 11;
/// fp32 nodes live at once in the double-buffered dynamic kernels.
pub const DYNAMIC_NODE_NUM: u64 = 13;
/// fp32 nodes live at once in the single-buffered dynamic kernels of
/// SoCs without register-based vector units.
pub const MEMBASE_DYNAMIC_NODE_NUM: u64 = 7;
/// Smallest element count worth a core of its own.
pub const SINGLE_CORE_MIN_ELEMS: u64 = 128;
pub const MAX_RANK: usize = 8;

const FP32_BLOCK_ELEMS: u64 = 8;
const X_DTYPES: [DType; 3] = [DType::Float32, DType::Float16, DType::BFloat16];

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantMode {
    Static,
    Dynamic,
}

/// Rounding applied by the final cast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundMode {
    Rint,
    Round,
    Hybrid,
}

impl RoundMode {
    pub const fn code(self) -> u32 {
        match self {
            Self::Rint => 0,
            Self::Round => 1,
            Self::Hybrid => 2,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Rint),
            1 => Some(Self::Round),
            2 => Some(Self::Hybrid),
            _ => None,
        }
    }

    /// Parse `mode` for a cast to `dst`. HiFloat8 rounds half away from zero
    /// (`round`) or with the hybrid scheme; every other target only rints.
    pub fn for_target(mode: &str, dst: DType) -> Result<Self> {
        let parsed = match (dst, mode) {
            (DType::HiFloat8, "round") => Some(Self::Round),
            (DType::HiFloat8, "hybrid") => Some(Self::Hybrid),
            (DType::HiFloat8, _) => None,
            (_, "rint") => Some(Self::Rint),
            _ => None,
        };
        parsed.ok_or_else(|| {
            let allowed = if dst == DType::HiFloat8 { "'round' or 'hybrid'" } else { "'rint'" };
            TilingError::attribute(NAME, "round_mode", format!("{mode:?} is invalid for {dst}, expected {allowed}"))
        })
    }
}

/// How a `scale` or `offset` operand is shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    Absent,
    Scalar,
    PerChannel,
}

impl OperandKind {
    pub const fn code(self) -> u32 {
        match self {
            Self::Absent => 0,
            Self::Scalar => 1,
            Self::PerChannel => 2,
        }
    }
}

impl fmt::Display for OperandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::Scalar => write!(f, "scalar"),
            Self::PerChannel => write!(f, "per-channel"),
        }
    }
}

fn operand_kind(tensor: &str, t: &TensorShapeView, end: u64) -> Result<OperandKind> {
    if t.is_empty() {
        return Err(TilingError::empty(NAME, tensor, &t.dims));
    }
    if t.numel() == 1 {
        return Ok(OperandKind::Scalar);
    }
    if t.rank() != 1 || t.dims[0] != end {
        return Err(TilingError::shape_mismatch(
            NAME,
            format!("{tensor} must have shape [1] or [{end}], got {:?}", t.dims),
        ));
    }
    Ok(OperandKind::PerChannel)
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

/// Validated view of one `gelu_quant` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeluQuantProblem {
    pub x_dtype: DType,
    pub scale_dtype: Option<DType>,
    pub front: u64,
    pub end: u64,
    pub mode: QuantMode,
    pub tanh: bool,
    pub scale_kind: OperandKind,
    pub offset_kind: OperandKind,
    pub dst: DType,
    pub dst_code: u32,
    pub round_mode: RoundMode,
}

impl GeluQuantProblem {
    pub fn total(&self) -> u64 {
        self.front * self.end
    }

    pub fn end_aligned(&self) -> u64 {
        ceil_align(self.end, FP32_BLOCK_ELEMS)
    }
}

fn analyze(ctx: &TilingContext) -> Result<GeluQuantProblem> {
    let attrs = &ctx.attrs;
    let tanh = match attrs.str_or(NAME, "approximate", "none")? {
        "none" => false,
        "tanh" => true,
        other => {
            return Err(TilingError::attribute(NAME, "approximate", format!("expected none or tanh, got {other:?}")))
        }
    };
    let mode = match attrs.str_or(NAME, "quant_mode", "static")? {
        "static" => QuantMode::Static,
        "dynamic" => QuantMode::Dynamic,
        other => {
            return Err(TilingError::attribute(
                NAME,
                "quant_mode",
                format!("expected static or dynamic, got {other:?}"),
            ))
        }
    };
    let dst_code = attrs.int_or(NAME, "dst_type", DType::Int8.code())?;
    let dst = DType::from_code(dst_code)
        .filter(|d| matches!(d, DType::Int8 | DType::HiFloat8 | DType::Float8E5M2 | DType::Float8E4M3Fn))
        .ok_or_else(|| TilingError::attribute(NAME, "dst_type", format!("{dst_code} is not an 8-bit quant target")))?;
    let round_mode = RoundMode::for_target(attrs.str_or(NAME, "round_mode", "rint")?, dst)?;

    let x = ctx.input(NAME, 0, "x")?;
    if !X_DTYPES.contains(&x.dtype) {
        return Err(TilingError::dtype(NAME, "x", x.dtype));
    }
    if x.rank() > MAX_RANK {
        return Err(TilingError::shape_mismatch(NAME, format!("x has {} dims, at most {MAX_RANK} allowed", x.rank())));
    }
    if mode == QuantMode::Dynamic && x.rank() < 2 {
        return Err(TilingError::shape_mismatch(NAME, "dynamic quantization needs x with at least 2 dims"));
    }
    if x.is_empty() || x.rank() == 0 {
        return Err(TilingError::empty(NAME, "x", &x.dims));
    }
    let y = ctx.output(NAME, 0, "y")?;
    if y.dims != x.dims {
        return Err(TilingError::shape_mismatch(NAME, format!("y {:?} must match x {:?}", y.dims, x.dims)));
    }
    if y.dtype != dst {
        return Err(TilingError::dtype(NAME, "y", y.dtype));
    }
    let (front, end) = x.fold_at(x.rank() - 1);

    let scale = ctx.optional_input(1);
    let scale_kind = match scale {
        None if mode == QuantMode::Static => return Err(TilingError::missing(NAME, "scale")),
        None => OperandKind::Absent,
        Some(s) => {
            let incompatible = match x.dtype {
                DType::Float32 => s.dtype != DType::Float32,
                DType::Float16 => s.dtype == DType::BFloat16,
                DType::BFloat16 => s.dtype == DType::Float16,
                _ => false,
            };
            if incompatible || !X_DTYPES.contains(&s.dtype) {
                return Err(TilingError::dtype(NAME, "scale", s.dtype));
            }
            operand_kind("scale", s, end)?
        }
    };

    let offset_kind = match (mode, ctx.optional_input(2)) {
        (QuantMode::Dynamic, _) | (_, None) => OperandKind::Absent,
        (QuantMode::Static, Some(o)) => {
            if Some(o.dtype) != scale.map(|s| s.dtype) {
                return Err(TilingError::dtype(NAME, "offset", o.dtype));
            }
            let kind = operand_kind("offset", o, end)?;
            if kind != scale_kind {
                return Err(TilingError::shape_mismatch(
                    NAME,
                    format!("offset is {kind} but scale is {scale_kind}"),
                ));
            }
            kind
        }
    };

    Ok(GeluQuantProblem {
        x_dtype: x.dtype,
        scale_dtype: scale.map(|s| s.dtype),
        front,
        end,
        mode,
        tanh,
        scale_kind,
        offset_kind,
        dst,
        dst_code: dst.code() as u32,
        round_mode,
    })
}

// ---------------------------------------------------------------------------
// Template selection
// ---------------------------------------------------------------------------

/// Template, block grid and pass size chosen for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantSchedule {
    pub template: QuantTemplate,
    pub grid: GridSplit,
    pub pass_elems: u64,
}

/// Rows packed per block in the full-kernel performance template, or
/// `None` once the search drops to a single row.
fn packed_rows(front: u64, rows_in_ub: u64, cores: u64) -> Option<u64> {
    let mut rows = rows_in_ub;
    while rows >= 2 && ceil_div(front, rows) < cores {
        rows -= 1;
    }
    (rows >= 2).then_some(rows)
}

/// Pick the kernel template for `problem` given `node_elems` fp32 elements
/// per live node.
pub fn schedule(problem: &GeluQuantProblem, node_elems: u64, cores: u64) -> Result<QuantSchedule> {
    let (front, end) = (problem.front, problem.end);
    let rows_in_ub = node_elems / problem.end_aligned();
    let row_per_block = |template| -> Result<QuantSchedule> {
        Ok(QuantSchedule { template, grid: GridSplit::new(front, end, 1, end)?, pass_elems: node_elems })
    };

    match (problem.mode, problem.scale_kind) {
        (QuantMode::Dynamic, _) if rows_in_ub == 0 => row_per_block(QuantTemplate::DynamicWorkspace),
        (QuantMode::Dynamic, _) => row_per_block(QuantTemplate::DynamicNormal),
        (QuantMode::Static, OperandKind::Scalar) => {
            let total = problem.total();
            let chunk = if total <= SINGLE_CORE_MIN_ELEMS {
                total
            } else {
                ceil_div(total, cores).max(SINGLE_CORE_MIN_ELEMS)
            };
            Ok(QuantSchedule {
                template: QuantTemplate::StaticPerTensor,
                grid: GridSplit::flat(total, chunk),
                pass_elems: node_elems,
            })
        }
        (QuantMode::Static, _) if front >= cores && rows_in_ub < 2 => row_per_block(QuantTemplate::StaticFunction),
        (QuantMode::Static, _) if front >= cores => match packed_rows(front, rows_in_ub, cores) {
            Some(rows) => Ok(QuantSchedule {
                template: QuantTemplate::StaticPerformance,
                grid: GridSplit::new(front, end, rows, end)?,
                pass_elems: node_elems,
            }),
            None => {
                warn!(front, end, rows_in_ub, "packing rows would idle cores, using one row per block");
                row_per_block(QuantTemplate::StaticFunction)
            }
        },
        (QuantMode::Static, _) => {
            let col_split = ceil_div(cores, front);
            let col_inner = ceil_div(end, col_split);
            let col_inner = if col_inner < SINGLE_CORE_MIN_ELEMS {
                SINGLE_CORE_MIN_ELEMS
            } else {
                floor_align(col_inner, SINGLE_CORE_MIN_ELEMS)
            };
            let col_inner = col_inner.min(node_elems);
            Ok(QuantSchedule {
                template: QuantTemplate::StaticPerformance,
                grid: GridSplit::new(front, end, 1, col_inner)?,
                pass_elems: col_inner.min(end),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Blob
// ---------------------------------------------------------------------------

const EXT_FIELDS: [FieldDef; 10] = [
    u32f("node_num"),
    u64f("node_elems"),
    u64f("end_axis"),
    u64f("end_axis_aligned"),
    u32f("quant_mode"),
    u32f("approximate"),
    u32f("scale_kind"),
    u32f("offset_kind"),
    u32f("dst_type"),
    u32f("round_mode"),
];
static FIELDS: [FieldDef; 29] = concat_fields(&EXT_FIELDS);
pub static GELU_QUANT_SCHEMA: BlobSchema = BlobSchema { name: NAME, version: 1, fields: &FIELDS };

/// Fields the kernel needs beyond the common header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeluQuantParams {
    pub node_num: u32,
    pub node_elems: u64,
    pub end_axis: u64,
    pub end_axis_aligned: u64,
    pub quant_mode: u32,
    pub approximate: u32,
    pub scale_kind: u32,
    pub offset_kind: u32,
    pub dst_type: u32,
    pub round_mode: u32,
}

impl GeluQuantParams {
    pub fn read(r: &mut BlobReader<'_>) -> Result<Self> {
        Ok(Self {
            node_num: r.u32("node_num")?,
            node_elems: r.u64("node_elems")?,
            end_axis: r.u64("end_axis")?,
            end_axis_aligned: r.u64("end_axis_aligned")?,
            quant_mode: r.u32("quant_mode")?,
            approximate: r.u32("approximate")?,
            scale_kind: r.u32("scale_kind")?,
            offset_kind: r.u32("offset_kind")?,
            dst_type: r.u32("dst_type")?,
            round_mode: r.u32("round_mode")?,
        })
    }

    fn write(&self, w: &mut BlobWriter) -> Result<()> {
        w.put_u32("node_num", self.node_num)?;
        w.put_u64("node_elems", self.node_elems)?;
        w.put_u64("end_axis", self.end_axis)?;
        w.put_u64("end_axis_aligned", self.end_axis_aligned)?;
        w.put_u32("quant_mode", self.quant_mode)?;
        w.put_u32("approximate", self.approximate)?;
        w.put_u32("scale_kind", self.scale_kind)?;
        w.put_u32("offset_kind", self.offset_kind)?;
        w.put_u32("dst_type", self.dst_type)?;
        w.put_u32("round_mode", self.round_mode)
    }
}

// ---------------------------------------------------------------------------
// Operator
// ---------------------------------------------------------------------------

fn profile(mode: QuantMode, regbase: bool) -> OperatorProfile {
    let nodes = match mode {
        QuantMode::Static => STATIC_NODE_NUM,
        QuantMode::Dynamic if regbase => DYNAMIC_NODE_NUM,
        QuantMode::Dynamic => MEMBASE_DYNAMIC_NODE_NUM,
    };
    OperatorProfile::new(NAME, nodes)
        .with_reserved_ub(RESERVED_UB_BYTES)
        .with_distribution(DistributionPolicy::LastCoreTail { min_blocks: 1 })
        .with_tail_merge(true)
}

/// Row-maximum spill area of the workspace template.
fn extra_workspace(template: QuantTemplate, end: u64, geometry: &PlanGeometry) -> u64 {
    if template == QuantTemplate::DynamicWorkspace {
        end * DType::Float32.size_bytes() * geometry.used_core_num()
    } else {
        0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GeluQuant;

impl OperatorTiling for GeluQuant {
    fn name(&self) -> &'static str {
        NAME
    }

    fn key_space(&self) -> KeySpace {
        KeySpace::GeluQuant
    }

    fn schema(&self) -> &'static BlobSchema {
        &GELU_QUANT_SCHEMA
    }

    fn tile(&self, ctx: &TilingContext) -> Result<TilingOutput> {
        let problem = analyze(ctx)?;
        let profile = profile(problem.mode, ctx.hardware.regbase);
        let planner = TilingPlanner::new(&profile, &ctx.hardware);
        let node_elems = planner.max_elems_per_chunk(DType::Float32.size_bytes())?;
        let sched = schedule(&problem, node_elems, ctx.hardware.core_count)?;

        let key = TilingKey::GeluQuant {
            template: sched.template,
            inputs: QuantInputs::select(problem.x_dtype, problem.scale_dtype),
        };
        if !ctx.hardware.regbase && problem.dst != DType::Int8 {
            return Err(TilingError::UnsupportedSocForKey { key: key.to_wire()?, soc: ctx.hardware.soc });
        }
        debug!(
            front = problem.front,
            end = problem.end,
            node_elems,
            template = ?sched.template,
            "gelu_quant template selected"
        );

        let geometry = planner.distribute_for_output(
            sched.grid,
            sched.pass_elems,
            problem.x_dtype.size_bytes(),
            problem.dst.size_bytes(),
        )?;
        let extra = extra_workspace(sched.template, problem.end, &geometry);
        let plan = planner.finish(geometry, key, ctx.system_workspace_bytes, extra);

        let params = GeluQuantParams {
            node_num: profile.buffers_per_element as u32,
            node_elems,
            end_axis: problem.end,
            end_axis_aligned: problem.end_aligned(),
            quant_mode: u32::from(problem.mode == QuantMode::Dynamic),
            approximate: u32::from(problem.tanh),
            scale_kind: problem.scale_kind.code(),
            offset_kind: problem.offset_kind.code(),
            dst_type: problem.dst_code,
            round_mode: problem.round_mode.code(),
        };
        emit(&GELU_QUANT_SCHEMA, plan, |w| params.write(w))
    }
}

//! `ge_glu_grad_v2`: gradient of `GeGlu(x) = x_a * gelu(x_b)` where `x` is
//! split in half along `dim`.
//!
//! Rows (everything before `dim`) are packed into blocks while a whole
//! half-row fits the buffer; longer half-rows are looped in column passes.

use tracing::debug;

use npuop_common::math::{block_elems, ceil_align};
use npuop_common::{DType, HardwareProfile, Result, TilingError};

use crate::analyzer::{analyze_split_glu, SplitGluProblem};
use crate::blob::{concat_fields, u32f, u64f, BlobReader, BlobSchema, BlobWriter, FieldDef};
use crate::key::{Approximation, DtypeClass, KeySpace, TilingKey};
use crate::ops::{emit, OperatorTiling};
use crate::planner::{ProblemSize, SizeRegime, TilingPlanner};
use crate::profile::{DistributionPolicy, OperatorProfile};
use crate::registry::{TilingContext, TilingOutput};

pub const NAME: &str = "ge_glu_grad_v2";

/// Half-rows at or below this many bytes take the small-row kernel.
pub const SMALL_ROW_BYTES: u64 = 64;

const EXT_FIELDS: [FieldDef; 4] =
    [u64f("half_inner"), u64f("full_inner"), u32f("approximate"), u32f("activate_left")];
static FIELDS: [FieldDef; 23] = concat_fields(&EXT_FIELDS);
pub static GEGLU_GRAD_SCHEMA: BlobSchema = BlobSchema { name: NAME, version: 1, fields: &FIELDS };

/// Buffers live at once: `dy`, both halves of `x`, `gelu`, both halves of
/// `dx`, double buffered, plus intermediate scratch.
pub fn profile(dtype: DType) -> OperatorProfile {
    let buffers = if dtype.size_bytes() == 2 { 18 } else { 12 };
    OperatorProfile::new(NAME, buffers)
        .with_distribution(DistributionPolicy::LastCoreTail { min_blocks: 1 })
        .with_tail_merge(true)
}

/// Fields the kernel needs beyond the common header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeGluGradParams {
    pub half_inner: u64,
    pub full_inner: u64,
    pub approximation: Approximation,
    pub activate_left: bool,
}

impl GeGluGradParams {
    fn from_problem(problem: &SplitGluProblem, approximation: Approximation) -> Self {
        Self {
            half_inner: problem.half_inner,
            full_inner: problem.full_inner,
            approximation,
            activate_left: problem.activate_left,
        }
    }

    pub fn read(r: &mut BlobReader<'_>) -> Result<Self> {
        let half_inner = r.u64("half_inner")?;
        let full_inner = r.u64("full_inner")?;
        let approximation = match r.u32("approximate")? {
            0 => Approximation::Erf,
            1 => Approximation::Tanh,
            other => return Err(TilingError::Schema(format!("{NAME}: approximate code {other}"))),
        };
        let activate_left = r.u32("activate_left")? != 0;
        Ok(Self { half_inner, full_inner, approximation, activate_left })
    }

    fn write(&self, w: &mut BlobWriter) -> Result<()> {
        w.put_u64("half_inner", self.half_inner)?;
        w.put_u64("full_inner", self.full_inner)?;
        w.put_u32("approximate", u32::from(self.approximation == Approximation::Tanh))?;
        w.put_u32("activate_left", u32::from(self.activate_left))
    }
}

/// Kernel regime for a half-row of `inner` elements.
pub fn regime(inner: u64, dtype: DType, hardware: &HardwareProfile, max_row_elems: u64) -> SizeRegime {
    let bytes = dtype.size_bytes();
    if inner * bytes <= SMALL_ROW_BYTES {
        SizeRegime::Small
    } else if ceil_align(inner, block_elems(hardware.align_bytes, bytes)) > max_row_elems {
        SizeRegime::AlignedLastAxisBig
    } else {
        SizeRegime::Aligned
    }
}

/// Fail when `key` has no compiled variant on the target SoC.
fn check_soc(key: &TilingKey, hardware: &HardwareProfile) -> Result<()> {
    let caps = hardware.capabilities();
    if let TilingKey::GluGrad { dtype, approx, .. } = key {
        let bf16_missing = *dtype == DtypeClass::Bf16 && !caps.bf16;
        let erf_missing = *approx == Approximation::Erf && !caps.erf_approximation;
        if bf16_missing || erf_missing {
            return Err(TilingError::UnsupportedSocForKey { key: key.to_wire()?, soc: hardware.soc });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GeGluGradV2;

impl OperatorTiling for GeGluGradV2 {
    fn name(&self) -> &'static str {
        NAME
    }

    fn key_space(&self) -> KeySpace {
        KeySpace::GluGrad
    }

    fn schema(&self) -> &'static BlobSchema {
        &GEGLU_GRAD_SCHEMA
    }

    fn tile(&self, ctx: &TilingContext) -> Result<TilingOutput> {
        let dy = ctx.input(NAME, 0, "dy")?;
        let x = ctx.input(NAME, 1, "x")?;
        let gelu = ctx.input(NAME, 2, "gelu")?;
        let dx = ctx.output(NAME, 0, "dx")?;
        let problem = analyze_split_glu(NAME, dy, x, gelu, dx, &ctx.attrs)?;

        let class = DtypeClass::of(problem.dtype).ok_or_else(|| TilingError::dtype(NAME, "x", problem.dtype))?;
        let approx = if problem.approximate == 0 { Approximation::Erf } else { Approximation::Tanh };

        let profile = profile(problem.dtype);
        let planner = TilingPlanner::new(&profile, &ctx.hardware);
        let max_row_elems = planner.max_elems_per_chunk(problem.dtype.size_bytes())?;
        let key_regime = regime(problem.half_inner, problem.dtype, &ctx.hardware, max_row_elems);
        debug!(
            outer = problem.outer,
            half_inner = problem.half_inner,
            max_row_elems,
            regime = %key_regime,
            "ge_glu_grad_v2 regime selected"
        );

        let key = TilingKey::GluGrad { dtype: class, approx, regime: key_regime };
        check_soc(&key, &ctx.hardware)?;

        let plan = planner.plan(
            &ProblemSize::rows(problem.outer, problem.half_inner, problem.dtype.size_bytes()),
            ctx.system_workspace_bytes,
            |_| Ok(key),
        )?;
        let params = GeGluGradParams::from_problem(&problem, approx);
        emit(&GEGLU_GRAD_SCHEMA, plan, |w| params.write(w))
    }
}

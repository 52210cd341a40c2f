//! Unary and broadcasting elementwise operators: `relu`, `elu`, `gelu_grad`.
//!
//! All three tile the flattened output evenly over cores with double-buffered
//! input and output stages. Unaligned core boundaries go through the tail
//! merge, so these never fall back to a single core.

use npuop_common::{DType, Result, TensorShapeView, TilingError};

use crate::analyzer::{analyze_elementwise_like, ElementwiseProblem, ElementwiseRules};
use crate::blob::{concat_fields, f32f, u64f, BlobReader, BlobSchema, BlobWriter, FieldDef};
use crate::key::{ElementwiseVariant, KeySpace, TilingKey};
use crate::ops::{emit, OperatorTiling};
use crate::planner::{ProblemSize, TilingPlan, TilingPlanner};
use crate::profile::OperatorProfile;
use crate::registry::{TilingContext, TilingOutput};

pub const RELU_DTYPES: [DType; 6] =
    [DType::Float16, DType::BFloat16, DType::Float32, DType::Int8, DType::Int32, DType::Int64];

pub const FLOAT_DTYPES: [DType; 3] = [DType::Float16, DType::BFloat16, DType::Float32];

/// Highest output rank the broadcast layout can describe.
pub const MAX_RANK: usize = 8;

/// Profile for an operator with `operands` double-buffered stages.
const fn profile(name: &'static str, operands: u64) -> OperatorProfile {
    OperatorProfile::new(name, 2 * operands).with_tail_merge(true)
}

fn operands<'a>(ctx: &'a TilingContext, op: &str, names: &[&'a str]) -> Result<Vec<(&'a str, &'a TensorShapeView)>> {
    names.iter().enumerate().map(|(i, name)| ctx.input(op, i, name).map(|t| (*name, t))).collect()
}

/// Analyze, plan and key a flat elementwise launch.
fn plan_flat(
    ctx: &TilingContext,
    profile: &OperatorProfile,
    rules: &ElementwiseRules<'_>,
    input_names: &[&str],
    variant: fn(DType) -> ElementwiseVariant,
) -> Result<(ElementwiseProblem, TilingPlan)> {
    let op = profile.name;
    let inputs = operands(ctx, op, input_names)?;
    let out = ctx.output(op, 0, "y")?;
    let problem = analyze_elementwise_like(rules, &inputs, &[("y", out)], &ctx.attrs)?;

    let key = TilingKey::Elementwise { variant: variant(problem.dtype), layout: problem.layout };
    let planner = TilingPlanner::new(profile, &ctx.hardware);
    let plan = planner.plan(
        &ProblemSize::flat(problem.total(), problem.dtype.size_bytes()),
        ctx.system_workspace_bytes,
        |_| Ok(key),
    )?;
    Ok((problem, plan))
}

// ---------------------------------------------------------------------------
// relu
// ---------------------------------------------------------------------------

static RELU_FIELDS: [FieldDef; 19] = concat_fields(&[]);
pub static RELU_SCHEMA: BlobSchema = BlobSchema { name: "relu", version: 1, fields: &RELU_FIELDS };

const RELU_PROFILE: OperatorProfile = profile("relu", 2);

#[derive(Debug, Clone, Copy, Default)]
pub struct Relu;

impl OperatorTiling for Relu {
    fn name(&self) -> &'static str {
        "relu"
    }

    fn key_space(&self) -> KeySpace {
        KeySpace::ElementwisePerDtype
    }

    fn schema(&self) -> &'static BlobSchema {
        &RELU_SCHEMA
    }

    fn tile(&self, ctx: &TilingContext) -> Result<TilingOutput> {
        let rules = ElementwiseRules::new("relu", &RELU_DTYPES);
        let (_, plan) = plan_flat(ctx, &RELU_PROFILE, &rules, &["x"], ElementwiseVariant::PerDtype)?;
        emit(&RELU_SCHEMA, plan, |_| Ok(()))
    }
}

// ---------------------------------------------------------------------------
// elu
// ---------------------------------------------------------------------------

static ELU_FIELDS: [FieldDef; 22] = concat_fields(&[f32f("alpha"), f32f("scale"), f32f("input_scale")]);
pub static ELU_SCHEMA: BlobSchema = BlobSchema { name: "elu", version: 1, fields: &ELU_FIELDS };

const ELU_PROFILE: OperatorProfile = profile("elu", 2);

/// `scale * (x > 0 ? x : alpha * (exp(input_scale * x) - 1))`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EluParams {
    pub alpha: f32,
    pub scale: f32,
    pub input_scale: f32,
}

impl EluParams {
    pub fn read(r: &mut BlobReader<'_>) -> Result<Self> {
        Ok(Self { alpha: r.f32("alpha")?, scale: r.f32("scale")?, input_scale: r.f32("input_scale")? })
    }

    fn write(&self, w: &mut BlobWriter) -> Result<()> {
        w.put_f32("alpha", self.alpha)?;
        w.put_f32("scale", self.scale)?;
        w.put_f32("input_scale", self.input_scale)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Elu;

impl OperatorTiling for Elu {
    fn name(&self) -> &'static str {
        "elu"
    }

    fn key_space(&self) -> KeySpace {
        KeySpace::ElementwiseUniform
    }

    fn schema(&self) -> &'static BlobSchema {
        &ELU_SCHEMA
    }

    fn tile(&self, ctx: &TilingContext) -> Result<TilingOutput> {
        let op = "elu";
        let params = EluParams {
            alpha: ctx.attrs.float_or(op, "alpha", 1.0)? as f32,
            scale: ctx.attrs.float_or(op, "scale", 1.0)? as f32,
            input_scale: ctx.attrs.float_or(op, "input_scale", 1.0)? as f32,
        };
        let rules = ElementwiseRules::new(op, &FLOAT_DTYPES);
        let (_, plan) = plan_flat(ctx, &ELU_PROFILE, &rules, &["x"], |_| ElementwiseVariant::Uniform)?;
        emit(&ELU_SCHEMA, plan, |w| params.write(w))
    }
}

// ---------------------------------------------------------------------------
// gelu_grad
// ---------------------------------------------------------------------------

const BROADCAST_FIELDS: [FieldDef; 4 * MAX_RANK] = [
    u64f("out_dim0"),
    u64f("out_dim1"),
    u64f("out_dim2"),
    u64f("out_dim3"),
    u64f("out_dim4"),
    u64f("out_dim5"),
    u64f("out_dim6"),
    u64f("out_dim7"),
    u64f("dy_stride0"),
    u64f("dy_stride1"),
    u64f("dy_stride2"),
    u64f("dy_stride3"),
    u64f("dy_stride4"),
    u64f("dy_stride5"),
    u64f("dy_stride6"),
    u64f("dy_stride7"),
    u64f("x_stride0"),
    u64f("x_stride1"),
    u64f("x_stride2"),
    u64f("x_stride3"),
    u64f("x_stride4"),
    u64f("x_stride5"),
    u64f("x_stride6"),
    u64f("x_stride7"),
    u64f("y_stride0"),
    u64f("y_stride1"),
    u64f("y_stride2"),
    u64f("y_stride3"),
    u64f("y_stride4"),
    u64f("y_stride5"),
    u64f("y_stride6"),
    u64f("y_stride7"),
];

static GELU_GRAD_FIELDS: [FieldDef; 19 + 4 * MAX_RANK] = concat_fields(&BROADCAST_FIELDS);
pub static GELU_GRAD_SCHEMA: BlobSchema =
    BlobSchema { name: "gelu_grad", version: 1, fields: &GELU_GRAD_FIELDS };

const GELU_GRAD_PROFILE: OperatorProfile = profile("gelu_grad", 4);
const GELU_GRAD_INPUTS: [&str; 3] = ["dy", "x", "y"];

/// Output dims and per-input element strides, both left-padded to
/// [`MAX_RANK`]. A zero stride repeats the input along that axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastLayout {
    pub out_dims: [u64; MAX_RANK],
    pub strides: [[u64; MAX_RANK]; 3],
}

impl BroadcastLayout {
    pub fn new(op: &str, out: &[u64], inputs: [&[u64]; 3]) -> Result<Self> {
        if out.len() > MAX_RANK {
            return Err(TilingError::shape_mismatch(
                op,
                format!("rank {} exceeds the broadcast limit of {MAX_RANK}", out.len()),
            ));
        }
        let pad = MAX_RANK - out.len();
        let mut out_dims = [1u64; MAX_RANK];
        out_dims[pad..].copy_from_slice(out);

        let mut strides = [[0u64; MAX_RANK]; 3];
        for (slot, dims) in strides.iter_mut().zip(inputs) {
            let mut stride = 1;
            for (k, &d) in dims.iter().enumerate().rev() {
                let axis = MAX_RANK - dims.len() + k;
                slot[axis] = if d == 1 && out_dims[axis] != 1 { 0 } else { stride };
                stride *= d;
            }
        }
        Ok(Self { out_dims, strides })
    }

    /// Element offset into input `which` for flat output index `index`.
    pub fn input_offset(&self, which: usize, mut index: u64) -> u64 {
        let strides = &self.strides[which];
        let mut offset = 0;
        for axis in (0..MAX_RANK).rev() {
            let d = self.out_dims[axis].max(1);
            offset += (index % d) * strides[axis];
            index /= d;
        }
        offset
    }

    pub fn read(r: &mut BlobReader<'_>) -> Result<Self> {
        let mut out_dims = [0u64; MAX_RANK];
        let mut strides = [[0u64; MAX_RANK]; 3];
        for (i, field) in BROADCAST_FIELDS.iter().enumerate() {
            let value = r.u64(field.name)?;
            match i / MAX_RANK {
                0 => out_dims[i % MAX_RANK] = value,
                n => strides[n - 1][i % MAX_RANK] = value,
            }
        }
        Ok(Self { out_dims, strides })
    }

    fn write(&self, w: &mut BlobWriter) -> Result<()> {
        for (i, field) in BROADCAST_FIELDS.iter().enumerate() {
            let value = match i / MAX_RANK {
                0 => self.out_dims[i % MAX_RANK],
                n => self.strides[n - 1][i % MAX_RANK],
            };
            w.put_u64(field.name, value)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GeluGrad;

impl OperatorTiling for GeluGrad {
    fn name(&self) -> &'static str {
        "gelu_grad"
    }

    fn key_space(&self) -> KeySpace {
        KeySpace::ElementwisePerDtype
    }

    fn schema(&self) -> &'static BlobSchema {
        &GELU_GRAD_SCHEMA
    }

    fn tile(&self, ctx: &TilingContext) -> Result<TilingOutput> {
        let op = "gelu_grad";
        let rules = ElementwiseRules::new(op, &FLOAT_DTYPES);
        let (problem, plan) =
            plan_flat(ctx, &GELU_GRAD_PROFILE, &rules, &GELU_GRAD_INPUTS, ElementwiseVariant::PerDtype)?;
        let inputs = operands(ctx, op, &GELU_GRAD_INPUTS)?;
        let layout = BroadcastLayout::new(
            op,
            &problem.shape,
            [inputs[0].1.dims.as_slice(), inputs[1].1.dims.as_slice(), inputs[2].1.dims.as_slice()],
        )?;
        emit(&GELU_GRAD_SCHEMA, plan, |w| layout.write(w))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tile;
    use npuop_common::{HardwareProfile, SocTag};

    fn hw95() -> HardwareProfile {
        HardwareProfile::new(SocTag::Ascend910_95, 64, 262_144)
    }

    fn unary(dtype: DType, out: DType, dims: &[u64]) -> TilingContext {
        TilingContext::new(hw95())
            .with_input(TensorShapeView::new(dims.to_vec(), dtype))
            .with_output(TensorShapeView::new(dims.to_vec(), out))
    }

    #[test]
    fn relu_keys_per_dtype() {
        let expected = [
            (DType::Float16, 101),
            (DType::BFloat16, 102),
            (DType::Float32, 103),
            (DType::Int8, 104),
            (DType::Int32, 105),
            (DType::Int64, 106),
        ];
        for (dtype, key) in expected {
            let out = tile("relu", &unary(dtype, dtype, &[1, 64, 2, 64])).unwrap();
            assert_eq!(out.wire_key, key, "{dtype}");
            assert_eq!(out.block_dim, 1);
        }
    }

    #[test]
    fn relu_rejections() {
        assert!(matches!(
            tile("relu", &unary(DType::Float32, DType::BFloat16, &[1, 64, 2, 64])),
            Err(TilingError::UnsupportedDtype { .. })
        ));
        assert!(matches!(
            tile("relu", &unary(DType::Float64, DType::Float64, &[1, 1, 2, 64])),
            Err(TilingError::UnsupportedDtype { .. })
        ));
        assert!(matches!(
            tile("relu", &unary(DType::Float32, DType::Float32, &[1, 0, 2, 64])),
            Err(TilingError::EmptyTensor { .. })
        ));
    }

    #[test]
    fn elu_uses_one_schedule() {
        for dtype in FLOAT_DTYPES {
            let ctx = unary(dtype, dtype, &[1, 64, 2, 64]).with_attr("alpha", 0.5f64);
            let out = tile("elu", &ctx).unwrap();
            assert_eq!(out.wire_key, 101);
            let mut r = out.blob.reader().unwrap();
            crate::blob::PlanHeader::read(&mut r).unwrap();
            let params = EluParams::read(&mut r).unwrap();
            assert_eq!(params, EluParams { alpha: 0.5, scale: 1.0, input_scale: 1.0 });
        }
        assert!(tile("elu", &unary(DType::Float64, DType::Float64, &[8])).is_err());
    }

    #[test]
    fn large_relu_spreads_evenly() {
        let out = tile("relu", &unary(DType::Float32, DType::Float32, &[65_536 * 10 + 3])).unwrap();
        let plan = &out.plan;
        // 16384-element passes of fp32 on 262144 bytes / 4 buffers.
        assert_eq!(plan.geometry.pass_elems, 16_384);
        assert_eq!(plan.used_core_num(), 41);
        assert_eq!(plan.tail_chunk_elems(), 3);
        assert!(!plan.geometry.tail_merge);
    }

    #[test]
    fn broadcast_layout_strides() {
        let (full, row, column): (&[u64], &[u64], &[u64]) = (&[1, 64, 2, 64], &[64], &[2, 1]);
        let layout = BroadcastLayout::new("t", full, [full, row, column]).unwrap();
        assert_eq!(layout.out_dims, [1, 1, 1, 1, 1, 64, 2, 64]);
        assert_eq!(layout.strides[0][4..], [8192, 128, 64, 1]);
        assert_eq!(layout.strides[1][4..], [0, 0, 0, 1]);
        assert_eq!(layout.strides[2][4..], [0, 0, 1, 0]);
        assert_eq!(layout.input_offset(1, 130), 2);
        assert_eq!(layout.input_offset(2, 64), 1);
        assert_eq!(layout.input_offset(2, 128), 0);
    }

    #[test]
    fn gelu_grad_broadcasts_trailing_vector() {
        let big = TensorShapeView::new(vec![1, 64, 2, 64], DType::Float16);
        let small = TensorShapeView::new(vec![64], DType::Float16);
        let ctx = TilingContext::new(hw95())
            .with_input(big.clone())
            .with_input(small.clone())
            .with_input(big.clone())
            .with_output(big.clone());
        let out = tile("gelu_grad", &ctx).unwrap();
        assert_eq!(out.wire_key, 101);
        let mut r = out.blob.reader().unwrap();
        crate::blob::PlanHeader::read(&mut r).unwrap();
        let layout = BroadcastLayout::read(&mut r).unwrap();
        assert_eq!(layout.strides[1][7], 1);
        assert!(r.is_done());

        let bad = TensorShapeView::new(vec![1, 64, 2, 3], DType::Float16);
        let ctx = TilingContext::new(hw95())
            .with_input(big.clone())
            .with_input(bad)
            .with_input(big.clone())
            .with_output(big);
        assert!(matches!(tile("gelu_grad", &ctx), Err(TilingError::ShapeMismatch { .. })));
    }

    #[test]
    fn gelu_grad_empty_input() {
        let empty = TensorShapeView::new(vec![1, 64, 0, 64], DType::Float32);
        let small = TensorShapeView::new(vec![64], DType::Float32);
        let ctx = TilingContext::new(hw95())
            .with_input(empty.clone())
            .with_input(small)
            .with_input(empty.clone())
            .with_output(empty);
        assert!(matches!(tile("gelu_grad", &ctx), Err(TilingError::EmptyTensor { .. })));
    }
}

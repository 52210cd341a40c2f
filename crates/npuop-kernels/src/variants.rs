//! Reference kernel variants for every planned operator family.
//!
//! Each builder reads its family's blob fields after the common header and
//! returns a [`ChunkKernel`]. Values are widened to `f32`, computed, and
//! narrowed back to the storage dtype.

use std::ops::Range;
use std::sync::Arc;

use bytemuck::{bytes_of, cast_slice, pod_collect_to_vec};
use npuop_common::math::ceil_align;
use npuop_common::DType;
use npuop_tiling::ops::elementwise::{BroadcastLayout, EluParams};
use npuop_tiling::ops::geglu_grad::GeGluGradParams;
use npuop_tiling::ops::gelu_quant::{GeluQuantParams, OperandKind};
use npuop_tiling::ops::scatter_add::ScatterAddParams;
use npuop_tiling::{Approximation, ChunkDescriptor, ElementwiseVariant, QuantInputs, ScatterKey, TilingKey};

use crate::activations::{elu, gelu_erf, gelu_erf_grad, gelu_tanh, gelu_tanh_grad, relu};
use crate::chunk::{ChunkKernel, OutputMap};
use crate::convert::{from_f32, relu_int, to_f32};
use crate::dispatcher::KernelArgs;
use crate::error::{DispatchError, Result};
use crate::gm::DeviceIo;

/// Dtype of input 0, checked against the key and the plan's element size.
fn bound_dtype(args: &KernelArgs<'_, '_>, expected: Option<DType>) -> Result<DType> {
    let dtype = args.io.input_dtype(0)?;
    if let Some(expected) = expected {
        if dtype != expected {
            return Err(DispatchError::operand("input0", format!("kernel `{}` expects {expected}, got {dtype}", args.key)));
        }
    }
    if dtype.size_bytes() != args.header.geometry.elem_bytes {
        return Err(DispatchError::operand(
            "input0",
            format!("{dtype} does not match the planned element size of {} bytes", args.header.geometry.elem_bytes),
        ));
    }
    Ok(dtype)
}

fn key_dtype(key: &TilingKey) -> Option<DType> {
    match key {
        TilingKey::Elementwise { variant: ElementwiseVariant::PerDtype(dtype), .. } => Some(*dtype),
        TilingKey::GluGrad { dtype, .. } => Some(dtype.dtype()),
        _ => None,
    }
}

fn map_f32(dtype: DType, bytes: &[u8], f: impl Fn(f32) -> f32) -> Result<Vec<u8>> {
    let values: Vec<f32> = to_f32(dtype, bytes)?.into_iter().map(f).collect();
    from_f32(dtype, &values)
}

/// Aligned footprint of `chunk` in input 0.
fn read_footprint(io: &DeviceIo, chunk: &ChunkDescriptor, elem_bytes: u64, align_bytes: u64) -> Result<Vec<u8>> {
    let len = ceil_align(chunk.byte_len(elem_bytes), align_bytes);
    Ok(io.input(0)?.read(chunk.core, chunk.byte_offset(elem_bytes), len)?)
}

// ── relu / elu ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    Relu,
    Elu(EluParams),
}

/// Contiguous unary kernel: copy-in moves the aligned footprint of `x`.
#[derive(Debug)]
pub struct UnaryKernel {
    op: UnaryOp,
    dtype: DType,
    align_bytes: u64,
}

impl ChunkKernel for UnaryKernel {
    fn name(&self) -> &'static str {
        match self.op {
            UnaryOp::Relu => "relu",
            UnaryOp::Elu(_) => "elu",
        }
    }

    fn copy_in(&self, io: &DeviceIo, chunk: &ChunkDescriptor) -> Result<Vec<u8>> {
        read_footprint(io, chunk, self.dtype.size_bytes(), self.align_bytes)
    }

    fn compute(&self, chunk: &ChunkDescriptor, mut staged: Vec<u8>) -> Result<Vec<u8>> {
        staged.truncate(chunk.byte_len(self.dtype.size_bytes()) as usize);
        match self.op {
            UnaryOp::Relu if !self.dtype.is_float() => relu_int(self.dtype, &staged),
            UnaryOp::Relu => map_f32(self.dtype, &staged, relu),
            UnaryOp::Elu(p) => map_f32(self.dtype, &staged, |x| elu(x, p.alpha, p.scale, p.input_scale)),
        }
    }
}

pub fn relu_variant(args: KernelArgs<'_, '_>) -> Result<Box<dyn ChunkKernel>> {
    let dtype = bound_dtype(&args, key_dtype(&args.key))?;
    Ok(Box::new(UnaryKernel { op: UnaryOp::Relu, dtype, align_bytes: args.header.geometry.align_bytes }))
}

pub fn elu_variant(args: KernelArgs<'_, '_>) -> Result<Box<dyn ChunkKernel>> {
    let dtype = bound_dtype(&args, None)?;
    let params = EluParams::read(args.params)?;
    Ok(Box::new(UnaryKernel { op: UnaryOp::Elu(params), dtype, align_bytes: args.header.geometry.align_bytes }))
}

// ── caller-supplied element function ────────────────────────────────

pub type ElementFn = Arc<dyn Fn(f32) -> f32 + Send + Sync>;

/// Contiguous unary kernel over a float dtype applying a caller's function.
pub struct MapKernel {
    name: &'static str,
    dtype: DType,
    align_bytes: u64,
    f: ElementFn,
}

impl std::fmt::Debug for MapKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapKernel").field("name", &self.name).field("dtype", &self.dtype).finish()
    }
}

impl ChunkKernel for MapKernel {
    fn name(&self) -> &'static str {
        self.name
    }

    fn copy_in(&self, io: &DeviceIo, chunk: &ChunkDescriptor) -> Result<Vec<u8>> {
        read_footprint(io, chunk, self.dtype.size_bytes(), self.align_bytes)
    }

    fn compute(&self, chunk: &ChunkDescriptor, mut staged: Vec<u8>) -> Result<Vec<u8>> {
        staged.truncate(chunk.byte_len(self.dtype.size_bytes()) as usize);
        map_f32(self.dtype, &staged, |x| (self.f)(x))
    }
}

pub fn map_variant(name: &'static str, f: ElementFn, args: KernelArgs<'_, '_>) -> Result<Box<dyn ChunkKernel>> {
    let dtype = bound_dtype(&args, key_dtype(&args.key))?;
    if !dtype.is_float() {
        return Err(DispatchError::operand("input0", format!("`{name}` computes in f32, got {dtype}")));
    }
    Ok(Box::new(MapKernel { name, dtype, align_bytes: args.header.geometry.align_bytes, f }))
}

// ── gelu_grad ───────────────────────────────────────────────────────

/// `dx = dy * gelu'(x)` with `dy` and `x` broadcast to the output shape.
#[derive(Debug)]
pub struct GeluGradKernel {
    dtype: DType,
    layout: BroadcastLayout,
}

impl ChunkKernel for GeluGradKernel {
    fn name(&self) -> &'static str {
        "gelu_grad"
    }

    fn copy_in(&self, io: &DeviceIo, chunk: &ChunkDescriptor) -> Result<Vec<u8>> {
        let eb = self.dtype.size_bytes();
        let mut staged = io.input(0)?.gather(chunk.core, chunk.elem_range().map(|e| self.layout.input_offset(0, e)), eb)?;
        staged.extend(io.input(1)?.gather(chunk.core, chunk.elem_range().map(|e| self.layout.input_offset(1, e)), eb)?);
        Ok(staged)
    }

    fn compute(&self, _chunk: &ChunkDescriptor, staged: Vec<u8>) -> Result<Vec<u8>> {
        let (dy, x) = staged.split_at(staged.len() / 2);
        let dy = to_f32(self.dtype, dy)?;
        let x = to_f32(self.dtype, x)?;
        let dx: Vec<f32> = dy.iter().zip(&x).map(|(&g, &x)| g * gelu_tanh_grad(x)).collect();
        from_f32(self.dtype, &dx)
    }
}

pub fn gelu_grad_variant(args: KernelArgs<'_, '_>) -> Result<Box<dyn ChunkKernel>> {
    let dtype = bound_dtype(&args, key_dtype(&args.key))?;
    let layout = BroadcastLayout::read(args.params)?;
    Ok(Box::new(GeluGradKernel { dtype, layout }))
}

// ── ge_glu_grad_v2 ──────────────────────────────────────────────────

/// Gradient of `lin * gelu(gate)` where `x` rows are `[left | right]` and
/// `activate_left` picks which half is the gate.
#[derive(Debug)]
pub struct GeGluGradKernel {
    dtype: DType,
    params: GeGluGradParams,
}

impl GeGluGradKernel {
    /// Element offsets of the two halves of `x` for plan element `e`.
    fn x_offsets(&self, e: u64) -> (u64, u64) {
        let half = self.params.half_inner;
        let base = (e / half) * self.params.full_inner + e % half;
        (base, base + half)
    }
}

impl ChunkKernel for GeGluGradKernel {
    fn name(&self) -> &'static str {
        "ge_glu_grad_v2"
    }

    fn output_map(&self) -> OutputMap {
        OutputMap::SplitRows { half: self.params.half_inner }
    }

    /// Stages `dy | gelu | x_left | x_right`, one element each per plan element.
    fn copy_in(&self, io: &DeviceIo, chunk: &ChunkDescriptor) -> Result<Vec<u8>> {
        let eb = self.dtype.size_bytes();
        let core = chunk.core;
        let x = io.input(1)?;
        let mut staged = io.input(0)?.gather(core, chunk.elem_range(), eb)?;
        staged.extend(io.input(2)?.gather(core, chunk.elem_range(), eb)?);
        staged.extend(x.gather(core, chunk.elem_range().map(|e| self.x_offsets(e).0), eb)?);
        staged.extend(x.gather(core, chunk.elem_range().map(|e| self.x_offsets(e).1), eb)?);
        Ok(staged)
    }

    fn compute(&self, chunk: &ChunkDescriptor, staged: Vec<u8>) -> Result<Vec<u8>> {
        let values = to_f32(self.dtype, &staged)?;
        let n = chunk.elems as usize;
        if values.len() != 4 * n {
            return Err(DispatchError::operand("ge_glu_grad_v2", format!("staged {} values for {n} elements", values.len())));
        }
        let (dy, rest) = values.split_at(n);
        let (gelu, rest) = rest.split_at(n);
        let (left, right) = rest.split_at(n);
        let (lin, gate) = if self.params.activate_left { (right, left) } else { (left, right) };
        let grad: fn(f32) -> f32 = match self.params.approximation {
            Approximation::Tanh => gelu_tanh_grad,
            Approximation::Erf => gelu_erf_grad,
        };

        let mut d_lin = Vec::with_capacity(n);
        let mut d_gate = Vec::with_capacity(n);
        for i in 0..n {
            d_lin.push(dy[i] * gelu[i]);
            d_gate.push(dy[i] * lin[i] * grad(gate[i]));
        }
        let (first, second) = if self.params.activate_left { (d_gate, d_lin) } else { (d_lin, d_gate) };
        let mut out = from_f32(self.dtype, &first)?;
        out.extend(from_f32(self.dtype, &second)?);
        Ok(out)
    }
}

pub fn geglu_grad_variant(args: KernelArgs<'_, '_>) -> Result<Box<dyn ChunkKernel>> {
    let dtype = bound_dtype(&args, key_dtype(&args.key))?;
    let params = GeGluGradParams::read(args.params)?;
    if params.half_inner == 0 || params.full_inner != 2 * params.half_inner {
        return Err(DispatchError::operand(
            "ge_glu_grad_v2",
            format!("half {} and full {} rows do not split evenly", params.half_inner, params.full_inner),
        ));
    }
    Ok(Box::new(GeGluGradKernel { dtype, params }))
}

// ── gelu_quant ──────────────────────────────────────────────────────

/// Largest int8 magnitude; a dynamic row's maximum maps onto it.
pub const INT8_MAX: f32 = 127.0;

/// Round half to even, then saturate to int8.
pub fn quantize_int8(v: f32) -> i8 {
    libm::rintf(v).clamp(-128.0, INT8_MAX) as i8
}

/// Multiplier taking a row maximum of `absmax` onto the int8 range; an
/// all-zero row quantizes to zeros.
pub fn dynamic_factor(absmax: f32) -> f32 {
    if absmax > 0.0 {
        INT8_MAX / absmax
    } else {
        0.0
    }
}

fn operand_kind(code: u32) -> Result<OperandKind> {
    [OperandKind::Absent, OperandKind::Scalar, OperandKind::PerChannel]
        .into_iter()
        .find(|kind| kind.code() == code)
        .ok_or_else(|| DispatchError::operand("gelu_quant", format!("unknown operand kind {code}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QuantStep {
    /// `gelu(x) * scale + offset`.
    Static { scale: OperandKind, offset: OperandKind },
    /// `gelu(x) * smooth`, divided by the row's `max |.| / 127`.
    Dynamic { smooth: OperandKind },
}

/// GELU followed by int8 quantization. Rows are `end` elements long and
/// per-channel operands are indexed by the position within the row.
#[derive(Debug)]
pub struct GeluQuantKernel {
    x_dtype: DType,
    step: QuantStep,
    tanh: bool,
    end: u64,
    align_bytes: u64,
}

impl GeluQuantKernel {
    fn gelu(&self, x: f32) -> f32 {
        if self.tanh {
            gelu_tanh(x)
        } else {
            gelu_erf(x)
        }
    }

    /// Input `index` at the channel of each element in `elems`, or `absent`
    /// when the operand is not there.
    fn operand(
        &self,
        io: &DeviceIo,
        core: u64,
        index: usize,
        kind: OperandKind,
        elems: Range<u64>,
        absent: f32,
    ) -> Result<Vec<f32>> {
        let channels = elems.clone().map(|e| if kind == OperandKind::Scalar { 0 } else { e % self.end });
        match kind {
            OperandKind::Absent => Ok(vec![absent; (elems.end - elems.start) as usize]),
            _ => {
                let dtype = io.input_dtype(index)?;
                to_f32(dtype, &io.input(index)?.gather(core, channels, dtype.size_bytes())?)
            }
        }
    }

    /// Largest `|gelu(x) * smooth|` over `row`.
    fn row_absmax(&self, io: &DeviceIo, core: u64, row: u64) -> Result<f32> {
        let QuantStep::Dynamic { smooth } = self.step else {
            return Ok(0.0);
        };
        let eb = self.x_dtype.size_bytes();
        let x = to_f32(self.x_dtype, &io.input(0)?.read(core, row * self.end * eb, self.end * eb)?)?;
        let smooth = self.operand(io, core, 1, smooth, row * self.end..(row + 1) * self.end, 1.0)?;
        Ok(x.iter().zip(&smooth).map(|(&x, &s)| (self.gelu(x) * s).abs()).fold(0.0, f32::max))
    }
}

impl ChunkKernel for GeluQuantKernel {
    fn name(&self) -> &'static str {
        "gelu_quant"
    }

    fn output_map(&self) -> OutputMap {
        OutputMap::Narrow { elem_bytes: DType::Int8.size_bytes() }
    }

    /// Stages `x | a | b` as f32. Static steps stage the scale and offset of
    /// each element; dynamic steps stage the smoothing factor of each element
    /// and then the row maximum once.
    fn copy_in(&self, io: &DeviceIo, chunk: &ChunkDescriptor) -> Result<Vec<u8>> {
        let eb = self.x_dtype.size_bytes();
        let mut x = read_footprint(io, chunk, eb, self.align_bytes)?;
        x.truncate(chunk.byte_len(eb) as usize);
        let mut staged = to_f32(self.x_dtype, &x)?;
        match self.step {
            QuantStep::Static { scale, offset } => {
                staged.extend(self.operand(io, chunk.core, 1, scale, chunk.elem_range(), 1.0)?);
                staged.extend(self.operand(io, chunk.core, 2, offset, chunk.elem_range(), 0.0)?);
            }
            QuantStep::Dynamic { smooth } => {
                staged.extend(self.operand(io, chunk.core, 1, smooth, chunk.elem_range(), 1.0)?);
                staged.push(self.row_absmax(io, chunk.core, chunk.elem_offset / self.end)?);
            }
        }
        Ok(cast_slice::<f32, u8>(&staged).to_vec())
    }

    fn compute(&self, chunk: &ChunkDescriptor, staged: Vec<u8>) -> Result<Vec<u8>> {
        let values: Vec<f32> = pod_collect_to_vec(&staged[..]);
        let n = chunk.elems as usize;
        let expected = match self.step {
            QuantStep::Static { .. } => 3 * n,
            QuantStep::Dynamic { .. } => 2 * n + 1,
        };
        if values.len() != expected {
            return Err(DispatchError::operand("gelu_quant", format!("staged {} values for {n} elements", values.len())));
        }
        let (x, rest) = values.split_at(n);
        let (a, b) = rest.split_at(n);
        let q: Vec<i8> = match self.step {
            QuantStep::Static { .. } => {
                x.iter().zip(a).zip(b).map(|((&x, &s), &o)| quantize_int8(self.gelu(x) * s + o)).collect()
            }
            QuantStep::Dynamic { .. } => {
                let factor = dynamic_factor(b[0]);
                x.iter().zip(a).map(|(&x, &s)| quantize_int8(self.gelu(x) * s * factor)).collect()
            }
        };
        Ok(cast_slice::<i8, u8>(&q).to_vec())
    }

    /// A dynamic step writes the row's scale to output 1 with the row's
    /// first chunk.
    fn copy_out_side(&self, io: &DeviceIo, chunk: &ChunkDescriptor) -> Result<()> {
        if !matches!(self.step, QuantStep::Dynamic { .. }) || chunk.elem_offset % self.end != 0 {
            return Ok(());
        }
        let row = chunk.elem_offset / self.end;
        let scale = self.row_absmax(io, chunk.core, row)? / INT8_MAX;
        io.output(1)?.write(chunk.core, row * DType::Float32.size_bytes(), bytes_of(&scale))?;
        Ok(())
    }
}

pub fn gelu_quant_variant(args: KernelArgs<'_, '_>) -> Result<Box<dyn ChunkKernel>> {
    let x_dtype = bound_dtype(&args, None)?;
    let params = GeluQuantParams::read(args.params)?;
    let scale_dtype = args.io.optional_input(1).map(|_| args.io.input_dtype(1)).transpose()?;
    if let TilingKey::GeluQuant { inputs, .. } = args.key {
        if QuantInputs::select(x_dtype, scale_dtype) != inputs {
            return Err(DispatchError::operand(
                "input1",
                format!("{x_dtype} with scale {scale_dtype:?} does not match kernel `{}`", args.key),
            ));
        }
    }
    if params.dst_type != DType::Int8.code() as u32 || args.io.output_dtype(0)? != DType::Int8 {
        return Err(DispatchError::operand(
            "output0",
            format!("the reference kernel quantizes to int8 only, plan targets dtype code {}", params.dst_type),
        ));
    }
    if params.end_axis == 0 {
        return Err(DispatchError::operand("gelu_quant", "rows are empty"));
    }
    let scale = operand_kind(params.scale_kind)?;
    let step = if params.quant_mode == 1 {
        if args.io.output_dtype(1)? != DType::Float32 {
            return Err(DispatchError::operand("output1", "out_scale must be float32"));
        }
        QuantStep::Dynamic { smooth: scale }
    } else {
        if scale == OperandKind::Absent {
            return Err(DispatchError::operand("input1", "static quantization needs a scale"));
        }
        QuantStep::Static { scale, offset: operand_kind(params.offset_kind)? }
    };
    Ok(Box::new(GeluQuantKernel {
        x_dtype,
        step,
        tanh: params.approximate != 0,
        end: params.end_axis,
        align_bytes: args.header.geometry.align_bytes,
    }))
}

// ── scatter_add ─────────────────────────────────────────────────────

/// Output offset of an update whose index falls outside `var`.
const SKIPPED: u64 = u64::MAX;

/// `var[indices[i], j] += updates[i, j]`, one plan element per update
/// element. Output 0 starts as `var`. Indices outside `[0, var_rows)` are
/// skipped. Integer element types wrap.
#[derive(Debug)]
pub struct ScatterAddKernel {
    dtype: DType,
    index_dtype: DType,
    var_rows: u64,
    var_cols: u64,
    scalar_updates: bool,
}

impl ScatterAddKernel {
    fn staged_len(&self, n: usize) -> usize {
        n * (std::mem::size_of::<u64>() + self.dtype.size_bytes() as usize)
    }
}

impl ChunkKernel for ScatterAddKernel {
    fn name(&self) -> &'static str {
        "scatter_add"
    }

    fn output_map(&self) -> OutputMap {
        OutputMap::Accumulate
    }

    /// Stages the index of each element's row as i64, then the update values.
    fn copy_in(&self, io: &DeviceIo, chunk: &ChunkDescriptor) -> Result<Vec<u8>> {
        let core = chunk.core;
        let rows = chunk.elem_range().map(|e| e / self.var_cols);
        let raw = io.input(1)?.gather(core, rows, self.index_dtype.size_bytes())?;
        let indices: Vec<i64> = match self.index_dtype {
            DType::Int32 => pod_collect_to_vec::<u8, i32>(&raw).into_iter().map(i64::from).collect(),
            _ => pod_collect_to_vec::<u8, i64>(&raw),
        };
        let eb = self.dtype.size_bytes();
        let updates = if self.scalar_updates {
            io.input(2)?.gather(core, chunk.elem_range().map(|_| 0), eb)?
        } else {
            io.input(2)?.read(core, chunk.byte_offset(eb), chunk.byte_len(eb))?
        };
        let mut staged = cast_slice::<i64, u8>(&indices).to_vec();
        staged.extend(updates);
        Ok(staged)
    }

    /// Resolves each index to an output element offset.
    fn compute(&self, chunk: &ChunkDescriptor, staged: Vec<u8>) -> Result<Vec<u8>> {
        let n = chunk.elems as usize;
        if staged.len() != self.staged_len(n) {
            return Err(DispatchError::operand("scatter_add", format!("staged {} bytes for {n} elements", staged.len())));
        }
        let (indices, updates) = staged.split_at(8 * n);
        let targets: Vec<u64> = pod_collect_to_vec::<u8, i64>(indices)
            .into_iter()
            .zip(chunk.elem_range())
            .map(|(index, e)| match u64::try_from(index) {
                Ok(row) if row < self.var_rows => row * self.var_cols + e % self.var_cols,
                _ => SKIPPED,
            })
            .collect();
        let mut local = cast_slice::<u64, u8>(&targets).to_vec();
        local.extend_from_slice(updates);
        Ok(local)
    }

    fn accumulate(&self, io: &DeviceIo, chunk: &ChunkDescriptor, local: &[u8]) -> Result<()> {
        let n = chunk.elems as usize;
        if local.len() != self.staged_len(n) {
            return Err(DispatchError::operand("scatter_add", format!("computed {} bytes for {n} elements", local.len())));
        }
        let (targets, values) = local.split_at(8 * n);
        let out = io.output(0)?;
        let eb = self.dtype.size_bytes() as usize;
        for (target, value) in pod_collect_to_vec::<u8, u64>(targets).into_iter().zip(values.chunks_exact(eb)) {
            if target != SKIPPED {
                out.atomic_add(chunk.core, self.dtype, target, value)?;
            }
        }
        Ok(())
    }
}

pub fn scatter_add_variant(args: KernelArgs<'_, '_>) -> Result<Box<dyn ChunkKernel>> {
    let dtype = bound_dtype(&args, None)?;
    let params = ScatterAddParams::read(args.params)?;
    let index_dtype = args.io.input_dtype(1)?;
    if !matches!(index_dtype, DType::Int32 | DType::Int64) || index_dtype.size_bytes() != u64::from(params.index_bytes) {
        return Err(DispatchError::operand(
            "input1",
            format!("indices are {index_dtype}, the plan expects {}-byte integers", params.index_bytes),
        ));
    }
    for (name, bound) in [("input2", args.io.input_dtype(2)?), ("output0", args.io.output_dtype(0)?)] {
        if bound != dtype {
            return Err(DispatchError::operand(name, format!("expected {dtype} like var, got {bound}")));
        }
    }
    let scalar_updates = matches!(args.key, TilingKey::ScatterAdd(ScatterKey::Active { scalar_updates: true, .. }));
    Ok(Box::new(ScatterAddKernel {
        dtype,
        index_dtype,
        var_rows: params.var_rows,
        var_cols: params.var_cols.max(1),
        scalar_updates,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int8_quantization_rints_and_saturates() {
        assert_eq!(quantize_int8(2.5), 2);
        assert_eq!(quantize_int8(3.5), 4);
        assert_eq!(quantize_int8(-2.5), -2);
        assert_eq!(quantize_int8(300.0), 127);
        assert_eq!(quantize_int8(-300.0), -128);
        assert_eq!(quantize_int8(f32::NAN), 0);
    }

    #[test]
    fn zero_rows_quantize_to_zero() {
        assert_eq!(dynamic_factor(0.0), 0.0);
        assert_eq!(dynamic_factor(254.0), 0.5);
    }
}

//! Shape analysis: validate operator operands and reduce them to the
//! problem-size scalars the planner works on.
//!
//! Every function here is pure and returns a typed [`TilingError`] on the
//! first violated rule.

use serde::Serialize;

use npuop_common::{broadcast_shapes, checked_extent, AttrMap, DType, Layout, Result, TensorShapeView, TilingError};

/// Operand checks for one elementwise-like operator.
#[derive(Debug, Clone, Copy)]
pub struct ElementwiseRules<'a> {
    pub op: &'a str,
    pub dtypes: &'a [DType],
    pub layout: Layout,
    pub allow_empty: bool,
    /// Attribute naming the axis the inner extent starts at; the last axis
    /// when `None`.
    pub axis_attr: Option<&'a str>,
}

impl<'a> ElementwiseRules<'a> {
    pub fn new(op: &'a str, dtypes: &'a [DType]) -> Self {
        Self { op, dtypes, layout: Layout::Nd, allow_empty: false, axis_attr: None }
    }

    #[must_use]
    pub fn with_axis_attr(mut self, name: &'a str) -> Self {
        self.axis_attr = Some(name);
        self
    }

    #[must_use]
    pub fn with_empty_allowed(mut self, allowed: bool) -> Self {
        self.allow_empty = allowed;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ElementwiseProblem {
    /// Broadcast output shape.
    pub shape: Vec<u64>,
    pub outer: u64,
    pub inner: u64,
    pub dtype: DType,
    pub layout: Layout,
}

impl ElementwiseProblem {
    pub fn total(&self) -> u64 {
        self.outer * self.inner
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

fn check_layout(op: &str, name: &str, t: &TensorShapeView, expected: Layout) -> Result<()> {
    if t.layout != expected {
        return Err(TilingError::UnsupportedLayout {
            op: op.to_string(),
            tensor: name.to_string(),
            layout: t.layout,
            expected,
        });
    }
    Ok(())
}

/// Validate broadcasting inputs and outputs and fold the output shape at the
/// inner axis.
pub fn analyze_elementwise_like(
    rules: &ElementwiseRules<'_>,
    inputs: &[(&str, &TensorShapeView)],
    outputs: &[(&str, &TensorShapeView)],
    attrs: &AttrMap,
) -> Result<ElementwiseProblem> {
    let op = rules.op;
    let (_, first) = inputs.first().ok_or_else(|| TilingError::missing(op, "x"))?;
    let dtype = first.dtype;
    if !rules.dtypes.contains(&dtype) {
        return Err(TilingError::dtype(op, inputs[0].0, dtype));
    }

    for (name, t) in inputs.iter().chain(outputs) {
        if t.dtype != dtype {
            return Err(TilingError::dtype(op, name, t.dtype));
        }
        check_layout(op, name, t, rules.layout)?;
        t.check_size(op, name)?;
        if !rules.allow_empty && t.is_empty() {
            return Err(TilingError::empty(op, name, &t.dims));
        }
    }

    let shape = broadcast_shapes(op, inputs.iter().map(|(_, t)| t.dims.as_slice()))?;
    checked_extent(op, "broadcast output", &shape, dtype)?;
    for (name, t) in outputs {
        if t.dims != shape {
            return Err(TilingError::shape_mismatch(
                op,
                format!("output `{name}` has shape {:?}, inputs broadcast to {shape:?}", t.dims),
            ));
        }
    }

    let rank = shape.len();
    let axis = match rules.axis_attr {
        Some(name) if rank > 0 => {
            let raw = attrs.int_or(op, name, -1)?;
            npuop_common::normalize_axis(raw, rank)
                .ok_or_else(|| TilingError::attribute(op, name, format!("axis {raw} out of range for rank {rank}")))?
        }
        _ => rank.saturating_sub(1),
    };
    let outer = shape[..axis].iter().product();
    let inner = shape[axis..].iter().product();

    Ok(ElementwiseProblem { shape, outer, inner, dtype, layout: rules.layout })
}

// ---------------------------------------------------------------------------
// Split GLU
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SplitGluProblem {
    /// Product of the dims before `dim`.
    pub outer: u64,
    /// Elements of one half, from `dim` on.
    pub half_inner: u64,
    /// Elements of `x` from `dim` on (both halves).
    pub full_inner: u64,
    pub dim: usize,
    pub dtype: DType,
    /// `approximate` attribute: 0 erf, 1 tanh.
    pub approximate: i64,
    pub activate_left: bool,
}

/// Validate a split-in-half gradient operator (`dy`, `x`, `gelu` -> `dx`).
pub fn analyze_split_glu(
    op: &str,
    dy: &TensorShapeView,
    x: &TensorShapeView,
    gelu: &TensorShapeView,
    out: &TensorShapeView,
    attrs: &AttrMap,
) -> Result<SplitGluProblem> {
    let raw_dim = attrs.int_or(op, "dim", -1)?;
    let approximate = attrs.int_or(op, "approximate", 1)?;
    if !matches!(approximate, 0 | 1) {
        return Err(TilingError::attribute(op, "approximate", format!("expected 0 or 1, got {approximate}")));
    }
    let activate_left = attrs.bool_or(op, "activate_left", false)?;

    let dtype = x.dtype;
    for (name, t) in [("dy", dy), ("gelu", gelu), ("dx", out)] {
        if t.dtype != dtype {
            return Err(TilingError::dtype(op, name, t.dtype));
        }
    }

    let rank = x.rank();
    let dim = x
        .normalize_axis(raw_dim)
        .ok_or_else(|| TilingError::attribute(op, "dim", format!("{raw_dim} out of range for rank {rank}")))?;

    if dy.dims != gelu.dims {
        return Err(TilingError::shape_mismatch(
            op,
            format!("gelu {:?} must match dy {:?}", gelu.dims, dy.dims),
        ));
    }
    if out.dims != x.dims {
        return Err(TilingError::shape_mismatch(op, format!("dx {:?} must match x {:?}", out.dims, x.dims)));
    }
    if dy.rank() != rank {
        return Err(TilingError::shape_mismatch(op, format!("dy rank {} differs from x rank {rank}", dy.rank())));
    }
    if x.dims[dim] % 2 != 0 {
        return Err(TilingError::shape_mismatch(op, format!("x.shape[{dim}] = {} is not even", x.dims[dim])));
    }
    for (i, (&d, &xd)) in dy.dims.iter().zip(&x.dims).enumerate() {
        let expected = if i == dim { xd / 2 } else { xd };
        if d != expected {
            return Err(TilingError::shape_mismatch(
                op,
                format!("dy.shape[{i}] = {d}, expected {expected} for x {:?} split at dim {dim}", x.dims),
            ));
        }
    }
    for (name, t) in [("dy", dy), ("x", x)] {
        if t.is_empty() {
            return Err(TilingError::empty(op, name, &t.dims));
        }
    }

    let (outer, half_inner) = dy.fold_at(dim);
    let (_, full_inner) = x.fold_at(dim);
    Ok(SplitGluProblem { outer, half_inner, full_inner, dim, dtype, approximate, activate_left })
}

// ---------------------------------------------------------------------------
// Index scatter
// ---------------------------------------------------------------------------

pub const SCATTER_VAR_DTYPES: [DType; 6] =
    [DType::Int32, DType::Int8, DType::UInt8, DType::Float16, DType::Float32, DType::BFloat16];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScatterProblem {
    pub var_rows: u64,
    /// Elements of one `var` row.
    pub var_cols: u64,
    pub indices_num: u64,
    pub dtype: DType,
    pub index_dtype: DType,
    pub scalar_updates: bool,
    pub has_mask: bool,
    /// Offsets into `var` need 64-bit arithmetic.
    pub wide_addr: bool,
    pub use_locking: bool,
}

impl ScatterProblem {
    pub fn var_elems(&self) -> u64 {
        self.var_rows * self.var_cols
    }

    /// Nothing to scatter; the kernel is a no-op.
    pub fn is_empty(&self) -> bool {
        self.var_elems() == 0 || self.indices_num == 0
    }
}

/// Validate `var[indices[i]] += updates[i]` operands.
pub fn analyze_index_scatter(
    op: &str,
    var: &TensorShapeView,
    indices: &TensorShapeView,
    updates: &TensorShapeView,
    mask: Option<&TensorShapeView>,
    attrs: &AttrMap,
) -> Result<ScatterProblem> {
    if !matches!(indices.dtype, DType::Int32 | DType::Int64) {
        return Err(TilingError::dtype(op, "indices", indices.dtype));
    }
    if !SCATTER_VAR_DTYPES.contains(&var.dtype) {
        return Err(TilingError::dtype(op, "var", var.dtype));
    }
    if updates.dtype != var.dtype {
        return Err(TilingError::dtype(op, "updates", updates.dtype));
    }
    if var.rank() == 0 {
        return Err(TilingError::shape_mismatch(op, "var must have at least one dimension"));
    }

    let scalar_updates = updates.rank() == 0 || (updates.is_scalar() && indices.numel() != 1);
    if !scalar_updates {
        let expected: Vec<u64> = indices.dims.iter().chain(&var.dims[1..]).copied().collect();
        if updates.dims != expected {
            return Err(TilingError::shape_mismatch(
                op,
                format!("updates {:?} must be indices ++ var[1..] = {expected:?}", updates.dims),
            ));
        }
    }

    if let Some(mask) = mask {
        if mask.dtype != DType::Bool {
            return Err(TilingError::dtype(op, "mask", mask.dtype));
        }
        let rows = indices.dims.first().copied().unwrap_or(1);
        if mask.dims.first().copied().unwrap_or(1) != rows {
            return Err(TilingError::shape_mismatch(
                op,
                format!("mask {:?} must have {rows} rows like indices", mask.dims),
            ));
        }
    }

    let var_rows = var.dims[0];
    let var_cols = var.dims[1..].iter().product();
    let var_elems = var.numel();
    Ok(ScatterProblem {
        var_rows,
        var_cols,
        indices_num: indices.numel(),
        dtype: var.dtype,
        index_dtype: indices.dtype,
        scalar_updates,
        has_mask: mask.is_some(),
        wide_addr: var_elems > i32::MAX as u64,
        use_locking: attrs.bool_or(op, "use_locking", false)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(dims: &[u64], dtype: DType) -> TensorShapeView {
        TensorShapeView::new(dims.to_vec(), dtype)
    }

    const RELU: [DType; 3] = [DType::Float16, DType::BFloat16, DType::Float32];

    #[test]
    fn elementwise_folds_at_last_axis() {
        let x = t(&[4, 5, 6], DType::Float16);
        let p = analyze_elementwise_like(&ElementwiseRules::new("relu", &RELU), &[("x", &x)], &[("y", &x)], &AttrMap::new())
            .unwrap();
        assert_eq!((p.outer, p.inner), (20, 6));
        assert_eq!(p.total(), 120);
    }

    #[test]
    fn broadcast_that_overflows_is_an_error() {
        // Each operand is modest; their broadcast is not.
        let a = t(&[1 << 32, 1], DType::Float32);
        let b = t(&[1, 1 << 32], DType::Float32);
        let err = analyze_elementwise_like(&ElementwiseRules::new("add_like", &RELU), &[("a", &a), ("b", &b)], &[], &AttrMap::new())
            .unwrap_err();
        assert!(matches!(err, TilingError::ShapeMismatch { .. }));

        let x = t(&[1 << 32, 1 << 32], DType::Float32);
        assert!(analyze_elementwise_like(&ElementwiseRules::new("relu", &RELU), &[("x", &x)], &[("y", &x)], &AttrMap::new())
            .is_err());
    }

    #[test]
    fn elementwise_attribute_axis() {
        let x = t(&[4, 5, 6], DType::Float32);
        let rules = ElementwiseRules::new("softmax_like", &RELU).with_axis_attr("axis");
        let attrs = AttrMap::new().with("axis", 1i64);
        let p = analyze_elementwise_like(&rules, &[("x", &x)], &[], &attrs).unwrap();
        assert_eq!((p.outer, p.inner), (4, 30));
        let attrs = AttrMap::new().with("axis", 3i64);
        assert!(matches!(
            analyze_elementwise_like(&rules, &[("x", &x)], &[], &attrs),
            Err(TilingError::InvalidAttribute { .. })
        ));
    }

    #[test]
    fn elementwise_broadcasts_small_inputs() {
        let a = t(&[1, 64, 2, 64], DType::Float32);
        let b = t(&[64], DType::Float32);
        let y = t(&[1, 64, 2, 64], DType::Float32);
        let rules = ElementwiseRules::new("gelu_grad", &RELU);
        let p = analyze_elementwise_like(&rules, &[("dy", &a), ("x", &b)], &[("z", &y)], &AttrMap::new()).unwrap();
        assert_eq!(p.inner, 64);

        let bad = t(&[1, 64, 2, 3], DType::Float32);
        let err = analyze_elementwise_like(&rules, &[("dy", &a), ("x", &bad)], &[("z", &y)], &AttrMap::new())
            .unwrap_err();
        assert!(matches!(err, TilingError::ShapeMismatch { .. }));
    }

    #[test]
    fn elementwise_rejections() {
        let rules = ElementwiseRules::new("relu", &RELU);
        let x = t(&[8], DType::Float16);
        let y32 = t(&[8], DType::Float32);
        assert!(matches!(
            analyze_elementwise_like(&rules, &[("x", &x)], &[("y", &y32)], &AttrMap::new()),
            Err(TilingError::UnsupportedDtype { .. })
        ));

        let f64x = t(&[8], DType::Float64);
        assert!(matches!(
            analyze_elementwise_like(&rules, &[("x", &f64x)], &[], &AttrMap::new()),
            Err(TilingError::UnsupportedDtype { .. })
        ));

        let empty = t(&[8, 0], DType::Float16);
        assert!(matches!(
            analyze_elementwise_like(&rules, &[("x", &empty)], &[], &AttrMap::new()),
            Err(TilingError::EmptyTensor { .. })
        ));
        assert!(analyze_elementwise_like(&rules.with_empty_allowed(true), &[("x", &empty)], &[], &AttrMap::new())
            .unwrap()
            .is_empty());

        let nz = t(&[8], DType::Float16).with_layout(Layout::Nz);
        assert!(matches!(
            analyze_elementwise_like(&rules, &[("x", &nz)], &[], &AttrMap::new()),
            Err(TilingError::UnsupportedLayout { .. })
        ));

        let y = t(&[2, 8], DType::Float16);
        assert!(matches!(
            analyze_elementwise_like(&rules, &[("x", &x)], &[("y", &y)], &AttrMap::new()),
            Err(TilingError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn split_glu_halves() {
        let dy = t(&[23, 12, 1024], DType::BFloat16);
        let x = t(&[23, 12, 2048], DType::BFloat16);
        let p = analyze_split_glu("ge_glu_grad_v2", &dy, &x, &dy, &x, &AttrMap::new()).unwrap();
        assert_eq!((p.outer, p.half_inner, p.full_inner, p.dim), (276, 1024, 2048, 2));
        assert_eq!(p.approximate, 1);
        assert!(!p.activate_left);
    }

    #[test]
    fn split_glu_middle_dim() {
        let dy = t(&[4, 3, 5], DType::Float32);
        let x = t(&[4, 6, 5], DType::Float32);
        let attrs = AttrMap::new().with("dim", -2i64).with("approximate", 0i64);
        let p = analyze_split_glu("ge_glu_grad_v2", &dy, &x, &dy, &x, &attrs).unwrap();
        assert_eq!((p.outer, p.half_inner, p.full_inner), (4, 15, 30));
        assert_eq!(p.approximate, 0);
    }

    #[test]
    fn split_glu_rejections() {
        let op = "ge_glu_grad_v2";
        let dy = t(&[4, 3], DType::Float32);
        let odd = t(&[4, 7], DType::Float32);
        assert!(matches!(
            analyze_split_glu(op, &dy, &odd, &dy, &odd, &AttrMap::new()),
            Err(TilingError::ShapeMismatch { .. })
        ));

        let x = t(&[4, 8], DType::Float32);
        assert!(matches!(
            analyze_split_glu(op, &dy, &x, &dy, &x, &AttrMap::new()),
            Err(TilingError::ShapeMismatch { .. })
        ));

        let x = t(&[4, 6], DType::Float32);
        let attrs = AttrMap::new().with("dim", 2i64);
        assert!(matches!(analyze_split_glu(op, &dy, &x, &dy, &x, &attrs), Err(TilingError::InvalidAttribute { .. })));

        let dy16 = t(&[4, 3], DType::Float16);
        assert!(matches!(
            analyze_split_glu(op, &dy16, &x, &dy16, &x, &AttrMap::new()),
            Err(TilingError::UnsupportedDtype { .. })
        ));

        let empty_dy = t(&[0, 3], DType::Float32);
        let empty_x = t(&[0, 6], DType::Float32);
        assert!(matches!(
            analyze_split_glu(op, &empty_dy, &empty_x, &empty_dy, &empty_x, &AttrMap::new()),
            Err(TilingError::EmptyTensor { .. })
        ));
    }

    #[test]
    fn scatter_shapes() {
        let var = t(&[100, 32], DType::Float32);
        let idx = t(&[10], DType::Int32);
        let upd = t(&[10, 32], DType::Float32);
        let p = analyze_index_scatter("scatter_add", &var, &idx, &upd, None, &AttrMap::new()).unwrap();
        assert_eq!((p.var_rows, p.var_cols, p.indices_num), (100, 32, 10));
        assert!(!p.scalar_updates);
        assert!(!p.wide_addr);

        let scalar = t(&[], DType::Float32);
        let p = analyze_index_scatter("scatter_add", &var, &idx, &scalar, None, &AttrMap::new()).unwrap();
        assert!(p.scalar_updates);

        let bad = t(&[10, 31], DType::Float32);
        assert!(matches!(
            analyze_index_scatter("scatter_add", &var, &idx, &bad, None, &AttrMap::new()),
            Err(TilingError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn scatter_dtype_and_mask_rules() {
        let var = t(&[100, 32], DType::Float32);
        let upd = t(&[10, 32], DType::Float32);
        let idx16 = t(&[10], DType::Int16);
        assert!(matches!(
            analyze_index_scatter("scatter_add", &var, &idx16, &upd, None, &AttrMap::new()),
            Err(TilingError::UnsupportedDtype { .. })
        ));

        let idx = t(&[10], DType::Int64);
        let var64 = t(&[100, 32], DType::Int64);
        assert!(analyze_index_scatter("scatter_add", &var64, &idx, &upd, None, &AttrMap::new()).is_err());

        let upd16 = t(&[10, 32], DType::Float16);
        assert!(analyze_index_scatter("scatter_add", &var, &idx, &upd16, None, &AttrMap::new()).is_err());

        let mask = t(&[10], DType::Bool);
        let p = analyze_index_scatter("scatter_add", &var, &idx, &upd, Some(&mask), &AttrMap::new()).unwrap();
        assert!(p.has_mask);

        let short_mask = t(&[9], DType::Bool);
        assert!(analyze_index_scatter("scatter_add", &var, &idx, &upd, Some(&short_mask), &AttrMap::new()).is_err());
        let int_mask = t(&[10], DType::Int8);
        assert!(analyze_index_scatter("scatter_add", &var, &idx, &upd, Some(&int_mask), &AttrMap::new()).is_err());
    }

    #[test]
    fn scatter_empty_is_not_an_error() {
        let var = t(&[0, 32], DType::Float16);
        let idx = t(&[0], DType::Int32);
        let upd = t(&[0, 32], DType::Float16);
        let p = analyze_index_scatter("scatter_add", &var, &idx, &upd, None, &AttrMap::new()).unwrap();
        assert!(p.is_empty());
    }
}

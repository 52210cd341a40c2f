//! Read-only tensor descriptors and NumPy-style broadcasting.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::dtype::DType;
use crate::error::{Result, TilingError};

/// Logical storage layout of a tensor operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    /// Row-major N-dimensional layout.
    #[default]
    Nd,
    /// Blocked fractal layout used for matmul operands.
    Nz,
}

impl Layout {
    pub const fn ordinal(self) -> u64 {
        match self {
            Self::Nd => 0,
            Self::Nz => 1,
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nd => write!(f, "ND"),
            Self::Nz => write!(f, "FRACTAL_NZ"),
        }
    }
}

/// Largest tensor, in bytes, a plan may address. Device offsets are signed
/// 64-bit values.
pub const MAX_TENSOR_BYTES: u64 = i64::MAX as u64;

/// Product of `dims`, or `None` when it does not fit in a `u64`.
pub fn checked_numel(dims: &[u64]) -> Option<u64> {
    dims.iter().try_fold(1u64, |acc, &d| acc.checked_mul(d))
}

/// Element count of a `dims`-shaped tensor of `dtype`, failing with
/// `ShapeMismatch` when its byte size exceeds [`MAX_TENSOR_BYTES`].
pub fn checked_extent(op: &str, tensor: &str, dims: &[u64], dtype: DType) -> Result<u64> {
    checked_numel(dims)
        .filter(|&n| n.checked_mul(dtype.size_bytes()).is_some_and(|b| b <= MAX_TENSOR_BYTES))
        .ok_or_else(|| {
            TilingError::shape_mismatch(
                op,
                format!("{tensor} {dims:?} of {dtype} exceeds the {MAX_TENSOR_BYTES}-byte address space"),
            )
        })
}

/// One tensor's shape, element type and layout, as seen by the planner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorShapeView {
    pub dims: Vec<u64>,
    pub dtype: DType,
    #[serde(default)]
    pub layout: Layout,
}

impl TensorShapeView {
    pub fn new(dims: impl Into<Vec<u64>>, dtype: DType) -> Self {
        Self { dims: dims.into(), dtype, layout: Layout::Nd }
    }

    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Total element count; a rank-0 tensor holds one element. Saturates
    /// at `u64::MAX`; see [`Self::check_size`].
    pub fn numel(&self) -> u64 {
        saturating_product(&self.dims)
    }

    /// Fail unless the whole tensor fits in [`MAX_TENSOR_BYTES`].
    pub fn check_size(&self, op: &str, tensor: &str) -> Result<()> {
        checked_extent(op, tensor, &self.dims, self.dtype).map(|_| ())
    }

    pub fn is_empty(&self) -> bool {
        self.dims.iter().any(|&d| d == 0)
    }

    /// True for rank-0 tensors and tensors holding a single element.
    pub fn is_scalar(&self) -> bool {
        self.numel() == 1
    }

    pub fn elem_bytes(&self) -> u64 {
        self.dtype.size_bytes()
    }

    /// Extent of the last axis, or 1 for a rank-0 tensor.
    pub fn last_dim(&self) -> u64 {
        self.dims.last().copied().unwrap_or(1)
    }

    /// Resolve a possibly negative axis against this tensor's rank.
    pub fn normalize_axis(&self, axis: i64) -> Option<usize> {
        normalize_axis(axis, self.rank())
    }

    /// Product of the dims before `axis` and the product from `axis` on.
    pub fn fold_at(&self, axis: usize) -> (u64, u64) {
        let axis = axis.min(self.rank());
        (saturating_product(&self.dims[..axis]), saturating_product(&self.dims[axis..]))
    }
}

fn saturating_product(dims: &[u64]) -> u64 {
    dims.iter().fold(1u64, |acc, &d| acc.saturating_mul(d))
}

/// Resolve `axis` (negative counts from the back) into `0..rank`.
pub fn normalize_axis(axis: i64, rank: usize) -> Option<usize> {
    let rank = i64::try_from(rank).ok()?;
    let resolved = if axis < 0 { axis + rank } else { axis };
    if (0..rank).contains(&resolved) {
        usize::try_from(resolved).ok()
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Broadcasting
// ---------------------------------------------------------------------------

/// Compute the broadcast-compatible output shape (NumPy rules).
///
/// Shapes are right-aligned; missing leading dimensions are treated as 1.
pub fn broadcast_shape(op: &str, a: &[u64], b: &[u64]) -> Result<Vec<u64>> {
    let ndim = a.len().max(b.len());
    let mut out = Vec::with_capacity(ndim);

    for i in 0..ndim {
        let da = if i < ndim - a.len() { 1 } else { a[i - (ndim - a.len())] };
        let db = if i < ndim - b.len() { 1 } else { b[i - (ndim - b.len())] };

        if da == db || db == 1 {
            out.push(da);
        } else if da == 1 {
            out.push(db);
        } else {
            return Err(TilingError::shape_mismatch(
                op,
                format!("cannot broadcast {a:?} with {b:?}: dimension {i} has sizes {da} and {db}"),
            ));
        }
    }
    Ok(out)
}

/// Fold [`broadcast_shape`] over any number of shapes.
pub fn broadcast_shapes<'a, I>(op: &str, shapes: I) -> Result<Vec<u64>>
where
    I: IntoIterator<Item = &'a [u64]>,
{
    shapes.into_iter().try_fold(Vec::new(), |acc, s| broadcast_shape(op, &acc, s))
}

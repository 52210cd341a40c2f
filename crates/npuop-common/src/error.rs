//! Error taxonomy shared by the analyzer, planner and blob codec.

use thiserror::Error;

use crate::dtype::DType;
use crate::hardware::SocTag;
use crate::shape::Layout;

/// Host-side tiling failure.
///
/// Every variant is a compile-time rejection: tiling is a deterministic
/// function of shapes, dtypes and platform, so none of these is retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TilingError {
    #[error("{op}: shape mismatch: {reason}")]
    ShapeMismatch { op: String, reason: String },

    #[error("{op}: tensor `{tensor}` is empty (shape {shape:?})")]
    EmptyTensor { op: String, tensor: String, shape: Vec<u64> },

    #[error("{op}: dtype {dtype} of `{tensor}` is not supported")]
    UnsupportedDtype { op: String, tensor: String, dtype: DType },

    #[error("{op}: layout {layout} of `{tensor}` is not supported, expected {expected}")]
    UnsupportedLayout { op: String, tensor: String, layout: Layout, expected: Layout },

    #[error("tiling key {key} has no kernel variant on {soc}")]
    UnsupportedSocForKey { key: u64, soc: SocTag },

    #[error(
        "insufficient fast buffer: one aligned chunk needs {required} bytes \
         but only {available} are available"
    )]
    InsufficientBuffer { required: u64, available: u64 },

    #[error("{op}: attribute `{name}` is invalid: {reason}")]
    InvalidAttribute { op: String, name: String, reason: String },

    #[error("{op}: required input `{tensor}` is missing")]
    MissingInput { op: String, tensor: String },

    #[error("tiling schema error: {0}")]
    Schema(String),

    #[error("no tiling function registered for operator `{0}`")]
    UnknownOperator(String),
}

impl TilingError {
    pub fn shape_mismatch(op: &str, reason: impl Into<String>) -> Self {
        Self::ShapeMismatch { op: op.to_string(), reason: reason.into() }
    }

    pub fn empty(op: &str, tensor: &str, shape: &[u64]) -> Self {
        Self::EmptyTensor { op: op.to_string(), tensor: tensor.to_string(), shape: shape.to_vec() }
    }

    pub fn dtype(op: &str, tensor: &str, dtype: DType) -> Self {
        Self::UnsupportedDtype { op: op.to_string(), tensor: tensor.to_string(), dtype }
    }

    pub fn attribute(op: &str, name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidAttribute { op: op.to_string(), name: name.to_string(), reason: reason.into() }
    }

    pub fn missing(op: &str, tensor: &str) -> Self {
        Self::MissingInput { op: op.to_string(), tensor: tensor.to_string() }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, TilingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_operator() {
        let err = TilingError::shape_mismatch("relu", "output [2, 3] vs broadcast [2, 4]");
        assert_eq!(err.to_string(), "relu: shape mismatch: output [2, 3] vs broadcast [2, 4]");

        let err = TilingError::empty("gelu_quant", "x", &[0, 16]);
        assert!(err.to_string().contains("[0, 16]"));
    }

    #[test]
    fn soc_key_message() {
        let err = TilingError::UnsupportedSocForKey { key: 101, soc: SocTag::Ascend310P };
        assert_eq!(err.to_string(), "tiling key 101 has no kernel variant on Ascend310P");
    }
}

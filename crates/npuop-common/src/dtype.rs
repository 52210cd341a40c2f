//! Element data types understood by the tiling engine.
//!
//! Numeric codes follow the graph runtime's `DataType` enumeration so that
//! integer-valued attributes such as `dst_type` can be decoded directly.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Element type of a tensor operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum DType {
    Float32,
    Float16,
    BFloat16,
    Float64,
    Int8,
    UInt8,
    Int16,
    Int32,
    Int64,
    Bool,
    HiFloat8,
    Float8E5M2,
    Float8E4M3Fn,
}

impl DType {
    /// Every dtype, in runtime-code order.
    pub const ALL: [DType; 13] = [
        Self::Float32,
        Self::Float16,
        Self::Int8,
        Self::Int32,
        Self::UInt8,
        Self::Int16,
        Self::Int64,
        Self::Float64,
        Self::Bool,
        Self::BFloat16,
        Self::HiFloat8,
        Self::Float8E5M2,
        Self::Float8E4M3Fn,
    ];

    /// Width of one element in bytes.
    pub const fn size_bytes(self) -> u64 {
        match self {
            Self::Int8 | Self::UInt8 | Self::Bool => 1,
            Self::HiFloat8 | Self::Float8E5M2 | Self::Float8E4M3Fn => 1,
            Self::Float16 | Self::BFloat16 | Self::Int16 => 2,
            Self::Float32 | Self::Int32 => 4,
            Self::Float64 | Self::Int64 => 8,
        }
    }

    /// Numeric code used by the graph runtime.
    pub const fn code(self) -> i64 {
        match self {
            Self::Float32 => 0,
            Self::Float16 => 1,
            Self::Int8 => 2,
            Self::Int32 => 3,
            Self::UInt8 => 4,
            Self::Int16 => 6,
            Self::Int64 => 9,
            Self::Float64 => 11,
            Self::Bool => 12,
            Self::BFloat16 => 27,
            Self::HiFloat8 => 34,
            Self::Float8E5M2 => 35,
            Self::Float8E4M3Fn => 36,
        }
    }

    /// Inverse of [`DType::code`].
    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.iter().copied().find(|d| d.code() == code)
    }

    pub const fn is_float(self) -> bool {
        matches!(
            self,
            Self::Float32
                | Self::Float16
                | Self::BFloat16
                | Self::Float64
                | Self::HiFloat8
                | Self::Float8E5M2
                | Self::Float8E4M3Fn
        )
    }

    /// Short lowercase name, e.g. `bf16`.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Float32 => "fp32",
            Self::Float16 => "fp16",
            Self::BFloat16 => "bf16",
            Self::Float64 => "fp64",
            Self::Int8 => "int8",
            Self::UInt8 => "uint8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Bool => "bool",
            Self::HiFloat8 => "hifloat8",
            Self::Float8E5M2 => "fp8_e5m2",
            Self::Float8E4M3Fn => "fp8_e4m3fn",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.to_ascii_lowercase();
        let found = match lowered.as_str() {
            "float" | "float32" => Some(Self::Float32),
            "half" | "float16" => Some(Self::Float16),
            "bfloat16" => Some(Self::BFloat16),
            "double" | "float64" => Some(Self::Float64),
            other => Self::ALL.iter().copied().find(|d| d.name() == other),
        };
        found.ok_or_else(|| format!("unknown dtype: {s}"))
    }
}

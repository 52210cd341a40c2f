//! Tiling keys: the explicit tagged form used by host and device code, and
//! the versioned codec to the integer carried on the wire.
//!
//! Wire layout, codec version 1:
//!
//! | family       | wire value                                              |
//! |--------------|---------------------------------------------------------|
//! | GLU gradient | `base * 100 + regime` (base: tanh bf16/fp16/fp32 = 1/2/3, erf = 7/8/9; regime: aligned 1, big 2, small 3) |
//! | GeLU quant   | `1000 + 10 * template + input pair`                     |
//! | elementwise  | `100 + 10 * layout + dtype ordinal` (uniform kernels use ordinal 1) |
//! | scatter add  | `0` for empty input, else `20000 + 1000 * sorted + 100 * template + 10 * wide_addr + scalar_updates` |
//!
//! Integer arithmetic on wire values happens only inside [`KeyCodec`].

use serde::Serialize;
use std::fmt;

use npuop_common::{DType, Layout, Result, TilingError};

use crate::planner::SizeRegime;

/// Floating-point class of a GLU gradient kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DtypeClass {
    Bf16,
    Fp16,
    Fp32,
}

impl DtypeClass {
    pub const ALL: [DtypeClass; 3] = [Self::Bf16, Self::Fp16, Self::Fp32];

    pub fn of(dtype: DType) -> Option<Self> {
        match dtype {
            DType::BFloat16 => Some(Self::Bf16),
            DType::Float16 => Some(Self::Fp16),
            DType::Float32 => Some(Self::Fp32),
            _ => None,
        }
    }

    pub fn dtype(self) -> DType {
        match self {
            Self::Bf16 => DType::BFloat16,
            Self::Fp16 => DType::Float16,
            Self::Fp32 => DType::Float32,
        }
    }
}

/// GELU approximation selected by the `approximate` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Approximation {
    Erf,
    Tanh,
}

impl Approximation {
    pub const ALL: [Approximation; 2] = [Self::Tanh, Self::Erf];
}

impl fmt::Display for Approximation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Erf => write!(f, "erf"),
            Self::Tanh => write!(f, "tanh"),
        }
    }
}

/// GeluQuant kernel template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum QuantTemplate {
    StaticPerTensor,
    StaticFunction,
    StaticPerformance,
    DynamicNormal,
    DynamicWorkspace,
}

impl QuantTemplate {
    pub const ALL: [QuantTemplate; 5] = [
        Self::StaticPerTensor,
        Self::StaticFunction,
        Self::StaticPerformance,
        Self::DynamicNormal,
        Self::DynamicWorkspace,
    ];
}

/// Input/scale dtype pairing of a GeluQuant kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum QuantInputs {
    HalfHalf,
    Bf16Bf16,
    FloatFloat,
    HalfFloat,
    Bf16Float,
}

impl QuantInputs {
    pub const ALL: [QuantInputs; 5] =
        [Self::HalfHalf, Self::Bf16Bf16, Self::FloatFloat, Self::HalfFloat, Self::Bf16Float];

    /// Pairing for input `x` with an optional scale dtype.
    pub fn select(x: DType, scale: Option<DType>) -> Self {
        match (scale, x) {
            (Some(DType::Float16), _) => Self::HalfHalf,
            (Some(DType::BFloat16), _) => Self::Bf16Bf16,
            (_, DType::Float16) => Self::HalfFloat,
            (_, DType::BFloat16) => Self::Bf16Float,
            _ => Self::FloatFloat,
        }
    }
}

/// Which elementwise schedule runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ElementwiseVariant {
    /// One compiled kernel per dtype.
    PerDtype(DType),
    /// A single schedule shared by every dtype.
    Uniform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ScatterTemplate {
    Simt,
    Simd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ScatterKey {
    /// Nothing to scatter.
    Empty,
    Active { sorted: bool, template: ScatterTemplate, wide_addr: bool, scalar_updates: bool },
}

/// Explicit tiling key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TilingKey {
    GluGrad { dtype: DtypeClass, approx: Approximation, regime: SizeRegime },
    GeluQuant { template: QuantTemplate, inputs: QuantInputs },
    Elementwise { variant: ElementwiseVariant, layout: Layout },
    ScatterAdd(ScatterKey),
}

/// Wire value families. A wire integer is only meaningful together with the
/// family of the kernel entry point that reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum KeySpace {
    GluGrad,
    GeluQuant,
    ElementwisePerDtype,
    ElementwiseUniform,
    ScatterAdd,
}

impl TilingKey {
    pub fn space(&self) -> KeySpace {
        match self {
            Self::GluGrad { .. } => KeySpace::GluGrad,
            Self::GeluQuant { .. } => KeySpace::GeluQuant,
            Self::Elementwise { variant: ElementwiseVariant::PerDtype(_), .. } => {
                KeySpace::ElementwisePerDtype
            }
            Self::Elementwise { variant: ElementwiseVariant::Uniform, .. } => {
                KeySpace::ElementwiseUniform
            }
            Self::ScatterAdd(_) => KeySpace::ScatterAdd,
        }
    }

    /// Encode with the current codec.
    pub fn to_wire(&self) -> Result<u64> {
        KeyCodec::CURRENT.encode(self)
    }

    /// Decode with the current codec.
    pub fn from_wire(space: KeySpace, wire: u64) -> Result<Self> {
        KeyCodec::CURRENT.decode(space, wire)
    }
}

impl fmt::Display for TilingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GluGrad { dtype, approx, regime } => {
                write!(f, "glu_grad {} {approx} {regime}", dtype.dtype())
            }
            Self::GeluQuant { template, inputs } => write!(f, "gelu_quant {template:?} {inputs:?}"),
            Self::Elementwise { variant: ElementwiseVariant::PerDtype(d), layout } => {
                write!(f, "elementwise {d} {layout}")
            }
            Self::Elementwise { variant: ElementwiseVariant::Uniform, layout } => {
                write!(f, "elementwise uniform {layout}")
            }
            Self::ScatterAdd(ScatterKey::Empty) => write!(f, "scatter_add empty"),
            Self::ScatterAdd(ScatterKey::Active { sorted, template, wide_addr, scalar_updates }) => {
                write!(
                    f,
                    "scatter_add {template:?} sorted={sorted} wide_addr={wide_addr} scalar={scalar_updates}"
                )
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Versioned mapping between [`TilingKey`] and its wire integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyCodec {
    V1,
}

const GLU_BASES: [(DtypeClass, Approximation, u64); 6] = [
    (DtypeClass::Bf16, Approximation::Tanh, 1),
    (DtypeClass::Fp16, Approximation::Tanh, 2),
    (DtypeClass::Fp32, Approximation::Tanh, 3),
    (DtypeClass::Bf16, Approximation::Erf, 7),
    (DtypeClass::Fp16, Approximation::Erf, 8),
    (DtypeClass::Fp32, Approximation::Erf, 9),
];

const GLU_REGIMES: [(SizeRegime, u64); 3] = [
    (SizeRegime::Aligned, 1),
    (SizeRegime::AlignedLastAxisBig, 2),
    (SizeRegime::Small, 3),
];

const ELEMENTWISE_ORDINALS: [(DType, u64); 6] = [
    (DType::Float16, 1),
    (DType::BFloat16, 2),
    (DType::Float32, 3),
    (DType::Int8, 4),
    (DType::Int32, 5),
    (DType::Int64, 6),
];

const LAYOUTS: [Layout; 2] = [Layout::Nd, Layout::Nz];

const SCATTER_ACTIVE_BASE: u64 = 20_000;

fn flag(b: bool) -> u64 {
    u64::from(b)
}

fn ordinal_of<T: PartialEq + Copy>(table: &[(T, u64)], value: T) -> Option<u64> {
    table.iter().find(|(v, _)| *v == value).map(|(_, n)| *n)
}

fn value_of<T: Copy>(table: &[(T, u64)], ordinal: u64) -> Option<T> {
    table.iter().find(|(_, n)| *n == ordinal).map(|(v, _)| *v)
}

fn position<T: PartialEq>(all: &[T], value: &T) -> u64 {
    all.iter().position(|v| v == value).unwrap_or(0) as u64
}

impl KeyCodec {
    pub const CURRENT: KeyCodec = KeyCodec::V1;

    pub fn encode(self, key: &TilingKey) -> Result<u64> {
        match (self, key) {
            (KeyCodec::V1, TilingKey::GluGrad { dtype, approx, regime }) => {
                let base = GLU_BASES
                    .iter()
                    .find(|(d, a, _)| d == dtype && a == approx)
                    .map(|(_, _, b)| *b)
                    .ok_or_else(|| invalid(key))?;
                let regime = ordinal_of(&GLU_REGIMES, *regime).ok_or_else(|| invalid(key))?;
                Ok(base * 100 + regime)
            }
            (KeyCodec::V1, TilingKey::GeluQuant { template, inputs }) => {
                Ok(1000 + 10 * position(&QuantTemplate::ALL, template) + position(&QuantInputs::ALL, inputs) + 1)
            }
            (KeyCodec::V1, TilingKey::Elementwise { variant, layout }) => {
                let ordinal = match variant {
                    ElementwiseVariant::PerDtype(d) => {
                        ordinal_of(&ELEMENTWISE_ORDINALS, *d).ok_or_else(|| invalid(key))?
                    }
                    ElementwiseVariant::Uniform => 1,
                };
                Ok(100 + 10 * position(&LAYOUTS, layout) + ordinal)
            }
            (KeyCodec::V1, TilingKey::ScatterAdd(ScatterKey::Empty)) => Ok(0),
            (
                KeyCodec::V1,
                TilingKey::ScatterAdd(ScatterKey::Active { sorted, template, wide_addr, scalar_updates }),
            ) => {
                let template = match template {
                    ScatterTemplate::Simt => 0,
                    ScatterTemplate::Simd => 1,
                };
                Ok(SCATTER_ACTIVE_BASE
                    + 1000 * flag(*sorted)
                    + 100 * template
                    + 10 * flag(*wide_addr)
                    + flag(*scalar_updates))
            }
        }
    }

    pub fn decode(self, space: KeySpace, wire: u64) -> Result<TilingKey> {
        let bad = || TilingError::Schema(format!("wire key {wire} is not a valid {space:?} key"));
        match (self, space) {
            (KeyCodec::V1, KeySpace::GluGrad) => {
                let (dtype, approx) = GLU_BASES
                    .iter()
                    .find(|(_, _, b)| *b == wire / 100)
                    .map(|(d, a, _)| (*d, *a))
                    .ok_or_else(bad)?;
                let regime = value_of(&GLU_REGIMES, wire % 100).ok_or_else(bad)?;
                Ok(TilingKey::GluGrad { dtype, approx, regime })
            }
            (KeyCodec::V1, KeySpace::GeluQuant) => {
                if !(1000..1100).contains(&wire) {
                    return Err(bad());
                }
                let template = QuantTemplate::ALL
                    .get(usize::try_from((wire - 1000) / 10).map_err(|_| bad())?)
                    .copied()
                    .ok_or_else(bad)?;
                let pair = wire % 10;
                let inputs = match pair {
                    1..=5 => QuantInputs::ALL[(pair - 1) as usize],
                    _ => return Err(bad()),
                };
                Ok(TilingKey::GeluQuant { template, inputs })
            }
            (KeyCodec::V1, KeySpace::ElementwisePerDtype | KeySpace::ElementwiseUniform) => {
                if !(100..100 + 10 * LAYOUTS.len() as u64).contains(&wire) {
                    return Err(bad());
                }
                let layout = LAYOUTS[((wire - 100) / 10) as usize];
                let ordinal = wire % 10;
                let variant = if space == KeySpace::ElementwiseUniform {
                    if ordinal != 1 {
                        return Err(bad());
                    }
                    ElementwiseVariant::Uniform
                } else {
                    ElementwiseVariant::PerDtype(value_of(&ELEMENTWISE_ORDINALS, ordinal).ok_or_else(bad)?)
                };
                Ok(TilingKey::Elementwise { variant, layout })
            }
            (KeyCodec::V1, KeySpace::ScatterAdd) => {
                if wire == 0 {
                    return Ok(TilingKey::ScatterAdd(ScatterKey::Empty));
                }
                if !(SCATTER_ACTIVE_BASE..SCATTER_ACTIVE_BASE + 2000).contains(&wire) {
                    return Err(bad());
                }
                let digits = wire - SCATTER_ACTIVE_BASE;
                let digit = |d: u64| -> Result<bool> {
                    match d {
                        0 => Ok(false),
                        1 => Ok(true),
                        _ => Err(bad()),
                    }
                };
                let sorted = digit(digits / 1000)?;
                let template = if digit((digits / 100) % 10)? { ScatterTemplate::Simd } else { ScatterTemplate::Simt };
                let wide_addr = digit((digits / 10) % 10)?;
                let scalar_updates = digit(digits % 10)?;
                Ok(TilingKey::ScatterAdd(ScatterKey::Active { sorted, template, wide_addr, scalar_updates }))
            }
        }
    }
}

fn invalid(key: &TilingKey) -> TilingError {
    TilingError::Schema(format!("tiling key `{key}` has no wire encoding"))
}

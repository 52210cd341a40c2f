//! Tiling-key dispatch: an explicit table from [`TilingKey`] to kernel
//! variant per operator.
//!
//! A wire key is decoded in the operator's key space and looked up. A key
//! that decodes but has no entry is a [`DispatchError::KeyNotFound`]; the
//! dispatcher never falls through to a default variant.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use npuop_common::{DType, Layout, TilingError};
use npuop_tiling::blob::BlobReader;
use npuop_tiling::ops::elementwise::{FLOAT_DTYPES, RELU_DTYPES};
use npuop_tiling::{
    Approximation, DtypeClass, ElementwiseVariant, KeySpace, OperatorRegistry, PlanHeader, QuantInputs, QuantTemplate,
    ScatterKey, ScatterTemplate, SizeRegime, TilingKey,
};

use crate::chunk::ChunkKernel;
use crate::error::{DispatchError, Result};
use crate::gm::DeviceIo;
use crate::variants;

/// What a variant builder sees: the decoded key, the common header, the
/// blob reader positioned at the family's own fields, and the operands.
pub struct KernelArgs<'b, 'r> {
    pub key: TilingKey,
    pub header: &'r PlanHeader,
    pub params: &'r mut BlobReader<'b>,
    pub io: &'r DeviceIo,
}

/// Builds the kernel for one registered key.
pub type VariantFn = Arc<dyn Fn(KernelArgs<'_, '_>) -> Result<Box<dyn ChunkKernel>> + Send + Sync>;

// ---------------------------------------------------------------------------
// Per-operator table
// ---------------------------------------------------------------------------

/// Key table of one operator.
#[derive(Clone)]
pub struct KernelDispatcher {
    op: String,
    space: KeySpace,
    table: HashMap<TilingKey, VariantFn>,
}

impl fmt::Debug for KernelDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelDispatcher")
            .field("op", &self.op)
            .field("space", &self.space)
            .field("variants", &self.table.len())
            .finish()
    }
}

impl KernelDispatcher {
    pub fn new(op: impl Into<String>, space: KeySpace) -> Self {
        Self { op: op.into(), space, table: HashMap::new() }
    }

    pub fn op(&self) -> &str {
        &self.op
    }

    pub fn space(&self) -> KeySpace {
        self.space
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn contains(&self, key: &TilingKey) -> bool {
        self.table.contains_key(key)
    }

    /// Register `variant` for `key`, replacing any earlier entry. The key
    /// must belong to this operator's key space.
    pub fn register<F>(&mut self, key: TilingKey, variant: F) -> Result<()>
    where
        F: Fn(KernelArgs<'_, '_>) -> Result<Box<dyn ChunkKernel>> + Send + Sync + 'static,
    {
        if key.space() != self.space {
            return Err(DispatchError::Registration {
                op: self.op.clone(),
                reason: format!("key `{key}` is in {:?}, table is {:?}", key.space(), self.space),
            });
        }
        self.table.insert(key, Arc::new(variant));
        Ok(())
    }

    /// Register a contiguous float kernel that applies `f` to each element.
    pub fn register_map<F>(&mut self, key: TilingKey, name: &'static str, f: F) -> Result<()>
    where
        F: Fn(f32) -> f32 + Send + Sync + 'static,
    {
        let f: variants::ElementFn = Arc::new(f);
        self.register(key, move |args: KernelArgs<'_, '_>| variants::map_variant(name, f.clone(), args))
    }

    /// Decode `wire` and find its variant.
    pub fn resolve(&self, wire: u64) -> Result<(TilingKey, VariantFn)> {
        let key = TilingKey::from_wire(self.space, wire)?;
        let variant = self
            .table
            .get(&key)
            .cloned()
            .ok_or_else(|| DispatchError::KeyNotFound { op: self.op.clone(), key })?;
        debug!(op = %self.op, wire, %key, "kernel variant resolved");
        Ok((key, variant))
    }
}

// ---------------------------------------------------------------------------
// Library
// ---------------------------------------------------------------------------

/// Dispatch tables of every operator that has device code.
#[derive(Debug, Default, Clone)]
pub struct KernelLibrary {
    ops: HashMap<String, KernelDispatcher>,
}

const GLU_REGIMES: [SizeRegime; 3] = [SizeRegime::Aligned, SizeRegime::AlignedLastAxisBig, SizeRegime::Small];

impl KernelLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tables for every built-in tiling operator, with a reference variant
    /// behind every key the host planner can emit.
    pub fn builtin() -> Result<Self> {
        let tiling = OperatorRegistry::with_builtin();
        let mut library = Self::new();
        for name in tiling.names() {
            let space = tiling.key_space(name).ok_or_else(|| TilingError::UnknownOperator(name.to_string()))?;
            library.insert(KernelDispatcher::new(name, space));
        }

        let nd = |dtype: DType| TilingKey::Elementwise { variant: ElementwiseVariant::PerDtype(dtype), layout: Layout::Nd };
        let relu = library.dispatcher_mut("relu")?;
        for dtype in RELU_DTYPES {
            relu.register(nd(dtype), variants::relu_variant)?;
        }

        library.dispatcher_mut("elu")?.register(
            TilingKey::Elementwise { variant: ElementwiseVariant::Uniform, layout: Layout::Nd },
            variants::elu_variant,
        )?;

        let gelu_grad = library.dispatcher_mut("gelu_grad")?;
        for dtype in FLOAT_DTYPES {
            gelu_grad.register(nd(dtype), variants::gelu_grad_variant)?;
        }

        let glu = library.dispatcher_mut("ge_glu_grad_v2")?;
        for dtype in DtypeClass::ALL {
            for approx in Approximation::ALL {
                for regime in GLU_REGIMES {
                    glu.register(TilingKey::GluGrad { dtype, approx, regime }, variants::geglu_grad_variant)?;
                }
            }
        }

        let quant = library.dispatcher_mut("gelu_quant")?;
        for template in QuantTemplate::ALL {
            for inputs in QuantInputs::ALL {
                quant.register(TilingKey::GeluQuant { template, inputs }, variants::gelu_quant_variant)?;
            }
        }

        let scatter = library.dispatcher_mut("scatter_add")?;
        scatter.register(TilingKey::ScatterAdd(ScatterKey::Empty), variants::scatter_add_variant)?;
        for sorted in [false, true] {
            for template in [ScatterTemplate::Simt, ScatterTemplate::Simd] {
                for wide_addr in [false, true] {
                    for scalar_updates in [false, true] {
                        let key = ScatterKey::Active { sorted, template, wide_addr, scalar_updates };
                        scatter.register(TilingKey::ScatterAdd(key), variants::scatter_add_variant)?;
                    }
                }
            }
        }

        info!(
            operators = library.ops.len(),
            variants = library.ops.values().map(KernelDispatcher::len).sum::<usize>(),
            "kernel library built"
        );
        Ok(library)
    }

    /// Add or replace the table for `dispatcher.op()`.
    pub fn insert(&mut self, dispatcher: KernelDispatcher) {
        self.ops.insert(dispatcher.op.clone(), dispatcher);
    }

    pub fn get(&self, op: &str) -> Option<&KernelDispatcher> {
        self.ops.get(op)
    }

    pub fn dispatcher(&self, op: &str) -> Result<&KernelDispatcher> {
        self.get(op).ok_or_else(|| TilingError::UnknownOperator(op.to_string()).into())
    }

    pub fn dispatcher_mut(&mut self, op: &str) -> Result<&mut KernelDispatcher> {
        self.ops.get_mut(op).ok_or_else(|| TilingError::UnknownOperator(op.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_tables() {
        let lib = KernelLibrary::builtin().unwrap();
        assert_eq!(lib.dispatcher("relu").unwrap().len(), 6);
        assert_eq!(lib.dispatcher("elu").unwrap().len(), 1);
        assert_eq!(lib.dispatcher("gelu_grad").unwrap().len(), 3);
        assert_eq!(lib.dispatcher("ge_glu_grad_v2").unwrap().len(), 18);
        assert_eq!(lib.dispatcher("gelu_quant").unwrap().len(), 25);
        assert_eq!(lib.dispatcher("scatter_add").unwrap().len(), 17);
    }

    #[test]
    fn resolve_decodes_in_the_op_space() {
        let lib = KernelLibrary::builtin().unwrap();
        let (key, _) = lib.dispatcher("ge_glu_grad_v2").unwrap().resolve(702).unwrap();
        assert_eq!(
            key,
            TilingKey::GluGrad { dtype: DtypeClass::Bf16, approx: Approximation::Erf, regime: SizeRegime::AlignedLastAxisBig }
        );
        // 101 means fp16 in the per-dtype space and the uniform schedule for elu.
        assert!(lib.dispatcher("relu").unwrap().resolve(101).is_ok());
        assert!(lib.dispatcher("elu").unwrap().resolve(101).is_ok());
    }

    #[test]
    fn quant_and_scatter_keys_resolve() {
        let lib = KernelLibrary::builtin().unwrap();
        let (key, _) = lib.dispatcher("gelu_quant").unwrap().resolve(1033).unwrap();
        assert_eq!(key, TilingKey::GeluQuant { template: QuantTemplate::DynamicNormal, inputs: QuantInputs::FloatFloat });
        let (key, _) = lib.dispatcher("scatter_add").unwrap().resolve(20100).unwrap();
        assert!(matches!(key, TilingKey::ScatterAdd(ScatterKey::Active { template: ScatterTemplate::Simd, .. })));
        assert!(lib.dispatcher("scatter_add").unwrap().resolve(0).is_ok());
    }

    #[test]
    fn decodable_keys_without_a_variant() {
        let empty = KernelDispatcher::new("gelu_quant", KeySpace::GeluQuant);
        let Err(err) = empty.resolve(1033) else {
            panic!("an empty table resolved key 1033");
        };
        assert_eq!(
            err,
            DispatchError::KeyNotFound {
                op: "gelu_quant".into(),
                key: TilingKey::GeluQuant { template: QuantTemplate::DynamicNormal, inputs: QuantInputs::FloatFloat },
            }
        );
        let empty = KernelDispatcher::new("scatter_add", KeySpace::ScatterAdd);
        assert!(matches!(
            empty.resolve(20100),
            Err(DispatchError::KeyNotFound {
                key: TilingKey::ScatterAdd(ScatterKey::Active { template: ScatterTemplate::Simd, .. }),
                ..
            })
        ));
    }

    #[test]
    fn undecodable_wire_is_a_tiling_error() {
        let lib = KernelLibrary::builtin().unwrap();
        assert!(matches!(lib.dispatcher("relu").unwrap().resolve(7), Err(DispatchError::Tiling(_))));
    }

    #[test]
    fn registration_checks_the_key_space() {
        let mut d = KernelDispatcher::new("relu", KeySpace::ElementwisePerDtype);
        let err = d.register(TilingKey::ScatterAdd(ScatterKey::Empty), variants::relu_variant).unwrap_err();
        assert!(matches!(err, DispatchError::Registration { .. }));
        assert!(d.is_empty());
    }

    #[test]
    fn unknown_operator() {
        let lib = KernelLibrary::builtin().unwrap();
        assert!(matches!(lib.dispatcher("softmax"), Err(DispatchError::Tiling(TilingError::UnknownOperator(_)))));
    }
}

//! Host tiling driver: the per-call context, the tiling output and the
//! operator registry that maps an operator name to its tiling function.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use npuop_common::{
    AttrMap, AttrValue, HardwareProfile, PlatformConfig, Result, TensorShapeView, TilingError,
    DEFAULT_SYSTEM_WORKSPACE_BYTES,
};

use crate::blob::{BlobSchema, TilingBlob};
use crate::key::{KeySpace, TilingKey};
use crate::ops::{self, OperatorTiling};
use crate::planner::TilingPlan;

/// Largest tiling blob the runtime hands to a kernel by default.
pub const DEFAULT_BLOB_CAPACITY: usize = 8 * 1024;

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Everything a tiling function may look at. Optional operands are `None`.
#[derive(Debug, Clone)]
pub struct TilingContext {
    pub inputs: Vec<Option<TensorShapeView>>,
    pub outputs: Vec<Option<TensorShapeView>>,
    pub attrs: AttrMap,
    pub hardware: HardwareProfile,
    pub system_workspace_bytes: u64,
    pub blob_capacity: usize,
    pub deterministic: bool,
}

impl TilingContext {
    pub fn new(hardware: HardwareProfile) -> Self {
        Self {
            inputs: Vec::new(),
            outputs: Vec::new(),
            attrs: AttrMap::new(),
            hardware,
            system_workspace_bytes: DEFAULT_SYSTEM_WORKSPACE_BYTES,
            blob_capacity: DEFAULT_BLOB_CAPACITY,
            deterministic: false,
        }
    }

    /// Context carrying the platform settings of a loaded config.
    pub fn from_config(config: &PlatformConfig) -> Self {
        let mut ctx = Self::new(config.hardware_profile());
        ctx.system_workspace_bytes = config.system_workspace_bytes;
        ctx.deterministic = config.deterministic;
        ctx
    }

    #[must_use]
    pub fn with_input(mut self, t: TensorShapeView) -> Self {
        self.inputs.push(Some(t));
        self
    }

    #[must_use]
    pub fn with_optional_input(mut self, t: Option<TensorShapeView>) -> Self {
        self.inputs.push(t);
        self
    }

    #[must_use]
    pub fn with_output(mut self, t: TensorShapeView) -> Self {
        self.outputs.push(Some(t));
        self
    }

    #[must_use]
    pub fn with_attr(mut self, name: &str, value: impl Into<AttrValue>) -> Self {
        self.attrs.insert(name, value);
        self
    }

    #[must_use]
    pub fn with_attrs(mut self, attrs: AttrMap) -> Self {
        self.attrs = attrs;
        self
    }

    #[must_use]
    pub fn with_blob_capacity(mut self, bytes: usize) -> Self {
        self.blob_capacity = bytes;
        self
    }

    #[must_use]
    pub fn with_system_workspace(mut self, bytes: u64) -> Self {
        self.system_workspace_bytes = bytes;
        self
    }

    #[must_use]
    pub fn with_deterministic(mut self, deterministic: bool) -> Self {
        self.deterministic = deterministic;
        self
    }

    pub fn optional_input(&self, index: usize) -> Option<&TensorShapeView> {
        self.inputs.get(index).and_then(Option::as_ref)
    }

    pub fn input(&self, op: &str, index: usize, name: &str) -> Result<&TensorShapeView> {
        self.optional_input(index).ok_or_else(|| TilingError::missing(op, name))
    }

    pub fn optional_output(&self, index: usize) -> Option<&TensorShapeView> {
        self.outputs.get(index).and_then(Option::as_ref)
    }

    pub fn output(&self, op: &str, index: usize, name: &str) -> Result<&TensorShapeView> {
        self.optional_output(index).ok_or_else(|| TilingError::missing(op, name))
    }

    /// Reject any operand whose byte size does not fit the device address space.
    pub fn check_sizes(&self, op: &str) -> Result<()> {
        let inputs = self.inputs.iter().enumerate().map(|(i, t)| (format!("input {i}"), t));
        let outputs = self.outputs.iter().enumerate().map(|(i, t)| (format!("output {i}"), t));
        for (name, t) in inputs.chain(outputs) {
            if let Some(t) = t {
                t.check_size(op, &name)?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Result of one tiling call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilingOutput {
    pub blob: TilingBlob,
    pub workspace_sizes: Vec<u64>,
    pub tiling_key: TilingKey,
    pub wire_key: u64,
    pub block_dim: u64,
    pub plan: TilingPlan,
}

#[derive(Serialize)]
struct OutputSummary<'a> {
    schema: &'a str,
    schema_version: u32,
    tiling_key: u64,
    key: String,
    block_dim: u64,
    workspace_sizes: &'a [u64],
    blob_len: usize,
    blob: String,
    plan: &'a TilingPlan,
}

impl TilingOutput {
    pub fn schema(&self) -> &'static BlobSchema {
        self.blob.schema()
    }

    /// JSON rendering for logs and tooling.
    pub fn to_json(&self) -> Result<String> {
        let summary = OutputSummary {
            schema: self.blob.schema().name,
            schema_version: self.blob.schema().version,
            tiling_key: self.wire_key,
            key: self.tiling_key.to_string(),
            block_dim: self.block_dim,
            workspace_sizes: &self.workspace_sizes,
            blob_len: self.blob.len(),
            blob: self.blob.to_hex(),
            plan: &self.plan,
        };
        serde_json::to_string_pretty(&summary).map_err(|e| TilingError::Schema(e.to_string()))
    }
}

impl fmt::Display for TilingOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let schema = self.blob.schema();
        writeln!(f, "schema: {} v{} ({} bytes)", schema.name, schema.version, self.blob.len())?;
        writeln!(f, "block_dim: {}", self.block_dim)?;
        writeln!(f, "workspace_sizes: {:?}", self.workspace_sizes)?;
        write!(f, "{}", self.plan)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Operator name to tiling function.
#[derive(Clone, Default)]
pub struct OperatorRegistry {
    ops: HashMap<&'static str, Arc<dyn OperatorTiling>>,
}

impl fmt::Debug for OperatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorRegistry").field("ops", &self.names()).finish()
    }
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in operator family.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for op in ops::builtin() {
            registry.register(op);
        }
        info!(operators = registry.len(), "tiling registry built");
        registry
    }

    /// Register `op`, replacing any earlier entry of the same name.
    pub fn register(&mut self, op: Arc<dyn OperatorTiling>) {
        self.ops.insert(op.name(), op);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn OperatorTiling>> {
        self.ops.get(name)
    }

    pub fn key_space(&self, name: &str) -> Option<KeySpace> {
        self.get(name).map(|op| op.key_space())
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.ops.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Run the tiling function of `op`.
    pub fn tile(&self, op: &str, ctx: &TilingContext) -> Result<TilingOutput> {
        let tiling = self.get(op).ok_or_else(|| TilingError::UnknownOperator(op.to_string()))?;
        ctx.hardware.check()?;
        ctx.check_sizes(op)?;
        let output = tiling.tile(ctx)?;
        if output.blob.len() > ctx.blob_capacity {
            return Err(TilingError::Schema(format!(
                "{op}: tiling blob of {} bytes exceeds the {}-byte capacity",
                output.blob.len(),
                ctx.blob_capacity
            )));
        }
        debug!(
            op,
            tiling_key = output.wire_key,
            block_dim = output.block_dim,
            blob_len = output.blob.len(),
            "tiling done"
        );
        Ok(output)
    }
}

/// Tile `op` with the built-in registry.
pub fn tile(op: &str, ctx: &TilingContext) -> Result<TilingOutput> {
    builtin_registry().tile(op, ctx)
}

fn builtin_registry() -> &'static OperatorRegistry {
    static REGISTRY: std::sync::OnceLock<OperatorRegistry> = std::sync::OnceLock::new();
    REGISTRY.get_or_init(OperatorRegistry::with_builtin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use npuop_common::{DType, SocTag};

    #[test]
    fn builtin_names() {
        let registry = OperatorRegistry::with_builtin();
        assert_eq!(registry.names(), vec!["elu", "ge_glu_grad_v2", "gelu_grad", "gelu_quant", "relu", "scatter_add"]);
        assert_eq!(registry.key_space("elu"), Some(KeySpace::ElementwiseUniform));
        assert_eq!(registry.key_space("relu"), Some(KeySpace::ElementwisePerDtype));
    }

    #[test]
    fn unknown_operator() {
        let ctx = TilingContext::new(HardwareProfile::default());
        assert_eq!(tile("softmax", &ctx).unwrap_err(), TilingError::UnknownOperator("softmax".into()));
    }

    #[test]
    fn blob_capacity_is_enforced() {
        let x = TensorShapeView::new(vec![1024], DType::Float32);
        let ctx = TilingContext::new(HardwareProfile::new(SocTag::Ascend910B, 48, 196_608))
            .with_input(x.clone())
            .with_output(x)
            .with_blob_capacity(16);
        let err = tile("relu", &ctx).unwrap_err();
        assert!(err.to_string().contains("exceeds the 16-byte capacity"));
    }

    #[test]
    fn oversized_operands_are_errors() {
        let x = TensorShapeView::new(vec![1 << 32, 1 << 32], DType::Float32);
        let ctx = TilingContext::new(HardwareProfile::default()).with_input(x.clone()).with_output(x);
        for op in ["relu", "elu", "ge_glu_grad_v2", "scatter_add"] {
            assert!(matches!(tile(op, &ctx), Err(TilingError::ShapeMismatch { .. })), "{op}");
        }
    }

    #[test]
    fn missing_operands() {
        let ctx = TilingContext::new(HardwareProfile::default());
        assert!(matches!(tile("relu", &ctx), Err(TilingError::MissingInput { .. })));
        assert!(ctx.optional_input(3).is_none());
    }

    #[test]
    fn context_from_config() {
        let config = PlatformConfig { deterministic: true, ..PlatformConfig::default() };
        let ctx = TilingContext::from_config(&config);
        assert!(ctx.deterministic);
        assert_eq!(ctx.system_workspace_bytes, DEFAULT_SYSTEM_WORKSPACE_BYTES);
    }
}

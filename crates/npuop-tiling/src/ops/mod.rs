//! Operator families: each turns a [`TilingContext`] into a [`TilingOutput`]
//! for one operator name.

use std::sync::Arc;

use npuop_common::Result;

use crate::blob::{write_plan_header, BlobSchema, BlobWriter};
use crate::key::KeySpace;
use crate::planner::TilingPlan;
use crate::registry::{TilingContext, TilingOutput};

pub mod elementwise;
pub mod geglu_grad;
pub mod gelu_quant;
pub mod scatter_add;

/// Host tiling function of one operator.
pub trait OperatorTiling: Send + Sync {
    /// Operator type name, e.g. `"relu"`.
    fn name(&self) -> &'static str;

    /// Family the emitted wire key belongs to.
    fn key_space(&self) -> KeySpace;

    /// Blob layout this operator writes.
    fn schema(&self) -> &'static BlobSchema;

    fn tile(&self, ctx: &TilingContext) -> Result<TilingOutput>;
}

/// Every operator shipped with the crate.
pub fn builtin() -> Vec<Arc<dyn OperatorTiling>> {
    vec![
        Arc::new(elementwise::Relu),
        Arc::new(elementwise::Elu),
        Arc::new(elementwise::GeluGrad),
        Arc::new(geglu_grad::GeGluGradV2),
        Arc::new(gelu_quant::GeluQuant),
        Arc::new(scatter_add::ScatterAdd),
    ]
}

/// Serialize `plan` against `schema`: common header, then the family's own
/// fields written by `write_ext`.
pub(crate) fn emit<F>(schema: &'static BlobSchema, plan: TilingPlan, write_ext: F) -> Result<TilingOutput>
where
    F: FnOnce(&mut BlobWriter) -> Result<()>,
{
    let mut w = BlobWriter::new(schema)?;
    write_plan_header(&mut w, &plan)?;
    write_ext(&mut w)?;
    let blob = w.finish()?;
    let wire_key = plan.tiling_key.to_wire()?;
    Ok(TilingOutput {
        blob,
        workspace_sizes: vec![plan.workspace_bytes],
        tiling_key: plan.tiling_key,
        wire_key,
        block_dim: plan.used_core_num(),
        plan,
    })
}

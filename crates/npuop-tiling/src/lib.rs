//! Host-side tiling for npuop kernels.
//!
//! A tiling call takes operand descriptors and the hardware profile
//! ([`TilingContext`]), validates them, decides how the work is cut into
//! chunks and spread over cores, picks the compiled kernel variant
//! ([`TilingKey`]) and serializes all of it into a [`TilingBlob`] the kernel
//! reads back field by field.
//!
//! ```no_run
//! use npuop_common::{DType, HardwareProfile, SocTag, TensorShapeView};
//! use npuop_tiling::{tile, TilingContext};
//!
//! let x = TensorShapeView::new(vec![4096], DType::Float16);
//! let ctx = TilingContext::new(HardwareProfile::new(SocTag::Ascend910B, 48, 196_608))
//!     .with_input(x.clone())
//!     .with_output(x);
//! let out = tile("relu", &ctx)?;
//! println!("{out}");
//! # Ok::<(), npuop_common::TilingError>(())
//! ```

pub mod analyzer;
pub mod blob;
pub mod key;
pub mod ops;
pub mod padding;
pub mod planner;
pub mod profile;
pub mod registry;
pub mod workspace;

pub use blob::{BlobReader, BlobSchema, BlobWriter, FieldDef, FieldWidth, PlanHeader, TilingBlob};
pub use key::{
    Approximation, DtypeClass, ElementwiseVariant, KeyCodec, KeySpace, QuantInputs, QuantTemplate,
    ScatterKey, ScatterTemplate, TilingKey,
};
pub use ops::OperatorTiling;
pub use padding::{copy_out_plan, CopyOut, PadSpec};
pub use planner::{
    ChunkDescriptor, CoreSplit, GridSplit, PlanGeometry, ProblemSize, SizeRegime, TilingPlan,
    TilingPlanner,
};
pub use profile::{DistributionPolicy, OperatorProfile};
pub use registry::{tile, OperatorRegistry, TilingContext, TilingOutput, DEFAULT_BLOB_CAPACITY};
pub use workspace::{workspace_bytes, WorkspaceLayout};

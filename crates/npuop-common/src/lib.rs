//! Shared types for the npuop tiling engine.
//!
//! Everything the host-side planner and the simulated device side agree on
//! lives here: element types, tensor descriptors, the hardware profile,
//! operator attributes, the error taxonomy, and platform configuration.

pub mod attrs;
pub mod config;
pub mod dtype;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod math;
pub mod shape;

pub use attrs::{AttrMap, AttrValue};
pub use config::{ConfigError, LogFormat, LoggingConfig, PlatformConfig, DEFAULT_SYSTEM_WORKSPACE_BYTES};
pub use dtype::DType;
pub use error::{Result, TilingError};
pub use hardware::{
    CompileInfo, HardwareProfile, PlatformQuery, SocCapabilities, SocTag, StaticPlatform,
    DEFAULT_ALIGN_BYTES,
};
pub use logging::init_logging;
pub use shape::{
    broadcast_shape, broadcast_shapes, checked_extent, checked_numel, normalize_axis, Layout, TensorShapeView,
    MAX_TENSOR_BYTES,
};

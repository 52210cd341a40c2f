//! Device side of npuop: tiling-key dispatch and a host simulation of the
//! multi-core chunk loop.
//!
//! A launch decodes the tiling blob written by `npuop-tiling`, resolves the
//! wire key against an explicit per-operator table, and runs every core's
//! chunks through a double-buffered copy-in / compute / copy-out pipeline
//! over simulated global memory.
//!
//! ```no_run
//! use npuop_common::{DType, HardwareProfile, SocTag};
//! use npuop_kernels::{launch_output, CoreOrder, DeviceIo, HostTensor, KernelLibrary};
//! use npuop_tiling::{tile, TilingContext};
//!
//! # fn main() -> anyhow::Result<()> {
//! let hw = HardwareProfile::new(SocTag::Ascend910B, 48, 196_608);
//! let x = HostTensor::from_f32(vec![1000], DType::Float32, &vec![-1.0; 1000])?;
//! let ctx = TilingContext::new(hw).with_input(x.view()).with_output(x.view());
//! let out = tile("relu", &ctx)?;
//!
//! let io = DeviceIo::with_inputs(&[&x], &[HostTensor::zeros(vec![1000], DType::Float32)], hw.align_bytes);
//! launch_output(&KernelLibrary::builtin()?, "relu", &out, &io, CoreOrder::Parallel)?;
//! let y = io.into_outputs().remove(0).to_f32()?;
//! assert!(y.iter().all(|&v| v == 0.0));
//! # Ok(())
//! # }
//! ```

pub mod activations;
pub mod chunk;
pub mod convert;
pub mod dispatcher;
pub mod error;
pub mod gm;
pub mod launch;
pub mod queue;
pub mod variants;

pub use chunk::{ChunkKernel, ChunkProcessor, CoreReport, OutputMap, Stage, StageEvent};
pub use dispatcher::{KernelArgs, KernelDispatcher, KernelLibrary, VariantFn};
pub use error::{DeviceFault, DispatchError, Result};
pub use gm::{DeviceIo, GmBuffer, HostTensor, Workspace, PAD_FILL};
pub use launch::{launch, launch_output, CoreOrder, LaunchReport};
pub use queue::TQueue;

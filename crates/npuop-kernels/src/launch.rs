//! Launch a tiled operator on the simulated device.
//!
//! The blob is parsed once on the host side of the launch: common header,
//! key resolution, then the variant builder consumes the family fields. Every
//! core in `0..max(block_dim, used_core_num)` then runs the chunk loop.
//! Cores share no state apart from their disjoint output ranges, so the
//! result must not depend on [`CoreOrder`].

use rayon::prelude::*;
use tracing::info;

use npuop_common::TilingError;
use npuop_tiling::{PlanHeader, TilingBlob, TilingKey, TilingOutput};

use crate::chunk::{ChunkProcessor, CoreReport};
use crate::dispatcher::{KernelArgs, KernelLibrary};
use crate::error::Result;
use crate::gm::{DeviceIo, Workspace};

/// Order in which simulated cores execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoreOrder {
    #[default]
    Forward,
    Reverse,
    /// Cores run concurrently on the rayon pool.
    Parallel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchReport {
    pub op: String,
    pub key: TilingKey,
    /// One report per launched core, in core order.
    pub cores: Vec<CoreReport>,
}

impl LaunchReport {
    pub fn active_cores(&self) -> usize {
        self.cores.iter().filter(|c| !c.idle).count()
    }

    pub fn merges(&self) -> u64 {
        self.cores.iter().map(|c| c.merges).sum()
    }
}

pub fn launch(
    library: &KernelLibrary,
    op: &str,
    blob: &TilingBlob,
    block_dim: u64,
    io: &DeviceIo,
    order: CoreOrder,
) -> Result<LaunchReport> {
    let dispatcher = library.dispatcher(op)?;
    if blob.schema().name != op {
        return Err(TilingError::Schema(format!("{op}: blob was written for `{}`", blob.schema().name)).into());
    }

    let mut reader = blob.reader()?;
    let header = PlanHeader::read(&mut reader)?;
    let (key, variant) = dispatcher.resolve(header.wire_key)?;
    let kernel = variant(KernelArgs { key, header: &header, params: &mut reader, io })?;
    if !reader.is_done() {
        return Err(TilingError::Schema(format!("{op}: kernel `{key}` left blob fields unread")).into());
    }

    let geometry = &header.geometry;
    let workspace = Workspace::new(geometry);
    let processor = ChunkProcessor::new(geometry, kernel.as_ref(), io, &workspace);
    let cores = block_dim.max(geometry.used_core_num());
    info!(op, %key, block_dim = cores, used_core_num = geometry.used_core_num(), ?order, "launching");

    let mut reports = match order {
        CoreOrder::Forward => (0..cores).map(|core| processor.run(core)).collect::<Result<Vec<_>>>()?,
        CoreOrder::Reverse => (0..cores).rev().map(|core| processor.run(core)).collect::<Result<Vec<_>>>()?,
        CoreOrder::Parallel => (0..cores).into_par_iter().map(|core| processor.run(core)).collect::<Result<Vec<_>>>()?,
    };
    reports.sort_by_key(|r| r.core);
    Ok(LaunchReport { op: op.to_string(), key, cores: reports })
}

/// Launch with the blob and block dim of a host tiling result.
pub fn launch_output(
    library: &KernelLibrary,
    op: &str,
    output: &TilingOutput,
    io: &DeviceIo,
    order: CoreOrder,
) -> Result<LaunchReport> {
    launch(library, op, &output.blob, output.block_dim, io, order)
}

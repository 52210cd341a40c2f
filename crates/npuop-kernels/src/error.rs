//! Device-side failures and the dispatch error type.

use thiserror::Error;

use npuop_common::TilingError;
use npuop_tiling::TilingKey;

/// A fault that aborts a launch. Nothing on the device side is retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceFault {
    #[error("core {core} read scratch at offset {offset} before fencing its write")]
    StaleScratchRead { core: u64, offset: u64 },

    #[error("core {core}: {queue} queue already holds {depth} buffers")]
    QueueOverflow { core: u64, queue: &'static str, depth: usize },

    #[error("core {core}: access {start}..{end} is outside `{buffer}` ({capacity} bytes)")]
    OutOfBounds { core: u64, buffer: String, start: u64, end: u64, capacity: u64 },

    #[error("core {core}: {reason}")]
    CoreFault { core: u64, reason: String },
}

impl DeviceFault {
    pub fn core(core: u64, reason: impl Into<String>) -> Self {
        Self::CoreFault { core, reason: reason.into() }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("{op}: no kernel variant registered for tiling key `{key}`")]
    KeyNotFound { op: String, key: TilingKey },

    #[error("device abort: {0}")]
    DeviceAbort(#[from] DeviceFault),

    #[error("operand `{name}`: {reason}")]
    Operand { name: String, reason: String },

    #[error("{op}: cannot register variant: {reason}")]
    Registration { op: String, reason: String },

    #[error(transparent)]
    Tiling(#[from] TilingError),
}

impl DispatchError {
    pub fn operand(name: &str, reason: impl Into<String>) -> Self {
        Self::Operand { name: name.to_string(), reason: reason.into() }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;

//! Simulated global memory: operand buffers, host tensors and the per-core
//! scratch area of the workspace.
//!
//! Buffers are shared by every core of a launch, so each one sits behind a
//! lock. Accesses are bounds-checked against the buffer's capacity, which
//! includes one block of slack past the block-aligned logical length; writes
//! into the slack are legal and never reach the caller.

use std::sync::{Mutex, MutexGuard, PoisonError};

use npuop_common::math::ceil_align;
use npuop_common::{DType, TensorShapeView};
use npuop_tiling::workspace::tail_tmp_ws_bytes;
use npuop_tiling::PlanGeometry;

use crate::convert;
use crate::error::{DeviceFault, DispatchError, Result};

/// Fill byte for the pad region of a chunk's local output. Any of these
/// reaching a tensor means a pad overwrote data it did not own.
pub const PAD_FILL: u8 = 0xA5;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Host tensors ────────────────────────────────────────────────────

/// A tensor in host memory, stored little-endian in its own dtype.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    pub dims: Vec<u64>,
    pub dtype: DType,
    pub bytes: Vec<u8>,
}

impl HostTensor {
    pub fn new(dims: impl Into<Vec<u64>>, dtype: DType, bytes: Vec<u8>) -> Result<Self> {
        let dims = dims.into();
        let expected = dims.iter().product::<u64>() * dtype.size_bytes();
        if bytes.len() as u64 != expected {
            return Err(DispatchError::operand(
                "host tensor",
                format!("{dims:?} {dtype} needs {expected} bytes, got {}", bytes.len()),
            ));
        }
        Ok(Self { dims, dtype, bytes })
    }

    pub fn from_f32(dims: impl Into<Vec<u64>>, dtype: DType, values: &[f32]) -> Result<Self> {
        Self::new(dims, dtype, convert::from_f32(dtype, values)?)
    }

    pub fn zeros(dims: impl Into<Vec<u64>>, dtype: DType) -> Self {
        let dims = dims.into();
        let len = dims.iter().product::<u64>() * dtype.size_bytes();
        Self { dims, dtype, bytes: vec![0; len as usize] }
    }

    pub fn to_f32(&self) -> Result<Vec<f32>> {
        convert::to_f32(self.dtype, &self.bytes)
    }

    pub fn numel(&self) -> u64 {
        self.dims.iter().product()
    }

    /// Shape descriptor for building a tiling context.
    pub fn view(&self) -> TensorShapeView {
        TensorShapeView::new(self.dims.clone(), self.dtype)
    }
}

// ── Global memory ───────────────────────────────────────────────────

/// One operand in simulated global memory.
#[derive(Debug)]
pub struct GmBuffer {
    name: String,
    len: u64,
    data: Mutex<Vec<u8>>,
}

impl GmBuffer {
    /// Place `bytes` at the start of a buffer padded to the next block
    /// boundary plus one block of slack.
    pub fn new(name: impl Into<String>, mut bytes: Vec<u8>, align_bytes: u64) -> Self {
        let len = bytes.len() as u64;
        let capacity = ceil_align(len, align_bytes) + align_bytes;
        bytes.resize(capacity as usize, 0);
        Self { name: name.into(), len, data: Mutex::new(bytes) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Logical length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn span(&self, core: u64, offset: u64, len: u64, capacity: usize) -> std::result::Result<std::ops::Range<usize>, DeviceFault> {
        let end = offset.checked_add(len).filter(|&end| end <= capacity as u64);
        match end {
            Some(end) => Ok(offset as usize..end as usize),
            None => Err(DeviceFault::OutOfBounds {
                core,
                buffer: self.name.clone(),
                start: offset,
                end: offset.saturating_add(len),
                capacity: capacity as u64,
            }),
        }
    }

    pub fn read(&self, core: u64, offset: u64, len: u64) -> std::result::Result<Vec<u8>, DeviceFault> {
        let data = lock(&self.data);
        let range = self.span(core, offset, len, data.len())?;
        Ok(data[range].to_vec())
    }

    pub fn write(&self, core: u64, offset: u64, bytes: &[u8]) -> std::result::Result<(), DeviceFault> {
        let mut data = lock(&self.data);
        let range = self.span(core, offset, bytes.len() as u64, data.len())?;
        data[range].copy_from_slice(bytes);
        Ok(())
    }

    /// `elem += value` for one `dtype` element, under the buffer lock so
    /// concurrent cores never lose an update.
    pub fn atomic_add(&self, core: u64, dtype: DType, elem: u64, value: &[u8]) -> Result<()> {
        let eb = dtype.size_bytes();
        let mut data = lock(&self.data);
        let range = self.span(core, elem * eb, eb, data.len())?;
        convert::add_assign(dtype, &mut data[range], value)
    }

    /// Read one element of `elem_bytes` at each element offset, in order.
    pub fn gather(
        &self,
        core: u64,
        offsets: impl IntoIterator<Item = u64>,
        elem_bytes: u64,
    ) -> std::result::Result<Vec<u8>, DeviceFault> {
        let data = lock(&self.data);
        let mut out = Vec::new();
        for offset in offsets {
            let range = self.span(core, offset * elem_bytes, elem_bytes, data.len())?;
            out.extend_from_slice(&data[range]);
        }
        Ok(out)
    }

    /// The logical bytes, dropping slack.
    pub fn into_bytes(self) -> Vec<u8> {
        let mut bytes = self.data.into_inner().unwrap_or_else(PoisonError::into_inner);
        bytes.truncate(self.len as usize);
        bytes
    }
}

/// Operand buffers of one launch, in kernel argument order.
#[derive(Debug)]
pub struct DeviceIo {
    inputs: Vec<Option<(GmBuffer, DType)>>,
    outputs: Vec<(GmBuffer, HostTensor)>,
}

impl DeviceIo {
    /// Copy `inputs` and the initial contents of `outputs` to device memory.
    /// A `None` input is an absent optional operand. In-place operators pass
    /// a copy of the updated input as the output.
    pub fn new(inputs: &[Option<&HostTensor>], outputs: &[HostTensor], align_bytes: u64) -> Self {
        let inputs = inputs
            .iter()
            .enumerate()
            .map(|(i, t)| t.map(|t| (GmBuffer::new(format!("input{i}"), t.bytes.clone(), align_bytes), t.dtype)))
            .collect();
        let outputs = outputs
            .iter()
            .enumerate()
            .map(|(i, t)| (GmBuffer::new(format!("output{i}"), t.bytes.clone(), align_bytes), t.clone()))
            .collect();
        Self { inputs, outputs }
    }

    /// Shorthand for launches where every input is present.
    pub fn with_inputs(inputs: &[&HostTensor], outputs: &[HostTensor], align_bytes: u64) -> Self {
        let inputs: Vec<Option<&HostTensor>> = inputs.iter().copied().map(Some).collect();
        Self::new(&inputs, outputs, align_bytes)
    }

    pub fn input(&self, index: usize) -> Result<&GmBuffer> {
        self.input_with_dtype(index).map(|(buf, _)| buf)
    }

    pub fn optional_input(&self, index: usize) -> Option<&GmBuffer> {
        self.inputs.get(index).and_then(Option::as_ref).map(|(buf, _)| buf)
    }

    pub fn input_dtype(&self, index: usize) -> Result<DType> {
        self.input_with_dtype(index).map(|(_, dtype)| dtype)
    }

    fn input_with_dtype(&self, index: usize) -> Result<(&GmBuffer, DType)> {
        match self.inputs.get(index) {
            Some(Some((buf, dtype))) => Ok((buf, *dtype)),
            _ => Err(DispatchError::operand(&format!("input{index}"), "not bound")),
        }
    }

    pub fn output(&self, index: usize) -> Result<&GmBuffer> {
        self.outputs
            .get(index)
            .map(|(buf, _)| buf)
            .ok_or_else(|| DispatchError::operand(&format!("output{index}"), "not bound"))
    }

    pub fn output_dtype(&self, index: usize) -> Result<DType> {
        self.outputs
            .get(index)
            .map(|(_, t)| t.dtype)
            .ok_or_else(|| DispatchError::operand(&format!("output{index}"), "not bound"))
    }

    /// Take the outputs back to the host.
    pub fn into_outputs(self) -> Vec<HostTensor> {
        self.outputs
            .into_iter()
            .map(|(buf, shape)| HostTensor { bytes: buf.into_bytes(), ..shape })
            .collect()
    }
}

// ── Workspace scratch ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Clean,
    Written,
    Fenced,
}

/// The tail-merge region of a launch's workspace: one private slot per
/// used core. A slot must be fenced between a write and the read that
/// consumes it.
#[derive(Debug)]
pub struct Workspace {
    buf: GmBuffer,
    stride: u64,
    slots: Mutex<Vec<SlotState>>,
}

impl Workspace {
    pub fn new(geometry: &PlanGeometry) -> Self {
        let bytes = tail_tmp_ws_bytes(geometry);
        let slots = if geometry.tail_merge { geometry.used_core_num() as usize } else { 0 };
        Self {
            buf: GmBuffer::new("tail_tmp_ws", vec![0; bytes as usize], geometry.align_bytes),
            stride: geometry.scratch_stride_bytes,
            slots: Mutex::new(vec![SlotState::Clean; slots]),
        }
    }

    pub fn len(&self) -> u64 {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Check that `offset..offset+len` lies inside `core`'s slot.
    fn own_slot(&self, core: u64, offset: u64, len: u64) -> std::result::Result<usize, DeviceFault> {
        let start = core * self.stride;
        let inside = offset >= start && offset + len <= start + self.stride;
        let slot = core as usize;
        if !inside || slot >= lock(&self.slots).len() {
            return Err(DeviceFault::OutOfBounds {
                core,
                buffer: format!("scratch slot {core}"),
                start: offset,
                end: offset + len,
                capacity: self.stride,
            });
        }
        Ok(slot)
    }

    pub fn scratch_write(&self, core: u64, offset: u64, bytes: &[u8]) -> std::result::Result<(), DeviceFault> {
        let slot = self.own_slot(core, offset, bytes.len() as u64)?;
        self.buf.write(core, offset, bytes)?;
        lock(&self.slots)[slot] = SlotState::Written;
        Ok(())
    }

    /// Order `core`'s scratch writes before its later scratch reads.
    pub fn fence(&self, core: u64) {
        if let Some(state) = lock(&self.slots).get_mut(core as usize) {
            if *state == SlotState::Written {
                *state = SlotState::Fenced;
            }
        }
    }

    pub fn scratch_read(&self, core: u64, offset: u64, len: u64) -> std::result::Result<Vec<u8>, DeviceFault> {
        let slot = self.own_slot(core, offset, len)?;
        if lock(&self.slots)[slot] != SlotState::Fenced {
            return Err(DeviceFault::StaleScratchRead { core, offset });
        }
        self.buf.read(core, offset, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use npuop_tiling::{CoreSplit, GridSplit, SizeRegime};

    #[test]
    fn buffer_has_one_block_of_slack() {
        let buf = GmBuffer::new("x", vec![1; 40], 32);
        assert!(buf.write(0, 64, &[0; 32]).is_ok());
        let err = buf.write(2, 65, &[0; 32]).unwrap_err();
        assert!(matches!(err, DeviceFault::OutOfBounds { core: 2, end: 97, capacity: 96, .. }));
        assert_eq!(buf.into_bytes(), vec![1; 40]);
    }

    #[test]
    fn gather_reads_elements_in_order() {
        let buf = GmBuffer::new("x", vec![0, 1, 2, 3, 4, 5, 6, 7], 32);
        assert_eq!(buf.gather(0, [3, 0, 3], 2).unwrap(), vec![6, 7, 0, 1, 6, 7]);
    }

    #[test]
    fn host_tensor_length_is_checked() {
        assert!(HostTensor::new(vec![2, 3], DType::Float16, vec![0; 12]).is_ok());
        assert!(HostTensor::new(vec![2, 3], DType::Float16, vec![0; 10]).is_err());
    }

    #[test]
    fn atomic_add_accumulates_in_the_element_type() {
        let buf = GmBuffer::new("var", convert::from_f32(DType::Float16, &[1.0, 2.0]).unwrap(), 32);
        buf.atomic_add(0, DType::Float16, 1, &convert::from_f32(DType::Float16, &[0.5]).unwrap()).unwrap();
        assert_eq!(convert::to_f32(DType::Float16, &buf.into_bytes()).unwrap(), vec![1.0, 2.5]);

        let buf = GmBuffer::new("counts", vec![250, 1], 32);
        buf.atomic_add(3, DType::UInt8, 0, &[10]).unwrap();
        assert_eq!(buf.into_bytes(), vec![4, 1]);
    }

    #[test]
    fn outputs_start_from_the_host_contents() {
        let var = HostTensor::from_f32(vec![4], DType::Float32, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let io = DeviceIo::with_inputs(&[], std::slice::from_ref(&var), 32);
        assert_eq!(io.into_outputs(), vec![var]);
    }

    fn merging_geometry() -> PlanGeometry {
        PlanGeometry {
            grid: GridSplit::new(4, 13, 1, 13).unwrap(),
            cores: CoreSplit::even(4, 4),
            pass_elems: 16,
            elem_bytes: 4,
            align_bytes: 32,
            tail_merge: true,
            scratch_stride_bytes: 32,
            buffer_num: 2,
            regime: SizeRegime::Unaligned,
        }
    }

    #[test]
    fn scratch_read_needs_a_fence() {
        let ws = Workspace::new(&merging_geometry());
        assert_eq!(ws.len(), 128);
        ws.scratch_write(1, 32, &[9; 32]).unwrap();
        assert_eq!(ws.scratch_read(1, 32, 20), Err(DeviceFault::StaleScratchRead { core: 1, offset: 32 }));
        ws.fence(1);
        assert_eq!(ws.scratch_read(1, 32, 20).unwrap(), vec![9; 20]);
    }

    #[test]
    fn scratch_slots_are_private() {
        let ws = Workspace::new(&merging_geometry());
        assert!(matches!(ws.scratch_write(1, 0, &[0; 8]), Err(DeviceFault::OutOfBounds { core: 1, .. })));
        assert!(matches!(ws.scratch_write(1, 48, &[0; 32]), Err(DeviceFault::OutOfBounds { .. })));
    }
}

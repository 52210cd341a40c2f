//! Byte-level element conversion between global-memory storage and the
//! `f32` compute type.

use bytemuck::{bytes_of, cast_slice, pod_collect_to_vec, pod_read_unaligned};
use half::{bf16, f16};

use npuop_common::DType;

use crate::error::{DispatchError, Result};

fn check_len(what: &str, dtype: DType, bytes: &[u8]) -> Result<()> {
    let size = dtype.size_bytes() as usize;
    if bytes.len() % size != 0 {
        return Err(DispatchError::operand(
            what,
            format!("{} bytes is not a whole number of {dtype} elements", bytes.len()),
        ));
    }
    Ok(())
}

/// Widen stored elements to `f32`.
pub fn to_f32(dtype: DType, bytes: &[u8]) -> Result<Vec<f32>> {
    check_len("to_f32", dtype, bytes)?;
    match dtype {
        DType::Float32 => Ok(pod_collect_to_vec::<u8, f32>(bytes)),
        DType::Float16 => Ok(pod_collect_to_vec::<u8, f16>(bytes).into_iter().map(f16::to_f32).collect()),
        DType::BFloat16 => Ok(pod_collect_to_vec::<u8, bf16>(bytes).into_iter().map(bf16::to_f32).collect()),
        other => Err(DispatchError::operand("to_f32", format!("{other} has no float view"))),
    }
}

/// Narrow `f32` values to stored elements, rounding to nearest even.
pub fn from_f32(dtype: DType, values: &[f32]) -> Result<Vec<u8>> {
    match dtype {
        DType::Float32 => Ok(cast_slice::<f32, u8>(values).to_vec()),
        DType::Float16 => {
            let narrow: Vec<f16> = values.iter().copied().map(f16::from_f32).collect();
            Ok(cast_slice::<f16, u8>(&narrow).to_vec())
        }
        DType::BFloat16 => {
            let narrow: Vec<bf16> = values.iter().copied().map(bf16::from_f32).collect();
            Ok(cast_slice::<bf16, u8>(&narrow).to_vec())
        }
        other => Err(DispatchError::operand("from_f32", format!("{other} has no float view"))),
    }
}

/// ReLU on integer storage, without a float round trip.
pub fn relu_int(dtype: DType, bytes: &[u8]) -> Result<Vec<u8>> {
    check_len("relu_int", dtype, bytes)?;
    match dtype {
        DType::Int8 => Ok(bytes.iter().map(|&b| (b as i8).max(0) as u8).collect()),
        DType::Int32 => {
            let v: Vec<i32> = pod_collect_to_vec::<u8, i32>(bytes).into_iter().map(|x| x.max(0)).collect();
            Ok(cast_slice::<i32, u8>(&v).to_vec())
        }
        DType::Int64 => {
            let v: Vec<i64> = pod_collect_to_vec::<u8, i64>(bytes).into_iter().map(|x| x.max(0)).collect();
            Ok(cast_slice::<i64, u8>(&v).to_vec())
        }
        other => Err(DispatchError::operand("relu_int", format!("{other} is not an integer type"))),
    }
}

/// `acc += value` for one stored element. Integers wrap; float types add
/// in `f32` and round back.
pub fn add_assign(dtype: DType, acc: &mut [u8], value: &[u8]) -> Result<()> {
    let size = dtype.size_bytes() as usize;
    if acc.len() != size || value.len() != size {
        return Err(DispatchError::operand(
            "add_assign",
            format!("{} += {} bytes is not one {dtype} element", acc.len(), value.len()),
        ));
    }
    match dtype {
        DType::Int8 => acc[0] = (acc[0] as i8).wrapping_add(value[0] as i8) as u8,
        DType::UInt8 => acc[0] = acc[0].wrapping_add(value[0]),
        DType::Int32 => {
            let sum = pod_read_unaligned::<i32>(acc).wrapping_add(pod_read_unaligned(value));
            acc.copy_from_slice(bytes_of(&sum));
        }
        DType::Int64 => {
            let sum = pod_read_unaligned::<i64>(acc).wrapping_add(pod_read_unaligned(value));
            acc.copy_from_slice(bytes_of(&sum));
        }
        _ => {
            let sum = to_f32(dtype, acc)?[0] + to_f32(dtype, value)?[0];
            acc.copy_from_slice(&from_f32(dtype, &[sum])?);
        }
    }
    Ok(())
}

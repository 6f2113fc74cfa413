//! Intermediate activation tensors as carried in an assembled payload.
//!
//! ```text
//! "OTNS" <precision:u8> <varint rank> <varint dim>* <little-endian elements>
//! ```
//!
//! `precision` 0 is f32; 1 is f16, a lossy mode that must be chosen
//! explicitly by the sender.

use std::fmt;

use half::f16;
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::error::{OffloadError, Result};
use crate::protocol::varint::{read_varint, write_varint};

/// Tensor payload magic
pub const TENSOR_MAGIC: &[u8; 4] = b"OTNS";

/// Highest rank accepted on decode
pub const MAX_RANK: usize = 8;

/// Element precision on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// 32-bit float, bit-exact
    #[default]
    Full,
    /// 16-bit float, lossy
    Half,
}

impl Precision {
    fn tag(self) -> u8 {
        match self {
            Precision::Full => 0,
            Precision::Half => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Precision::Full),
            1 => Ok(Precision::Half),
            other => Err(OffloadError::InvalidMessage(format!(
                "Unknown tensor precision tag {other}"
            ))),
        }
    }

    /// Bytes per element
    pub fn width(self) -> usize {
        match self {
            Precision::Full => 4,
            Precision::Half => 2,
        }
    }
}

impl std::str::FromStr for Precision {
    type Err = OffloadError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "full" | "f32" => Ok(Precision::Full),
            "half" | "f16" => Ok(Precision::Half),
            _ => Err(OffloadError::Config(format!("Unknown precision: {s}"))),
        }
    }
}

/// Dense f32 tensor.
#[derive(Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Build from a shape and row-major data.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected = element_count(&shape)?;
        if expected != data.len() {
            return Err(OffloadError::InvalidMessage(format!(
                "Shape {shape:?} needs {expected} elements, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Take ownership of an ndarray.
    pub fn from_array(array: ArrayD<f32>) -> Self {
        let shape = array.shape().to_vec();
        // logical order, whatever the memory layout
        let data = array.iter().copied().collect();
        Self { shape, data }
    }

    /// View as an ndarray.
    pub fn into_array(self) -> Result<ArrayD<f32>> {
        ArrayD::from_shape_vec(IxDyn(&self.shape), self.data)
            .map_err(|e| OffloadError::InvalidMessage(format!("Tensor shape error: {e}")))
    }

    /// Dimensions
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Row-major elements
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// No elements
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Encode at the given precision.
    pub fn to_bytes(&self, precision: Precision) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.data.len() * precision.width());
        buf.extend_from_slice(TENSOR_MAGIC);
        buf.push(precision.tag());
        write_varint(&mut buf, self.shape.len() as u64);
        for dim in &self.shape {
            write_varint(&mut buf, *dim as u64);
        }
        match precision {
            Precision::Full => {
                for v in &self.data {
                    buf.extend_from_slice(&v.to_le_bytes());
                }
            },
            Precision::Half => {
                for v in &self.data {
                    buf.extend_from_slice(&f16::from_f32(*v).to_le_bytes());
                }
            },
        }
        buf
    }

    /// Decode, widening f16 payloads back to f32.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let rest = data.strip_prefix(TENSOR_MAGIC.as_slice()).ok_or_else(|| {
            OffloadError::InvalidMessage("Payload is not a tensor (bad magic)".to_string())
        })?;
        let (&tag, mut rest) = rest
            .split_first()
            .ok_or_else(|| OffloadError::InvalidMessage("Truncated tensor header".to_string()))?;
        let precision = Precision::from_tag(tag)?;

        let (rank, used) = read_varint(rest)?;
        rest = &rest[used..];
        let rank = rank as usize;
        if rank > MAX_RANK {
            return Err(OffloadError::InvalidMessage(format!(
                "Tensor rank {rank} exceeds {MAX_RANK}"
            )));
        }

        let mut shape = Vec::with_capacity(rank);
        for _ in 0..rank {
            let (dim, used) = read_varint(rest)?;
            rest = &rest[used..];
            shape.push(usize::try_from(dim).map_err(|_| {
                OffloadError::InvalidMessage(format!("Tensor dimension {dim} too large"))
            })?);
        }

        let count = element_count(&shape)?;
        let expected = count
            .checked_mul(precision.width())
            .ok_or_else(|| OffloadError::InvalidMessage("Tensor too large".to_string()))?;
        if rest.len() != expected {
            return Err(OffloadError::InvalidMessage(format!(
                "Tensor {shape:?} needs {expected} data bytes, got {}",
                rest.len()
            )));
        }

        let values = match precision {
            Precision::Full => rest
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
            Precision::Half => rest
                .chunks_exact(2)
                .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
                .collect(),
        };

        Ok(Self {
            shape,
            data: values,
        })
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("len", &self.data.len())
            .finish()
    }
}

fn element_count(shape: &[usize]) -> Result<usize> {
    shape
        .iter()
        .try_fold(1usize, |acc, d| acc.checked_mul(*d))
        .ok_or_else(|| OffloadError::InvalidMessage(format!("Shape {shape:?} overflows")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_precision_is_exact() {
        let tensor = Tensor::new(vec![2, 3], vec![0.1, -2.5, 3.0, 1e-7, f32::MAX, 0.0]).unwrap();
        let decoded = Tensor::from_bytes(&tensor.to_bytes(Precision::Full)).unwrap();
        assert_eq!(decoded, tensor);
    }

    #[test]
    fn test_half_precision_within_tolerance() {
        let data: Vec<f32> = (0..64).map(|i| i as f32 * 0.37 - 10.0).collect();
        let tensor = Tensor::new(vec![1, 64], data.clone()).unwrap();
        let bytes = tensor.to_bytes(Precision::Half);
        assert!(bytes.len() < tensor.to_bytes(Precision::Full).len());

        let decoded = Tensor::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.shape(), &[1, 64]);
        for (a, b) in data.iter().zip(decoded.data()) {
            assert!((a - b).abs() <= a.abs() * 1e-3 + 1e-3, "{a} vs {b}");
        }
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        assert!(Tensor::new(vec![2, 2], vec![1.0; 3]).is_err());

        let mut bytes = Tensor::new(vec![4], vec![1.0; 4])
            .unwrap()
            .to_bytes(Precision::Full);
        bytes.pop();
        assert!(Tensor::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_bad_magic() {
        assert!(Tensor::from_bytes(b"abcd").is_err());
        assert!(Tensor::from_bytes(b"").is_err());
    }

    #[test]
    fn test_ndarray_conversion() {
        let array = ndarray::Array2::from_shape_vec((2, 2), vec![1.0f32, 2.0, 3.0, 4.0])
            .unwrap()
            .into_dyn();
        let tensor = Tensor::from_array(array.clone());
        assert_eq!(tensor.shape(), &[2, 2]);
        assert_eq!(tensor.into_array().unwrap(), array);
    }

    #[test]
    fn test_transposed_array_is_copied_row_major() {
        let array = ndarray::Array2::from_shape_vec((2, 3), vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0])
            .unwrap();
        let tensor = Tensor::from_array(array.t().to_owned().into_dyn());
        assert_eq!(tensor.shape(), &[3, 2]);
        assert_eq!(tensor.data(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }
}

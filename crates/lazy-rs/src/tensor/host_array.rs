//! Host-resident arrays used to move data in and out of lazy buffers.

use anyhow::{ensure, Result};

use super::dtype::{f64_to_i32_trunc_saturating, DType};

/// Typed, densely packed element storage.
#[derive(Debug, Clone, PartialEq)]
pub enum HostData {
    Bool(Vec<bool>),
    I32(Vec<i32>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl HostData {
    /// Allocates zero-filled storage for `len` elements of `dtype`.
    pub fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::Bool => HostData::Bool(vec![false; len]),
            DType::I32 => HostData::I32(vec![0; len]),
            DType::F32 => HostData::F32(vec![0.0; len]),
            DType::F64 => HostData::F64(vec![0.0; len]),
        }
    }

    /// Converts `f64` lanes into storage of `dtype`, rounding each lane to the dtype.
    pub fn from_lanes(dtype: DType, lanes: &[f64]) -> Self {
        match dtype {
            DType::Bool => HostData::Bool(lanes.iter().map(|&v| v != 0.0).collect()),
            DType::I32 => HostData::I32(
                lanes
                    .iter()
                    .map(|&v| f64_to_i32_trunc_saturating(v))
                    .collect(),
            ),
            DType::F32 => HostData::F32(lanes.iter().map(|&v| v as f32).collect()),
            DType::F64 => HostData::F64(lanes.to_vec()),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            HostData::Bool(_) => DType::Bool,
            HostData::I32(_) => DType::I32,
            HostData::F32(_) => DType::F32,
            HostData::F64(_) => DType::F64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            HostData::Bool(values) => values.len(),
            HostData::I32(values) => values.len(),
            HostData::F32(values) => values.len(),
            HostData::F64(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads element `index` widened to an `f64` lane.
    pub fn lane(&self, index: usize) -> f64 {
        match self {
            HostData::Bool(values) => {
                if values[index] {
                    1.0
                } else {
                    0.0
                }
            }
            HostData::I32(values) => values[index] as f64,
            HostData::F32(values) => values[index] as f64,
            HostData::F64(values) => values[index],
        }
    }

    /// Widens every element to an `f64` lane.
    pub fn to_lanes(&self) -> Vec<f64> {
        (0..self.len()).map(|idx| self.lane(idx)).collect()
    }
}

/// Dense host array with a static shape.
#[derive(Debug, Clone, PartialEq)]
pub struct HostArray {
    shape: Vec<usize>,
    data: HostData,
}

impl HostArray {
    /// Wraps `data`, validating its length against `shape`.
    pub fn new(shape: impl Into<Vec<usize>>, data: HostData) -> Result<Self> {
        let shape = shape.into();
        let expected: usize = shape.iter().product();
        ensure!(
            data.len() == expected,
            "host data length ({}) does not match shape {:?}",
            data.len(),
            shape
        );
        Ok(HostArray { shape, data })
    }

    pub fn from_f32(shape: impl Into<Vec<usize>>, data: Vec<f32>) -> Result<Self> {
        Self::new(shape, HostData::F32(data))
    }

    pub fn from_f64(shape: impl Into<Vec<usize>>, data: Vec<f64>) -> Result<Self> {
        Self::new(shape, HostData::F64(data))
    }

    pub fn from_i32(shape: impl Into<Vec<usize>>, data: Vec<i32>) -> Result<Self> {
        Self::new(shape, HostData::I32(data))
    }

    pub fn from_bool(shape: impl Into<Vec<usize>>, data: Vec<bool>) -> Result<Self> {
        Self::new(shape, HostData::Bool(data))
    }

    /// Builds an array of `dtype` from `f64` lanes.
    pub fn from_lanes(shape: impl Into<Vec<usize>>, dtype: DType, lanes: &[f64]) -> Result<Self> {
        Self::new(shape, HostData::from_lanes(dtype, lanes))
    }

    /// Returns an array of `shape` with every element equal to `value`.
    pub fn filled(shape: impl Into<Vec<usize>>, dtype: DType, value: f64) -> Self {
        let shape = shape.into();
        let len = shape.iter().product();
        HostArray {
            shape,
            data: HostData::from_lanes(dtype, &vec![value; len]),
        }
    }

    /// Returns a rank-0 array holding `value`.
    pub fn scalar(dtype: DType, value: f64) -> Self {
        Self::filled(Vec::new(), dtype, value)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &HostData {
        &self.data
    }

    pub fn into_data(self) -> HostData {
        self.data
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            HostData::F32(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<&[f64]> {
        match &self.data {
            HostData::F64(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<&[i32]> {
        match &self.data {
            HostData::I32(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<&[bool]> {
        match &self.data {
            HostData::Bool(values) => Some(values),
            _ => None,
        }
    }

    pub fn to_lanes(&self) -> Vec<f64> {
        self.data.to_lanes()
    }

    /// Reinterprets the array with a new shape of the same element count.
    pub fn reshape(self, shape: impl Into<Vec<usize>>) -> Result<Self> {
        Self::new(shape, self.data)
    }
}

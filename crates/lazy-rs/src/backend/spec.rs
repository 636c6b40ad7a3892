//! Contract between the lazy engine and compute backends.
//!
//! A backend uploads host arrays, allocates uninitialized storage, and executes resolved operation
//! trees (see [`crate::ops::LazyOp`]) whose leaves are `MEM`/`CONST` buffer ops. Results come back
//! as [`RawBuffer`]s, which the engine treats as opaque apart from their length, dtype, and whether
//! they may be passed to a kernel.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{ensure, Result};
use thiserror::Error;

use crate::lazy::LazyBuffer;
use crate::ops::LazyOp;
use crate::tensor::{DType, HostArray, HostData};

/// Extra per-device arguments derived from the device string (e.g. `{"device": "1"}`).
pub type DeviceArgs = BTreeMap<String, String>;

/// Errors surfaced by backend implementations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    #[error("{op} is not implemented: {reason}")]
    Unimplemented { op: &'static str, reason: String },
    #[error("backend execution failure: {message}")]
    Execution { message: String },
}

impl BackendError {
    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }
}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

/// Static facts about a backend that change how loads are realized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
    /// The backend compiles operation trees into kernels (as opposed to interpreting them
    /// eagerly against host data).
    pub compiled: bool,
    /// Constants, including NaN and infinities, can be folded into generated kernels instead of
    /// being uploaded as one-element buffers.
    pub non_finite_const_folding: bool,
}

impl BackendCapabilities {
    /// Whether constant loads may be realized as storage-free [`RawBuffer::constant`] values.
    pub fn folds_constants(&self) -> bool {
        self.compiled && self.non_finite_const_folding
    }
}

impl Default for BackendCapabilities {
    fn default() -> Self {
        BackendCapabilities {
            compiled: true,
            non_finite_const_folding: true,
        }
    }
}

/// Backend-owned storage behind a [`RawBuffer`].
pub trait DeviceStorage: Send + Sync + fmt::Debug {
    /// Copies the stored elements back into host memory as `dtype`.
    fn read_to_host(&self, dtype: DType) -> BackendResult<HostData>;

    /// Enables backends to recover their concrete storage type.
    fn as_any(&self) -> &dyn Any;
}

/// Storage kept in host memory. Interpreting backends use it directly as their device storage.
#[derive(Debug, Clone, PartialEq)]
pub struct HostBuffer {
    data: HostData,
}

impl HostBuffer {
    pub fn new(data: HostData) -> Self {
        HostBuffer { data }
    }

    pub fn data(&self) -> &HostData {
        &self.data
    }
}

impl DeviceStorage for HostBuffer {
    fn read_to_host(&self, dtype: DType) -> BackendResult<HostData> {
        if self.data.dtype() == dtype {
            return Ok(self.data.clone());
        }
        Ok(HostData::from_lanes(dtype, &self.data.to_lanes()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone)]
pub enum RawStorage {
    /// A folded scalar constant; carries no device storage and is never a kernel argument.
    Const(f64),
    Device(Arc<dyn DeviceStorage>),
}

/// Concrete, backend-produced result of realizing a base buffer.
#[derive(Debug, Clone)]
pub struct RawBuffer {
    len: usize,
    dtype: DType,
    storage: RawStorage,
}

impl RawBuffer {
    /// Size-1, storage-free constant.
    pub fn constant(value: f64, dtype: DType) -> Self {
        RawBuffer {
            len: 1,
            dtype,
            storage: RawStorage::Const(value),
        }
    }

    pub fn from_storage(len: usize, dtype: DType, storage: Arc<dyn DeviceStorage>) -> Self {
        RawBuffer {
            len,
            dtype,
            storage: RawStorage::Device(storage),
        }
    }

    /// Wraps host data as a host-resident result.
    pub fn host(data: HostData) -> Self {
        let len = data.len();
        let dtype = data.dtype();
        Self::from_storage(len, dtype, Arc::new(HostBuffer::new(data)))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn storage(&self) -> &RawStorage {
        &self.storage
    }

    /// Returns the folded value when this is a storage-free constant.
    pub fn as_constant(&self) -> Option<f64> {
        match self.storage {
            RawStorage::Const(value) => Some(value),
            RawStorage::Device(_) => None,
        }
    }

    /// False for folded constants, which are inlined into kernels rather than passed to them.
    pub fn is_kernel_arg(&self) -> bool {
        matches!(self.storage, RawStorage::Device(_))
    }

    /// Downcasts the device storage to a backend's concrete type.
    pub fn downcast_storage<T: DeviceStorage + 'static>(&self) -> Option<&T> {
        match &self.storage {
            RawStorage::Device(storage) => storage.as_any().downcast_ref::<T>(),
            RawStorage::Const(_) => None,
        }
    }

    /// Reads the buffer back into a host array of `shape`.
    pub fn to_host(&self, shape: &[usize]) -> Result<HostArray> {
        let expected: usize = shape.iter().product();
        ensure!(
            expected == self.len,
            "cannot read {} elements back as shape {:?}",
            self.len,
            shape
        );
        let data = match &self.storage {
            RawStorage::Const(value) => HostData::from_lanes(self.dtype, &[*value]),
            RawStorage::Device(storage) => storage.read_to_host(self.dtype)?,
        };
        HostArray::new(shape.to_vec(), data)
    }
}

/// Compute backend driven by the realizer.
///
/// Implementations must be thread-safe: several roots may be realized concurrently.
pub trait Backend: Send + Sync {
    /// Human-readable identifier, also used in error reports.
    fn backend_name(&self) -> &str;

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::default()
    }

    /// Uploads a host array.
    fn from_host(&self, array: &HostArray, args: &DeviceArgs) -> BackendResult<RawBuffer>;

    /// Allocates storage for `len` elements; contents are unspecified.
    fn allocate(&self, len: usize, dtype: DType, args: &DeviceArgs) -> BackendResult<RawBuffer>;

    /// Executes a resolved operation tree.
    ///
    /// `inputs[i]` backs `MEM` slot `i + 1`; slot 0 is the output, whose shape and dtype are
    /// read from `output`.
    fn exec(
        &self,
        ast: &LazyOp,
        output: &LazyBuffer,
        inputs: &[RawBuffer],
        args: &DeviceArgs,
    ) -> BackendResult<RawBuffer>;
}

//! Core tensor value types shared by the lazy graph and its backends.
//!
//! The tensor module defines scalar dtypes, shapes that may carry symbolic extents, and the
//! host array type used to move data across the host/backend boundary.

pub mod dtype;
mod host_array;
pub mod shape;

pub use dtype::DType;
pub use host_array::{HostArray, HostData};
pub use shape::{DimSymbol, Dimension, Shape};

//! Enumerates the scalar element types carried by lazy buffers.

/// Logical dtype identifier shared between host arrays, lazy buffers, and backend results.
///
/// Variants are declared in promotion order: when several operands meet in an elementwise
/// operation the result takes the greatest dtype under the derived `Ord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DType {
    /// Boolean stored as one byte per element.
    Bool,
    /// 32-bit signed integer, primarily for indices and comparisons.
    I32,
    /// 32-bit floating point following IEEE-754 semantics.
    F32,
    /// 64-bit floating point following IEEE-754 semantics.
    F64,
}

impl DType {
    /// Returns the number of bytes required per scalar element.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::Bool => 1,
            DType::I32 | DType::F32 => 4,
            DType::F64 => 8,
        }
    }

    /// Returns `true` for floating-point dtypes.
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    /// Returns `true` for integer dtypes (booleans excluded).
    pub fn is_int(self) -> bool {
        matches!(self, DType::I32)
    }

    /// Rounds an `f64` lane to the value representable in this dtype.
    ///
    /// Backends that compute in `f64` lanes call this after every operation so results match
    /// what a kernel operating natively in the dtype would produce.
    pub fn round_lane(self, value: f64) -> f64 {
        match self {
            DType::Bool => {
                if value != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            DType::I32 => f64_to_i32_trunc_saturating(value) as f64,
            DType::F32 => value as f32 as f64,
            DType::F64 => value,
        }
    }

    /// Returns the widest dtype among the provided ones.
    pub fn widest<I: IntoIterator<Item = DType>>(dtypes: I) -> Option<DType> {
        dtypes.into_iter().max()
    }
}

pub(crate) fn f64_to_i32_trunc_saturating(value: f64) -> i32 {
    if value.is_nan() {
        return 0;
    }
    let truncated = value.trunc();
    if truncated > i32::MAX as f64 {
        i32::MAX
    } else if truncated < i32::MIN as f64 {
        i32::MIN
    } else {
        truncated as i32
    }
}

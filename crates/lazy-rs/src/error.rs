//! Typed failures raised by graph construction, scheduling, and realization.
//!
//! Public entry points return `anyhow::Result`; callers that need to react to a specific failure
//! class recover it with `err.downcast_ref::<LazyError>()`.

use thiserror::Error;

use crate::backend::spec::BackendError;

#[derive(Debug, Error)]
pub enum LazyError {
    /// A programming-contract breach: malformed arguments, inconsistent graph state, or a lost
    /// materialization race. Never recovered.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// An operation that needs fully known extents met a symbolic shape.
    #[error("unsupported shape {shape}: {reason}")]
    UnsupportedShape { shape: String, reason: String },

    /// Buffer-slot resolution met a leaf that is neither a constant nor a memory reference.
    #[error("unhandled buffer kind: {0}")]
    UnhandledBufferKind(String),

    /// No backend is registered for the device's backend name.
    #[error("no backend registered for device `{0}`")]
    UnknownDevice(String),

    /// The backend rejected or failed a request.
    #[error("backend `{backend}` failed: {source}")]
    Backend {
        backend: String,
        #[source]
        source: BackendError,
    },
}

impl LazyError {
    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        LazyError::InvariantViolation(message.into())
    }

    pub(crate) fn unsupported_shape(shape: impl ToString, reason: impl Into<String>) -> Self {
        LazyError::UnsupportedShape {
            shape: shape.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn backend(backend: &str, source: BackendError) -> Self {
        LazyError::Backend {
            backend: backend.to_string(),
            source,
        }
    }
}

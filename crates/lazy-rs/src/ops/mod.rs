//! Operation nodes of the lazy graph and the hooks used to observe their execution.
//!
//! [`LazyOp`] trees are built by [`crate::lazy::LazyBuffer`] constructors, rewritten by the
//! fusion passes, and finally handed to a backend with `MEM`/`CONST` leaves in place of buffers.
pub mod lazy_op;
pub mod opcode;
pub mod trace;

pub use lazy_op::{ConstBuffer, CustomLoader, LazyOp, MemBuffer, OpArg, OpSource};
pub use opcode::{BinaryOp, BufferOp, LoadOp, Opcode, ReduceOp, TernaryOp, UnaryOp};

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use anyhow::Result;

use super::opcode::Opcode;
use crate::backend::RawBuffer;
use crate::lazy::{BufferId, LazyBuffer};
use crate::tensor::{DType, Shape};
use crate::view::ShapeTracker;

/// Kernel slot reference: slot `idx` read through `st`. Slot 0 is the kernel output.
#[derive(Debug, Clone, PartialEq)]
pub struct MemBuffer {
    pub idx: usize,
    pub dtype: DType,
    pub st: ShapeTracker,
}

/// Literal broadcast through `st`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstBuffer {
    pub value: f64,
    pub dtype: DType,
    pub st: ShapeTracker,
}

type LoaderFn = dyn Fn(&LazyBuffer, &[LazyBuffer]) -> Result<RawBuffer> + Send + Sync;

/// User callable producing the result of a `CUSTOM` load from the buffer and its realized sources.
#[derive(Clone)]
pub struct CustomLoader(Arc<LoaderFn>);

impl CustomLoader {
    pub fn new<F>(loader: F) -> Self
    where
        F: Fn(&LazyBuffer, &[LazyBuffer]) -> Result<RawBuffer> + Send + Sync + 'static,
    {
        CustomLoader(Arc::new(loader))
    }

    pub fn call(&self, output: &LazyBuffer, sources: &[LazyBuffer]) -> Result<RawBuffer> {
        (self.0)(output, sources)
    }
}

impl fmt::Debug for CustomLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomLoader(..)")
    }
}

/// Static payload of an operation.
#[derive(Debug, Clone)]
pub enum OpArg {
    None,
    /// Constant value of a `CONST` load, or any scalar argument.
    Scalar(f64),
    /// RNG seed of a `RAND` load.
    Seed(u64),
    /// Target dtype of `CAST`.
    Cast(DType),
    /// Output shape of a reduce.
    Shape(Shape),
    Mem(MemBuffer),
    Const(ConstBuffer),
    Custom(CustomLoader),
}

impl OpArg {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            OpArg::Scalar(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_shape(&self) -> Option<&Shape> {
        match self {
            OpArg::Shape(shape) => Some(shape),
            _ => None,
        }
    }
}

/// Source of an operation: a nested operation or a buffer leaf.
#[derive(Debug, Clone)]
pub enum OpSource {
    Op(LazyOp),
    Buffer(LazyBuffer),
}

impl OpSource {
    pub fn as_op(&self) -> Option<&LazyOp> {
        match self {
            OpSource::Op(op) => Some(op),
            OpSource::Buffer(_) => None,
        }
    }

    pub fn as_buffer(&self) -> Option<&LazyBuffer> {
        match self {
            OpSource::Buffer(buffer) => Some(buffer),
            OpSource::Op(_) => None,
        }
    }
}

impl From<LazyOp> for OpSource {
    fn from(op: LazyOp) -> Self {
        OpSource::Op(op)
    }
}

impl From<LazyBuffer> for OpSource {
    fn from(buffer: LazyBuffer) -> Self {
        OpSource::Buffer(buffer)
    }
}

impl From<&LazyBuffer> for OpSource {
    fn from(buffer: &LazyBuffer) -> Self {
        OpSource::Buffer(buffer.clone())
    }
}

/// Immutable expression node. Clones share their sources.
#[derive(Debug, Clone)]
pub struct LazyOp {
    op: Opcode,
    src: Arc<[OpSource]>,
    arg: OpArg,
}

impl LazyOp {
    pub fn new<I>(op: impl Into<Opcode>, src: I, arg: OpArg) -> Self
    where
        I: IntoIterator,
        I::Item: Into<OpSource>,
    {
        LazyOp {
            op: op.into(),
            src: src.into_iter().map(Into::into).collect(),
            arg,
        }
    }

    /// A leaf with no sources (buffer ops and source-less loads).
    pub fn leaf(op: impl Into<Opcode>, arg: OpArg) -> Self {
        LazyOp::new(op, std::iter::empty::<OpSource>(), arg)
    }

    pub fn op(&self) -> Opcode {
        self.op
    }

    pub fn src(&self) -> &[OpSource] {
        &self.src
    }

    pub fn arg(&self) -> &OpArg {
        &self.arg
    }

    /// Leaf buffers in first-visit order, each listed once.
    pub fn buffers(&self) -> Vec<LazyBuffer> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        self.collect_buffers(&mut seen, &mut out);
        out
    }

    fn collect_buffers(&self, seen: &mut HashSet<BufferId>, out: &mut Vec<LazyBuffer>) {
        for src in self.src.iter() {
            match src {
                OpSource::Op(op) => op.collect_buffers(seen, out),
                OpSource::Buffer(buffer) => {
                    if seen.insert(buffer.id()) {
                        out.push(buffer.clone());
                    }
                }
            }
        }
    }

    /// Rebuilds the tree with leaves found in `mapping` replaced. Replacements are not walked.
    pub fn substitute(&self, mapping: &HashMap<BufferId, OpSource>) -> LazyOp {
        let src = self
            .src
            .iter()
            .map(|src| match src {
                OpSource::Op(op) => OpSource::Op(op.substitute(mapping)),
                OpSource::Buffer(buffer) => mapping
                    .get(&buffer.id())
                    .cloned()
                    .unwrap_or_else(|| src.clone()),
            })
            .collect();
        LazyOp {
            op: self.op,
            src,
            arg: self.arg.clone(),
        }
    }

    /// Every operation node of the tree, root first.
    pub fn nodes(&self) -> Vec<&LazyOp> {
        let mut out = vec![self];
        for src in self.src.iter() {
            if let OpSource::Op(op) = src {
                out.extend(op.nodes());
            }
        }
        out
    }
}

impl fmt::Display for OpArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpArg::None => Ok(()),
            OpArg::Scalar(value) => write!(f, "{value}"),
            OpArg::Seed(seed) => write!(f, "seed={seed}"),
            OpArg::Cast(dtype) => write!(f, "{dtype:?}"),
            OpArg::Shape(shape) => write!(f, "{shape}"),
            OpArg::Mem(mem) => write!(f, "{} {:?} {}", mem.idx, mem.dtype, mem.st.shape()),
            OpArg::Const(c) => write!(f, "{} {:?} {}", c.value, c.dtype, c.st.shape()),
            OpArg::Custom(_) => f.write_str("custom"),
        }
    }
}

impl fmt::Display for LazyOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}", self.op)?;
        if !matches!(self.arg, OpArg::None) {
            write!(f, " {}", self.arg)?;
        }
        for src in self.src.iter() {
            match src {
                OpSource::Op(op) => write!(f, " {op}")?,
                OpSource::Buffer(buffer) => write!(f, " buf{}", buffer.id())?,
            }
        }
        write!(f, ")")
    }
}

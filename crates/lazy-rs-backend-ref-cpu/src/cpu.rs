use std::sync::Arc;

use lazy_rs::backend::spec::{
    Backend, BackendCapabilities, BackendError, BackendResult, DeviceArgs, HostBuffer,
    RawBuffer, RawStorage,
};
use lazy_rs::lazy::LazyBuffer;
use lazy_rs::ops::{
    BinaryOp, BufferOp, LazyOp, OpArg, OpSource, Opcode, ReduceOp, TernaryOp, UnaryOp,
};
use lazy_rs::tensor::{DType, HostArray, HostData, Shape};
use lazy_rs::view::{unravel, ShapeTracker};

/// Hook that may take over execution of a tree before the interpreter sees it.
pub trait CpuKernelInterceptor: Send + Sync {
    fn try_exec(
        &self,
        ast: &LazyOp,
        output: &LazyBuffer,
        inputs: &[RawBuffer],
    ) -> Option<BackendResult<RawBuffer>>;
}

#[derive(Default)]
pub struct NoopInterceptor;

impl CpuKernelInterceptor for NoopInterceptor {
    fn try_exec(
        &self,
        _ast: &LazyOp,
        _output: &LazyBuffer,
        _inputs: &[RawBuffer],
    ) -> Option<BackendResult<RawBuffer>> {
        None
    }
}

/// Interprets resolved operation trees over host memory.
///
/// Every intermediate is computed in `f64` and rounded to its node's dtype, so a fused tree
/// produces the same bytes as the equivalent chain of single-op kernels.
#[derive(Clone)]
pub struct GenericCpuBackend<I: CpuKernelInterceptor> {
    interceptor: Arc<I>,
    capabilities: BackendCapabilities,
}

impl<I: CpuKernelInterceptor> GenericCpuBackend<I> {
    pub fn with_interceptor(interceptor: I) -> Self {
        Self::with_arc(Arc::new(interceptor))
    }

    pub fn with_arc(interceptor: Arc<I>) -> Self {
        Self {
            interceptor,
            capabilities: BackendCapabilities::default(),
        }
    }

    /// Overrides the capabilities reported to the realizer.
    pub fn with_capabilities(mut self, capabilities: BackendCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn interceptor(&self) -> &I {
        self.interceptor.as_ref()
    }
}

impl GenericCpuBackend<NoopInterceptor> {
    pub fn new() -> Self {
        Self::with_interceptor(NoopInterceptor)
    }
}

impl Default for GenericCpuBackend<NoopInterceptor> {
    fn default() -> Self {
        Self::new()
    }
}

pub type CpuBackend = GenericCpuBackend<NoopInterceptor>;

impl<I: CpuKernelInterceptor> Backend for GenericCpuBackend<I> {
    fn backend_name(&self) -> &str {
        "cpu"
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    fn from_host(&self, array: &HostArray, args: &DeviceArgs) -> BackendResult<RawBuffer> {
        log::trace!(
            "cpu upload of {} {:?} element(s) {:?}",
            array.len(),
            array.dtype(),
            args
        );
        Ok(RawBuffer::host(array.data().clone()))
    }

    fn allocate(&self, len: usize, dtype: DType, args: &DeviceArgs) -> BackendResult<RawBuffer> {
        log::trace!("cpu allocation of {len} {dtype:?} element(s) {args:?}");
        Ok(RawBuffer::host(HostData::zeros(dtype, len)))
    }

    fn exec(
        &self,
        ast: &LazyOp,
        output: &LazyBuffer,
        inputs: &[RawBuffer],
        _args: &DeviceArgs,
    ) -> BackendResult<RawBuffer> {
        if let Some(result) = self.interceptor.try_exec(ast, output, inputs) {
            return result;
        }
        execute_tree(ast, output, inputs).map_err(|err| augment_backend_error(err, ast, output))
    }
}

fn augment_backend_error(error: BackendError, ast: &LazyOp, output: &LazyBuffer) -> BackendError {
    let location = format!(
        "while computing buf{} {} {:?} from {ast}",
        output.id(),
        output.shape(),
        output.dtype()
    );
    match error {
        BackendError::Execution { message } => BackendError::Execution {
            message: format!("{message} ({location})"),
        },
        BackendError::Unimplemented { op, reason } => BackendError::Unimplemented {
            op,
            reason: format!("{reason} ({location})"),
        },
    }
}

fn execute_tree(ast: &LazyOp, output: &LazyBuffer, inputs: &[RawBuffer]) -> BackendResult<RawBuffer> {
    let out_dims = static_dims(output.shape())?;
    let out_len: usize = out_dims.iter().product();
    let lanes = inputs
        .iter()
        .map(input_lanes)
        .collect::<BackendResult<Vec<_>>>()?;
    let program = compile(ast, inputs)?;
    let tree_len: usize = program.dims.iter().product();
    if tree_len != out_len {
        return Err(BackendError::execution(format!(
            "tree computes {tree_len} elements but the output holds {out_len}"
        )));
    }

    let mut values = Vec::with_capacity(out_len);
    for flat in 0..out_len {
        values.push(output.dtype().round_lane(program.eval(flat, &lanes)?));
    }
    Ok(RawBuffer::host(HostData::from_lanes(output.dtype(), &values)))
}

fn input_lanes(raw: &RawBuffer) -> BackendResult<Vec<f64>> {
    match raw.storage() {
        RawStorage::Const(value) => Ok(vec![*value]),
        RawStorage::Device(storage) => match raw.downcast_storage::<HostBuffer>() {
            Some(host) => Ok(host.data().to_lanes()),
            None => Ok(storage.read_to_host(raw.dtype())?.to_lanes()),
        },
    }
}

fn static_dims(shape: &Shape) -> BackendResult<Vec<usize>> {
    shape
        .static_dims()
        .ok_or_else(|| BackendError::unimplemented("exec", format!("symbolic shape {shape}")))
}

fn ravel(index: &[usize], dims: &[usize]) -> usize {
    index
        .iter()
        .zip(dims)
        .fold(0, |acc, (&pos, &dim)| acc * dim + pos)
}

enum Kind {
    Mem { input: usize, st: ShapeTracker },
    Const { value: f64, st: ShapeTracker },
    Unary(UnaryOp, Box<Node>),
    Binary(BinaryOp, Box<[Node; 2]>),
    Ternary(TernaryOp, Box<[Node; 3]>),
    Reduce {
        op: ReduceOp,
        reduced_axes: Vec<usize>,
        in_dims: Vec<usize>,
        src: Box<Node>,
    },
}

/// A tree node with its logical extent and the dtype its result is rounded to.
struct Node {
    kind: Kind,
    dims: Vec<usize>,
    dtype: DType,
}

fn compile(op: &LazyOp, inputs: &[RawBuffer]) -> BackendResult<Node> {
    let mut children = Vec::with_capacity(op.src().len());
    for src in op.src() {
        match src {
            OpSource::Op(child) => children.push(compile(child, inputs)?),
            OpSource::Buffer(buffer) => {
                return Err(BackendError::execution(format!(
                    "unresolved buffer leaf buf{}",
                    buffer.id()
                )))
            }
        }
    }
    let expect_arity = |n: usize| {
        if children.len() == n {
            Ok(())
        } else {
            Err(BackendError::execution(format!(
                "{} expects {n} source(s), got {}",
                op.op(),
                children.len()
            )))
        }
    };

    match op.op() {
        Opcode::Buffer(BufferOp::Mem) => {
            let OpArg::Mem(mem) = op.arg() else {
                return Err(BackendError::execution("MEM leaf without a slot descriptor"));
            };
            if mem.idx == 0 || mem.idx > inputs.len() {
                return Err(BackendError::execution(format!(
                    "MEM slot {} out of range for {} input(s)",
                    mem.idx,
                    inputs.len()
                )));
            }
            Ok(Node {
                dims: static_dims(mem.st.shape())?,
                dtype: mem.dtype,
                kind: Kind::Mem {
                    input: mem.idx - 1,
                    st: mem.st.clone(),
                },
            })
        }
        Opcode::Buffer(BufferOp::Const) => {
            let OpArg::Const(constant) = op.arg() else {
                return Err(BackendError::execution("CONST leaf without a value"));
            };
            Ok(Node {
                dims: static_dims(constant.st.shape())?,
                dtype: constant.dtype,
                kind: Kind::Const {
                    value: constant.value,
                    st: constant.st.clone(),
                },
            })
        }
        Opcode::Unary(unary) => {
            expect_arity(1)?;
            let src = children.pop().ok_or_else(|| BackendError::execution("missing source"))?;
            let dtype = match (unary, op.arg()) {
                (UnaryOp::Cast, OpArg::Cast(dtype)) => *dtype,
                (UnaryOp::Cast, _) => {
                    return Err(BackendError::execution("CAST without a target dtype"))
                }
                _ => src.dtype,
            };
            Ok(Node {
                dims: src.dims.clone(),
                dtype,
                kind: Kind::Unary(unary, Box::new(src)),
            })
        }
        Opcode::Binary(binary) => {
            expect_arity(2)?;
            let dims = children[0].dims.clone();
            let dtype = widest(&children);
            let [a, b]: [Node; 2] = children
                .try_into()
                .map_err(|_| BackendError::execution("binary op arity"))?;
            Ok(Node {
                dims,
                dtype,
                kind: Kind::Binary(binary, Box::new([a, b])),
            })
        }
        Opcode::Ternary(ternary) => {
            expect_arity(3)?;
            let dims = children[0].dims.clone();
            let dtype = widest(&children);
            let [a, b, c]: [Node; 3] = children
                .try_into()
                .map_err(|_| BackendError::execution("ternary op arity"))?;
            Ok(Node {
                dims,
                dtype,
                kind: Kind::Ternary(ternary, Box::new([a, b, c])),
            })
        }
        Opcode::Reduce(reduce) => {
            expect_arity(1)?;
            let src = children.pop().ok_or_else(|| BackendError::execution("missing source"))?;
            let out_shape = op
                .arg()
                .as_shape()
                .ok_or_else(|| BackendError::execution("reduce without an output shape"))?;
            let dims = static_dims(out_shape)?;
            if dims.len() != src.dims.len() {
                return Err(BackendError::execution(format!(
                    "reduce to {out_shape} from rank {}",
                    src.dims.len()
                )));
            }
            let reduced_axes = (0..dims.len()).filter(|&a| dims[a] != src.dims[a]).collect();
            Ok(Node {
                dtype: src.dtype,
                kind: Kind::Reduce {
                    op: reduce,
                    reduced_axes,
                    in_dims: src.dims.clone(),
                    src: Box::new(src),
                },
                dims,
            })
        }
        other => Err(BackendError::unimplemented(
            "exec",
            format!("{other} cannot appear in a kernel"),
        )),
    }
}

fn widest(nodes: &[Node]) -> DType {
    DType::widest(nodes.iter().map(|node| node.dtype)).unwrap_or(DType::F32)
}

impl Node {
    fn eval(&self, flat: usize, lanes: &[Vec<f64>]) -> BackendResult<f64> {
        let value = match &self.kind {
            Kind::Mem { input, st } => match st.real_offset(flat) {
                Some(offset) => *lanes[*input].get(offset).ok_or_else(|| {
                    BackendError::execution(format!(
                        "slot {} read at {offset} past its {} element(s)",
                        input + 1,
                        lanes[*input].len()
                    ))
                })?,
                None => 0.0,
            },
            Kind::Const { value, st } => match st.real_offset(flat) {
                Some(_) => *value,
                None => 0.0,
            },
            Kind::Unary(op, src) => {
                let x = src.eval(flat, lanes)?;
                match op {
                    UnaryOp::Noop | UnaryOp::Cast => x,
                    UnaryOp::Exp2 => x.exp2(),
                    UnaryOp::Log2 => x.log2(),
                    UnaryOp::Sin => x.sin(),
                    UnaryOp::Sqrt => x.sqrt(),
                    UnaryOp::Recip => 1.0 / x,
                    UnaryOp::Neg => -x,
                }
            }
            Kind::Binary(op, srcs) => {
                let x = srcs[0].eval(flat, lanes)?;
                let y = srcs[1].eval(flat, lanes)?;
                match op {
                    BinaryOp::Add => x + y,
                    BinaryOp::Sub => x - y,
                    BinaryOp::Mul => x * y,
                    BinaryOp::Div => x / y,
                    BinaryOp::Max => x.max(y),
                    BinaryOp::Mod => x % y,
                    BinaryOp::CmpLt => {
                        if x < y {
                            1.0
                        } else {
                            0.0
                        }
                    }
                }
            }
            Kind::Ternary(op, srcs) => {
                let a = srcs[0].eval(flat, lanes)?;
                match op {
                    TernaryOp::MulAcc => {
                        a * srcs[1].eval(flat, lanes)? + srcs[2].eval(flat, lanes)?
                    }
                    TernaryOp::Where => {
                        if a != 0.0 {
                            srcs[1].eval(flat, lanes)?
                        } else {
                            srcs[2].eval(flat, lanes)?
                        }
                    }
                }
            }
            Kind::Reduce {
                op,
                reduced_axes,
                in_dims,
                src,
            } => {
                let mut index = unravel(flat, &self.dims);
                let count: usize = reduced_axes.iter().map(|&axis| in_dims[axis]).product();
                let mut acc = match op {
                    ReduceOp::Sum => 0.0,
                    ReduceOp::Max => f64::NEG_INFINITY,
                };
                for step in 0..count {
                    let mut rem = step;
                    for &axis in reduced_axes.iter().rev() {
                        index[axis] = rem % in_dims[axis];
                        rem /= in_dims[axis];
                    }
                    let x = src.eval(ravel(&index, in_dims), lanes)?;
                    acc = match op {
                        ReduceOp::Sum => acc + x,
                        ReduceOp::Max => acc.max(x),
                    };
                }
                acc
            }
        };
        Ok(self.dtype.round_lane(value))
    }
}

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use anyhow::Result;
use smallvec::SmallVec;

use super::config::LazyConfig;
use super::realize;
use super::schedule::{self, ScheduleItem};
use crate::backend::{backend_for_device, device_args, RawBuffer};
use crate::error::LazyError;
use crate::ops::{CustomLoader, LazyOp, LoadOp, OpArg, OpSource, Opcode, ReduceOp, UnaryOp};
use crate::tensor::{DType, Dimension, HostArray, Shape};
use crate::view::ShapeTracker;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide identity of a buffer node. Views get their own id; a base handle carries the
/// id of its base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    fn next() -> Self {
        BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Non-owning reference to a reader of a base.
enum ConsumerRef {
    Base(Weak<BaseNode>),
    View(Weak<BufferNode>),
}

impl ConsumerRef {
    fn is_live(&self) -> bool {
        match self {
            ConsumerRef::Base(node) => node.strong_count() > 0,
            ConsumerRef::View(node) => node.strong_count() > 0,
        }
    }
}

/// The part of a tensor that owns the operation and the realized result.
pub(crate) struct BaseNode {
    pub(crate) id: BufferId,
    pub(crate) st: ShapeTracker,
    pub(crate) dtype: DType,
    pub(crate) device: String,
    pub(crate) config: LazyConfig,
    pub(crate) op: Option<LazyOp>,
    pub(crate) realized: OnceLock<RawBuffer>,
    pub(crate) realize_guard: Mutex<()>,
    consumers: Mutex<HashMap<BufferId, ConsumerRef>>,
}

impl BaseNode {
    fn register_consumer(&self, id: BufferId, consumer: ConsumerRef) {
        let mut consumers = self.consumers.lock().expect("consumer set poisoned");
        consumers.retain(|_, existing| existing.is_live());
        consumers.insert(id, consumer);
    }

    fn live_consumers_except(&self, except: Option<BufferId>) -> usize {
        self.consumers
            .lock()
            .expect("consumer set poisoned")
            .iter()
            .filter(|(id, consumer)| Some(**id) != except && consumer.is_live())
            .count()
    }
}

struct BufferNode {
    id: BufferId,
    st: ShapeTracker,
    base: Arc<BaseNode>,
}

/// Handle on a deferred tensor value. Cloning is cheap and preserves identity.
///
/// A handle is either a base (it owns an operation and, once realized, its result) or a view:
/// a [`ShapeTracker`] over some base's storage produced by a movement operation.
#[derive(Clone)]
pub struct LazyBuffer {
    node: Arc<BufferNode>,
}

impl LazyBuffer {
    fn new_base(
        op: Option<LazyOp>,
        shape: Shape,
        dtype: DType,
        device: &str,
        config: LazyConfig,
        realized: Option<RawBuffer>,
    ) -> LazyBuffer {
        let st = ShapeTracker::from_shape(&shape);
        let realized_slot = OnceLock::new();
        if let Some(raw) = realized {
            let _ = realized_slot.set(raw);
        }
        let base = Arc::new(BaseNode {
            id: BufferId::next(),
            st: st.clone(),
            dtype,
            device: device.to_string(),
            config,
            op,
            realized: realized_slot,
            realize_guard: Mutex::new(()),
            consumers: Mutex::new(HashMap::new()),
        });
        if let Some(op) = &base.op {
            for leaf in op.buffers() {
                leaf.node
                    .base
                    .register_consumer(base.id, ConsumerRef::Base(Arc::downgrade(&base)));
            }
        }
        LazyBuffer {
            node: Arc::new(BufferNode {
                id: base.id,
                st,
                base,
            }),
        }
    }

    /// Uploads `array` to `device`; the result is an already-realized base with no operation.
    pub fn from_host(array: &HostArray, device: &str, config: LazyConfig) -> Result<LazyBuffer> {
        let backend = backend_for_device(device)?;
        let raw = backend
            .from_host(array, &device_args(device))
            .map_err(|err| LazyError::backend(backend.backend_name(), err))?;
        Ok(Self::new_base(
            None,
            Shape::from_static(array.shape()),
            array.dtype(),
            device,
            config,
            Some(raw),
        ))
    }

    /// Creates a base whose operation is the load `kind`.
    pub fn loadop(
        kind: LoadOp,
        shape: impl Into<Shape>,
        dtype: DType,
        device: &str,
        arg: OpArg,
        sources: &[LazyBuffer],
        config: LazyConfig,
    ) -> Result<LazyBuffer> {
        if let Some(expected) = Opcode::Load(kind).arity() {
            if expected != sources.len() {
                return Err(LazyError::invariant(format!(
                    "{} load takes {expected} source(s), got {}",
                    Opcode::Load(kind),
                    sources.len()
                ))
                .into());
            }
        }
        let op = LazyOp::new(kind, sources.iter(), arg);
        Ok(Self::new_base(
            Some(op),
            shape.into(),
            dtype,
            device,
            config,
            None,
        ))
    }

    /// Scalar `value` broadcast to `shape` through a rank-0 `CONST` load.
    pub fn constant(
        value: f64,
        shape: impl Into<Shape>,
        dtype: DType,
        device: &str,
        config: LazyConfig,
    ) -> Result<LazyBuffer> {
        let shape = shape.into();
        let scalar = Self::loadop(
            LoadOp::Const,
            Shape::scalar(),
            dtype,
            device,
            OpArg::Scalar(value),
            &[],
            config,
        )?;
        let ones = Shape::from_static(&vec![1; shape.rank()]);
        scalar.reshape(ones)?.expand(shape)
    }

    /// `value` broadcast to this buffer's shape, dtype and device.
    pub fn const_like(&self, value: f64) -> Result<LazyBuffer> {
        Self::constant(
            value,
            self.shape().clone(),
            self.dtype(),
            self.device(),
            self.config(),
        )
    }

    pub fn empty(
        shape: impl Into<Shape>,
        dtype: DType,
        device: &str,
        config: LazyConfig,
    ) -> Result<LazyBuffer> {
        Self::loadop(LoadOp::Empty, shape, dtype, device, OpArg::None, &[], config)
    }

    /// Uniform `[0, 1)` samples drawn from a generator seeded with `seed`.
    pub fn rand(
        shape: impl Into<Shape>,
        dtype: DType,
        device: &str,
        seed: u64,
        config: LazyConfig,
    ) -> Result<LazyBuffer> {
        Self::loadop(LoadOp::Rand, shape, dtype, device, OpArg::Seed(seed), &[], config)
    }

    /// A base produced by `loader` from the buffer and its realized `sources`.
    pub fn custom(
        shape: impl Into<Shape>,
        dtype: DType,
        device: &str,
        sources: &[LazyBuffer],
        loader: CustomLoader,
        config: LazyConfig,
    ) -> Result<LazyBuffer> {
        Self::loadop(
            LoadOp::Custom,
            shape,
            dtype,
            device,
            OpArg::Custom(loader),
            sources,
            config,
        )
    }

    /// Copy of this buffer on `device`.
    pub fn copy_to(&self, device: &str) -> Result<LazyBuffer> {
        Self::loadop(
            LoadOp::From,
            self.shape().clone(),
            self.dtype(),
            device,
            OpArg::None,
            std::slice::from_ref(self),
            self.config(),
        )
    }

    pub fn id(&self) -> BufferId {
        self.node.id
    }

    pub fn st(&self) -> &ShapeTracker {
        &self.node.st
    }

    pub fn shape(&self) -> &Shape {
        self.node.st.shape()
    }

    pub fn dtype(&self) -> DType {
        self.node.base.dtype
    }

    pub fn device(&self) -> &str {
        &self.node.base.device
    }

    pub fn config(&self) -> LazyConfig {
        self.node.base.config
    }

    pub fn is_base(&self) -> bool {
        self.node.id == self.node.base.id
    }

    /// Handle on the base this buffer reads. Same identity as the base itself.
    pub fn base(&self) -> LazyBuffer {
        if self.is_base() {
            return self.clone();
        }
        let base = Arc::clone(&self.node.base);
        LazyBuffer {
            node: Arc::new(BufferNode {
                id: base.id,
                st: base.st.clone(),
                base,
            }),
        }
    }

    pub(crate) fn base_node(&self) -> &Arc<BaseNode> {
        &self.node.base
    }

    /// The base's operation.
    pub fn op(&self) -> Option<&LazyOp> {
        self.node.base.op.as_ref()
    }

    /// The base's realized result.
    pub fn realized(&self) -> Option<&RawBuffer> {
        self.node.base.realized.get()
    }

    pub fn is_realized(&self) -> bool {
        self.realized().is_some()
    }

    /// A dense view covering exactly the base's storage.
    pub fn is_contiguous(&self) -> bool {
        self.node.st.contiguous() && self.node.base.st.size() == self.node.st.size()
    }

    /// Live readers of the base (operations and views), including this handle when it is a view.
    pub fn consumer_count(&self) -> usize {
        self.node.base.live_consumers_except(None)
    }

    /// Live readers of the base other than this handle.
    pub(crate) fn other_consumers(&self) -> usize {
        self.node.base.live_consumers_except(Some(self.node.id))
    }

    fn movement(&self, st: ShapeTracker) -> LazyBuffer {
        if &st == self.st() {
            return self.clone();
        }
        let base = Arc::clone(&self.node.base);
        let node = Arc::new(BufferNode {
            id: BufferId::next(),
            st,
            base,
        });
        node.base
            .register_consumer(node.id, ConsumerRef::View(Arc::downgrade(&node)));
        LazyBuffer { node }
    }

    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<LazyBuffer> {
        Ok(self.movement(self.st().reshape(&shape.into())?))
    }

    pub fn permute(&self, axes: &[usize]) -> Result<LazyBuffer> {
        Ok(self.movement(self.st().permute(axes)?))
    }

    pub fn expand(&self, shape: impl Into<Shape>) -> Result<LazyBuffer> {
        Ok(self.movement(self.st().expand(&shape.into())?))
    }

    pub fn shrink(&self, arg: &[(usize, usize)]) -> Result<LazyBuffer> {
        Ok(self.movement(self.st().shrink(arg)?))
    }

    pub fn stride(&self, mul: &[isize]) -> Result<LazyBuffer> {
        Ok(self.movement(self.st().stride(mul)?))
    }

    pub fn pad(&self, arg: &[(usize, usize)]) -> Result<LazyBuffer> {
        Ok(self.movement(self.st().pad(arg)?))
    }

    /// Returns `self` when it already covers its base densely, otherwise a new base that
    /// materializes this view.
    pub fn contiguous(&self) -> LazyBuffer {
        if self.is_contiguous() {
            return self.clone();
        }
        Self::new_base(
            Some(LazyOp::new(LoadOp::Contiguous, [self], OpArg::None)),
            self.shape().clone(),
            self.dtype(),
            self.device(),
            self.config(),
            None,
        )
    }

    /// Elementwise `op` over `self` and `others`.
    ///
    /// Operands that are unrealized, dense, elementwise, and read by nobody else are inlined as
    /// operation trees when the config merges elementwise ops.
    pub fn e(&self, op: impl Into<Opcode>, others: &[&LazyBuffer], arg: OpArg) -> Result<LazyBuffer> {
        let op = op.into();
        if !op.is_elementwise() {
            return Err(LazyError::invariant(format!("{op} is not an elementwise op")).into());
        }
        let mut srcs: SmallVec<[&LazyBuffer; 3]> = SmallVec::new();
        srcs.push(self);
        srcs.extend(others.iter().copied());
        if op.arity() != Some(srcs.len()) {
            return Err(LazyError::invariant(format!(
                "{op} takes {:?} operand(s), got {}",
                op.arity(),
                srcs.len()
            ))
            .into());
        }
        if let Some(mismatch) = srcs.iter().find(|src| src.shape() != self.shape()) {
            return Err(LazyError::invariant(format!(
                "{op} operand shape {} does not match {}",
                mismatch.shape(),
                self.shape()
            ))
            .into());
        }

        let out_dtype = if op == Opcode::Unary(UnaryOp::Cast) {
            match &arg {
                OpArg::Cast(dtype) => *dtype,
                _ => return Err(LazyError::invariant("CAST needs a target dtype").into()),
            }
        } else {
            DType::widest(srcs.iter().map(|src| src.dtype())).unwrap_or(self.dtype())
        };

        let merge = self.config().fusion.merges_elementwise();
        let mut sources: SmallVec<[OpSource; 3]> = SmallVec::new();
        for src in &srcs {
            sources.push(if merge && src.inlinable() {
                src.inline_op()?
            } else {
                OpSource::Buffer((*src).clone())
            });
        }

        Ok(Self::new_base(
            Some(LazyOp::new(op, sources, arg)),
            self.shape().clone(),
            out_dtype,
            self.device(),
            self.config(),
            None,
        ))
    }

    fn inlinable(&self) -> bool {
        !self.is_realized()
            && self.is_contiguous()
            && self.op().is_some_and(|op| op.op().is_elementwise())
            && self.other_consumers() == 0
    }

    /// The base's operation, expressed in this view's shape.
    fn inline_op(&self) -> Result<OpSource> {
        let op = self
            .op()
            .ok_or_else(|| LazyError::invariant("inlined buffer has no operation"))?;
        if self.shape() == self.node.base.st.shape() {
            return Ok(OpSource::Op(op.clone()));
        }
        let mut mapping = HashMap::new();
        for leaf in op.buffers() {
            let reshaped = leaf.reshape(self.shape().clone())?;
            mapping.insert(leaf.id(), OpSource::Buffer(reshaped));
        }
        Ok(OpSource::Op(op.substitute(&mapping)))
    }

    fn reduce_op(&self, op: ReduceOp, new_shape: &Shape) -> LazyBuffer {
        if new_shape == self.shape() {
            return self.clone();
        }
        Self::new_base(
            Some(LazyOp::new(op, [self], OpArg::Shape(new_shape.clone()))),
            new_shape.clone(),
            self.dtype(),
            self.device(),
            self.config(),
            None,
        )
    }

    /// Reduces every axis where `new_shape` has extent 1 and `self` does not.
    ///
    /// Large reductions are split into two passes over an axis chosen by
    /// [`super::config::SplitReducePolicy`].
    pub fn r(&self, op: ReduceOp, new_shape: impl Into<Shape>) -> Result<LazyBuffer> {
        let new_shape = new_shape.into();
        if new_shape.rank() != self.shape().rank() {
            return Err(LazyError::invariant(format!(
                "reduce output {} must keep the rank of {}",
                new_shape,
                self.shape()
            ))
            .into());
        }
        for (old, new) in self.shape().dims().iter().zip(new_shape.dims()) {
            if old != new && *new != Dimension::Static(1) {
                return Err(LazyError::invariant(format!(
                    "cannot reduce {} to {}",
                    self.shape(),
                    new_shape
                ))
                .into());
            }
        }
        if new_shape == *self.shape() {
            return Ok(self.clone());
        }

        let (old_dims, new_dims) = match (self.shape().static_dims(), new_shape.static_dims()) {
            (Some(old), Some(new)) => (old, new),
            _ => return Ok(self.reduce_op(op, &new_shape)),
        };
        let policy = self.config().split;
        let out_elements: usize = new_dims.iter().product();
        if out_elements == 0 || old_dims.iter().product::<usize>() / out_elements < policy.min_work
        {
            return Ok(self.reduce_op(op, &new_shape));
        }

        let strides = self.st().real_strides();
        let best = old_dims
            .iter()
            .zip(&new_dims)
            .zip(&strides)
            .enumerate()
            .filter(|(_, ((old, new), _))| old != new)
            .map(|(axis, ((&old, _), stride))| {
                let divisor = gcd(256, old);
                let score = match stride {
                    Some(stride) if *stride != 0 => divisor as f64 / *stride as f64,
                    _ => 0.0,
                };
                (score, divisor, axis)
            })
            .max_by(|a, b| {
                a.0.total_cmp(&b.0)
                    .then(a.1.cmp(&b.1))
                    .then(a.2.cmp(&b.2))
            });
        let Some((score, divisor, axis)) = best else {
            return Ok(self.reduce_op(op, &new_shape));
        };
        if divisor < policy.min_divisor || score < policy.min_score {
            return Ok(self.reduce_op(op, &new_shape));
        }

        log::trace!(
            "splitting {} reduce of {} on axis {axis} by {divisor}",
            Opcode::Reduce(op),
            self.shape()
        );
        let split = |inner: &[usize]| -> Shape {
            let mut dims = old_dims[..axis].to_vec();
            dims.push(old_dims[axis] / divisor);
            dims.extend_from_slice(inner);
            dims.extend_from_slice(&old_dims[axis + 1..]);
            Shape::from_static(&dims)
        };
        let first = self.reshape(split(&[divisor]))?.reduce_op(op, &split(&[1]));
        Ok(first.reshape(split(&[]))?.reduce_op(op, &new_shape))
    }

    /// Ordered units that materialize this buffer's base.
    pub fn schedule(&self) -> Result<Vec<ScheduleItem>> {
        schedule::schedule(self)
    }

    /// Materializes the base (memoized) and returns its result.
    pub fn realize(&self) -> Result<RawBuffer> {
        realize::realize(self)
    }

    /// Realizes a dense copy of this view and reads it back.
    pub fn to_host(&self) -> Result<HostArray> {
        let dims = self.shape().static_dims().ok_or_else(|| {
            LazyError::unsupported_shape(self.shape(), "reading back needs static dimensions")
        })?;
        let raw = self.contiguous().realize()?;
        raw.to_host(&dims)
    }
}

impl fmt::Debug for LazyBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("LazyBuffer");
        s.field("id", &self.id())
            .field("shape", &format_args!("{}", self.shape()))
            .field("dtype", &self.dtype())
            .field("device", &self.device());
        if !self.is_base() {
            s.field("base", &self.node.base.id);
        }
        match (self.realized(), self.op()) {
            (Some(raw), _) => s.field("realized", &raw.len()),
            (None, Some(op)) => s.field("op", &op.op()),
            (None, None) => s.field("op", &"none"),
        };
        s.finish()
    }
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

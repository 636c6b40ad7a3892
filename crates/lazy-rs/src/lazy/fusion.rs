//! Schedule-time rewrites that fold producers into the kernel of their consumer, and the final
//! pass that replaces buffer leaves with backend-facing slot references.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use smallvec::SmallVec;

use super::buffer::LazyBuffer;
use super::config::FusionLevel;
use crate::backend::RawBuffer;
use crate::error::LazyError;
use crate::ops::{BufferOp, ConstBuffer, LazyOp, LoadOp, MemBuffer, OpArg, OpSource, Opcode};
use crate::tensor::Shape;

fn is_const_load(buffer: &LazyBuffer) -> bool {
    buffer
        .op()
        .is_some_and(|op| op.op() == Opcode::Load(LoadOp::Const))
}

/// Scalar of a leaf whose base already realized to a folded constant.
fn folded_value(buffer: &LazyBuffer) -> Option<f64> {
    buffer.realized().and_then(RawBuffer::as_constant)
}

/// Folds the elementwise producer of a reduce's input into the reduce.
///
/// The input must be unrealized, read the producer's storage unchanged (the base itself or a view
/// with the base's exact tracker), and have no reader besides this reduce.
pub fn absorb_into_reduce(op: &LazyOp, fusion: FusionLevel) -> LazyOp {
    if !fusion.merges_elementwise() {
        return op.clone();
    }
    let Some(src) = op.src().first().and_then(OpSource::as_buffer) else {
        return op.clone();
    };
    if src.is_realized() || src.st() != &src.base_node().st || src.other_consumers() > 1 {
        return op.clone();
    }
    match src.op() {
        Some(producer) if producer.op().is_elementwise() => {
            LazyOp::new(op.op(), [OpSource::Op(producer.clone())], op.arg().clone())
        }
        _ => op.clone(),
    }
}

/// Folds at most one upstream reduce (and the elementwise op feeding it) into an elementwise tree.
///
/// When the absorbed reduce was reshaped before being read, the tree is evaluated in the reduce's
/// output shape and every other leaf is reshaped to match; the kernel output is the same elements
/// in `output_shape`.
pub fn absorb_into_elementwise(
    op: &LazyOp,
    output_shape: &Shape,
    fusion: FusionLevel,
) -> Result<LazyOp> {
    let leaves = op.buffers();
    let candidates: SmallVec<[&LazyBuffer; 2]> = leaves
        .iter()
        .filter(|leaf| {
            !leaf.is_realized()
                && leaf.is_contiguous()
                && leaf.op().is_some_and(|op| op.op().is_reduce())
                && leaf.other_consumers() <= 1
        })
        .collect();

    let mut mapping: HashMap<_, OpSource> = HashMap::new();
    let mut intermediate = output_shape.clone();
    if let (true, Some(reduced)) = (fusion.merges_one_reduce(), candidates.first()) {
        let reduce = reduced
            .op()
            .ok_or_else(|| LazyError::invariant("reduce candidate lost its operation"))?;
        let top = absorb_into_reduce(reduce, fusion);
        let base_shape = reduced.base_node().st.shape();
        if reduced.shape() != base_shape {
            if reduced.shape() != output_shape {
                return Err(LazyError::invariant(format!(
                    "absorbed reduce is read as {} but the kernel writes {}",
                    reduced.shape(),
                    output_shape
                ))
                .into());
            }
            intermediate = base_shape.clone();
        }
        mapping.insert(reduced.id(), OpSource::Op(top));
    }

    for leaf in &leaves {
        if !mapping.contains_key(&leaf.id()) {
            mapping.insert(leaf.id(), OpSource::Buffer(leaf.reshape(intermediate.clone())?));
        }
    }
    Ok(op.substitute(&mapping))
}

/// Replaces buffer leaves with `CONST` literals and `MEM` slot references.
///
/// Returns the resolved tree and the bases backing slots `1..`, in slot order. Several views of
/// one base share a slot. Constant loads and bases realized to a folded constant never get one.
pub fn resolve_buffer_slots(op: &LazyOp) -> Result<(LazyOp, Vec<LazyBuffer>)> {
    let leaves = op.buffers();
    let inlined = |leaf: &LazyBuffer| is_const_load(leaf) || folded_value(leaf).is_some();
    let mut slots: Vec<LazyBuffer> = Vec::new();
    let mut seen = HashSet::new();
    for leaf in &leaves {
        if !inlined(leaf) && seen.insert(leaf.base().id()) {
            slots.push(leaf.base());
        }
    }

    let mut mapping = HashMap::new();
    for leaf in &leaves {
        let resolved = if inlined(leaf) {
            let value = folded_value(leaf)
                .or_else(|| leaf.op().and_then(|op| op.arg().as_scalar()))
                .ok_or_else(|| {
                    LazyError::UnhandledBufferKind(format!(
                        "constant {leaf:?} carries no scalar value"
                    ))
                })?;
            LazyOp::leaf(
                BufferOp::Const,
                OpArg::Const(ConstBuffer {
                    value,
                    dtype: leaf.dtype(),
                    st: leaf.st().simplify(),
                }),
            )
        } else if leaf.op().is_none() && !leaf.is_realized() {
            return Err(LazyError::UnhandledBufferKind(format!(
                "{leaf:?} has neither an operation nor a result"
            ))
            .into());
        } else {
            let base_id = leaf.base().id();
            let position = slots
                .iter()
                .position(|slot| slot.id() == base_id)
                .ok_or_else(|| LazyError::invariant(format!("no slot for {leaf:?}")))?;
            LazyOp::leaf(
                BufferOp::Mem,
                OpArg::Mem(MemBuffer {
                    idx: position + 1,
                    dtype: leaf.dtype(),
                    st: leaf.st().simplify(),
                }),
            )
        };
        mapping.insert(leaf.id(), OpSource::Op(resolved));
    }
    Ok((op.substitute(&mapping), slots))
}

use std::collections::HashSet;

use anyhow::Result;

use super::buffer::{BufferId, LazyBuffer};
use super::fusion::{absorb_into_elementwise, absorb_into_reduce, resolve_buffer_slots};
use crate::error::LazyError;
use crate::ops::{LazyOp, LoadOp, OpArg, Opcode, UnaryOp};

/// One unit of work: a load, or a kernel producing `out` from realized inputs.
#[derive(Debug, Clone)]
pub struct ScheduleItem {
    /// Load op as constructed, or the fused and slot-resolved kernel tree.
    pub ast: LazyOp,
    /// Base buffer the unit realizes.
    pub out: LazyBuffer,
    /// Leaf buffers the kernel reads. Empty for loads.
    pub inputs: Vec<LazyBuffer>,
    /// Bases backing `MEM` slots `1..`, in slot order. Empty for loads.
    pub slots: Vec<LazyBuffer>,
    /// Fused tree before slot resolution, re-resolved when an input folds to a constant.
    pub(crate) fused: LazyOp,
}

impl ScheduleItem {
    pub fn is_load(&self) -> bool {
        self.ast.op().is_load()
    }
}

/// Orders the units needed to realize `buffer`'s base: dependencies first, each base once.
pub(crate) fn schedule(buffer: &LazyBuffer) -> Result<Vec<ScheduleItem>> {
    let mut seen = HashSet::new();
    let mut items = Vec::new();
    visit(&buffer.base(), &mut seen, &mut items)?;
    Ok(items)
}

fn visit(
    base: &LazyBuffer,
    seen: &mut HashSet<BufferId>,
    items: &mut Vec<ScheduleItem>,
) -> Result<()> {
    if base.is_realized() || !seen.insert(base.id()) {
        return Ok(());
    }
    let item = lower(base)?;
    for input in &item.inputs {
        if !input.is_realized() {
            visit(&input.base(), seen, items)?;
        }
    }
    items.push(item);
    Ok(())
}

fn lower(base: &LazyBuffer) -> Result<ScheduleItem> {
    let op = base.op().ok_or_else(|| {
        LazyError::invariant(format!("unrealized base {base:?} has no operation"))
    })?;
    let op = if op.op() == Opcode::Load(LoadOp::Contiguous) {
        LazyOp::new(UnaryOp::Noop, op.src().iter().cloned(), OpArg::None)
    } else {
        op.clone()
    };

    if op.op().is_load() {
        return Ok(ScheduleItem {
            ast: op.clone(),
            out: base.clone(),
            inputs: Vec::new(),
            slots: Vec::new(),
            fused: op,
        });
    }

    let fusion = base.config().fusion;
    let absorbed = match op.op() {
        code if code.is_elementwise() => absorb_into_elementwise(&op, base.shape(), fusion)?,
        Opcode::Reduce(_) => absorb_into_reduce(&op, fusion),
        code => {
            return Err(LazyError::invariant(format!(
                "{code} cannot be the operation of a buffer"
            ))
            .into())
        }
    };
    let inputs = absorbed.buffers();
    let (ast, slots) = resolve_buffer_slots(&absorbed)?;
    log::trace!("scheduled buf{} <- {}", base.id(), ast);
    Ok(ScheduleItem {
        ast,
        out: base.clone(),
        inputs,
        slots,
        fused: absorbed,
    })
}

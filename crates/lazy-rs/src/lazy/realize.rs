use std::sync::{Arc, PoisonError};
use std::time::Instant;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::buffer::LazyBuffer;
use super::fusion::resolve_buffer_slots;
use super::schedule::ScheduleItem;
use crate::backend::{backend_for_device, device_args, Backend, DeviceArgs, RawBuffer};
use crate::error::LazyError;
use crate::ops::trace::{self, UnitContext, UnitKind, UnitStats, UnitStatus};
use crate::ops::{LoadOp, OpArg, Opcode};
use crate::tensor::HostArray;

pub(crate) fn realize(buffer: &LazyBuffer) -> Result<RawBuffer> {
    if let Some(raw) = buffer.realized() {
        return Ok(raw.clone());
    }
    let items = buffer.schedule()?;
    log::debug!(
        "realizing buf{} on {} in {} unit(s)",
        buffer.base().id(),
        buffer.device(),
        items.len()
    );
    for item in &items {
        run_item(item)?;
    }
    buffer.realized().cloned().ok_or_else(|| {
        LazyError::invariant(format!("schedule left {buffer:?} unrealized")).into()
    })
}

fn run_item(item: &ScheduleItem) -> Result<()> {
    let base = item.out.base_node();
    // A panicking loader poisons the guard without setting `realized`, so the re-check holds.
    let _guard = base
        .realize_guard
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if base.realized.get().is_some() {
        return Ok(());
    }

    let context = UnitContext {
        trace_id: trace::next_trace_id(),
        output: item.out.id(),
        device: item.out.device().to_string(),
        kind: match item.ast.op() {
            Opcode::Load(kind) => UnitKind::Load(kind),
            _ => UnitKind::Compute,
        },
        num_inputs: item.slots.len(),
    };
    let sink = trace::current_sink();
    if let Some(sink) = &sink {
        sink.before_unit(&context, &item.ast);
    }
    let started = Instant::now();
    let result = execute(item);
    if let Some(sink) = &sink {
        let status = match &result {
            Ok(_) => UnitStatus::Success,
            Err(err) => UnitStatus::Failure {
                message: format!("{err:#}"),
            },
        };
        sink.after_unit(
            &context,
            &UnitStats {
                elapsed: started.elapsed(),
                status,
            },
        );
    }

    let raw = result?;
    base.realized.set(raw).map_err(|_| {
        LazyError::invariant(format!("buf{} was realized twice", item.out.id()))
    })?;
    Ok(())
}

fn execute(item: &ScheduleItem) -> Result<RawBuffer> {
    let out = &item.out;
    let backend = backend_for_device(out.device())?;
    let args = device_args(out.device());
    if let Opcode::Load(kind) = item.ast.op() {
        return load(kind, item, &backend, &args);
    }

    // Slot bases realized after scheduling may have folded to constants; those are inlined.
    let late;
    let (ast, slots) = if item
        .slots
        .iter()
        .any(|slot| slot.realized().is_some_and(|raw| !raw.is_kernel_arg()))
    {
        late = resolve_buffer_slots(&item.fused)?;
        log::trace!("re-resolved buf{} <- {}", out.id(), late.0);
        (&late.0, &late.1)
    } else {
        (&item.ast, &item.slots)
    };

    let inputs = slots
        .iter()
        .map(|slot| -> Result<RawBuffer> {
            let raw = slot.realized().ok_or_else(|| {
                LazyError::invariant(format!("input {slot:?} of buf{} is unrealized", out.id()))
            })?;
            if !raw.is_kernel_arg() {
                return Err(LazyError::invariant(format!(
                    "input {slot:?} of buf{} is not a kernel argument",
                    out.id()
                ))
                .into());
            }
            Ok(raw.clone())
        })
        .collect::<Result<Vec<_>>>()?;
    log::debug!("exec buf{} on {}: {}", out.id(), out.device(), ast);
    backend
        .exec(ast, out, &inputs, &args)
        .map_err(|err| LazyError::backend(backend.backend_name(), err).into())
}

fn static_len(buffer: &LazyBuffer, what: &str) -> Result<Vec<usize>> {
    buffer.shape().static_dims().ok_or_else(|| {
        LazyError::unsupported_shape(buffer.shape(), format!("{what} needs static dimensions"))
            .into()
    })
}

fn upload(backend: &Arc<dyn Backend>, array: &HostArray, args: &DeviceArgs) -> Result<RawBuffer> {
    backend
        .from_host(array, args)
        .map_err(|err| LazyError::backend(backend.backend_name(), err).into())
}

fn load(
    kind: LoadOp,
    item: &ScheduleItem,
    backend: &Arc<dyn Backend>,
    args: &DeviceArgs,
) -> Result<RawBuffer> {
    let out = &item.out;
    match kind {
        LoadOp::Empty => {
            let dims = static_len(out, "EMPTY")?;
            backend
                .allocate(dims.iter().product(), out.dtype(), args)
                .map_err(|err| LazyError::backend(backend.backend_name(), err).into())
        }
        LoadOp::Rand => {
            let dims = static_len(out, "RAND")?;
            let seed = match item.ast.arg() {
                OpArg::Seed(seed) => *seed,
                other => {
                    return Err(LazyError::invariant(format!(
                        "RAND load needs a seed, got {other:?}"
                    ))
                    .into())
                }
            };
            let mut rng = StdRng::seed_from_u64(seed);
            let len: usize = dims.iter().product();
            let lanes: Vec<f64> = (0..len).map(|_| rng.gen::<f32>() as f64).collect();
            upload(backend, &HostArray::from_lanes(dims, out.dtype(), &lanes)?, args)
        }
        LoadOp::Const => {
            let value = item.ast.arg().as_scalar().ok_or_else(|| {
                LazyError::UnhandledBufferKind(format!("constant {out:?} carries no scalar value"))
            })?;
            if backend.capabilities().folds_constants() {
                Ok(RawBuffer::constant(value, out.dtype()))
            } else {
                upload(backend, &HostArray::scalar(out.dtype(), value), args)
            }
        }
        LoadOp::From => {
            let src = item
                .ast
                .src()
                .first()
                .and_then(|src| src.as_buffer())
                .ok_or_else(|| LazyError::invariant("FROM load has no source buffer"))?;
            let host = src.to_host()?;
            log::debug!(
                "copy {} <- {} size {} dtype {:?}",
                out.device(),
                src.device(),
                host.len(),
                host.dtype()
            );
            upload(backend, &host, args)
        }
        LoadOp::Custom => {
            let OpArg::Custom(loader) = item.ast.arg() else {
                return Err(LazyError::invariant("CUSTOM load has no loader").into());
            };
            let sources = item
                .ast
                .src()
                .iter()
                .filter_map(|src| src.as_buffer().cloned())
                .collect::<Vec<_>>();
            for source in &sources {
                source.realize()?;
            }
            loader.call(out, &sources)
        }
        LoadOp::Contiguous => Err(LazyError::invariant(
            "CONTIGUOUS reached the realizer without being lowered",
        )
        .into()),
    }
}

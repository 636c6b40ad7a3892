use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use lazy_rs::backend::registry::register_backend;
use lazy_rs::backend::spec::{Backend, BackendCapabilities};
use lazy_rs::ops::trace::{
    install_global_sink, ExecutionTraceSink, UnitContext, UnitKind, UnitStats, UnitStatus,
};
use lazy_rs::ops::{BinaryOp, CustomLoader, LazyOp, LoadOp, OpArg, UnaryOp};
use lazy_rs::tensor::{Dimension, HostData};
use lazy_rs::{BufferId, DType, LazyBuffer, LazyConfig, LazyError, RawBuffer, Shape};


use lazy_support::{
    compute_items, counting_device, host_f32, host_f32_on, init, read_f32, CountingBackend, CPU,
};

fn symbolic(name: &str) -> Shape {
    Shape::new(vec![Dimension::symbol(name), Dimension::Static(2)])
}

#[test]
fn folded_constants_carry_no_storage() -> Result<()> {
    init();
    let three = LazyBuffer::constant(3.0, [4], DType::F32, CPU, LazyConfig::default())?;
    let raw = three.realize()?;
    assert_eq!(raw.as_constant(), Some(3.0));
    assert!(!raw.is_kernel_arg());
    assert_eq!(raw.len(), 1);
    assert!(three.base().is_realized());

    assert_eq!(read_f32(&three)?, vec![3.0; 4]);
    Ok(())
}

#[test]
fn constants_are_uploaded_when_the_backend_cannot_fold_them() -> Result<()> {
    init();
    let backend = Arc::new(CountingBackend::with_capabilities(BackendCapabilities {
        compiled: false,
        non_finite_const_folding: true,
    }));
    register_backend("cpu-nofold", backend.clone() as Arc<dyn Backend>);

    let three =
        LazyBuffer::constant(3.0, [4], DType::F32, "cpu-nofold", LazyConfig::default())?;
    let raw = three.realize()?;
    assert_eq!(raw.as_constant(), None);
    assert!(raw.is_kernel_arg());
    assert_eq!(raw.len(), 1);
    assert_eq!(backend.uploads(), 1);

    assert_eq!(read_f32(&three)?, vec![3.0; 4]);
    Ok(())
}

#[test]
fn rand_is_deterministic_per_seed() -> Result<()> {
    init();
    let draw = |seed: u64| -> Result<Vec<f32>> {
        read_f32(&LazyBuffer::rand(
            [16],
            DType::F32,
            CPU,
            seed,
            LazyConfig::default(),
        )?)
    };
    let first = draw(7)?;
    assert_eq!(first, draw(7)?);
    assert_ne!(first, draw(8)?);
    assert!(first.iter().all(|v| (0.0..1.0).contains(v)));
    Ok(())
}

#[test]
fn empty_allocates_and_needs_static_shapes() -> Result<()> {
    init();
    let empty = LazyBuffer::empty([3], DType::F32, CPU, LazyConfig::default())?;
    assert_eq!(empty.realize()?.len(), 3);
    assert_eq!(read_f32(&empty)?.len(), 3);

    let open = LazyBuffer::empty(symbolic("n"), DType::F32, CPU, LazyConfig::default())?;
    let err = open.realize().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LazyError>(),
        Some(LazyError::UnsupportedShape { .. })
    ));

    let noise = LazyBuffer::rand(symbolic("m"), DType::F32, CPU, 1, LazyConfig::default())?;
    let err = noise.to_host().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LazyError>(),
        Some(LazyError::UnsupportedShape { .. })
    ));
    Ok(())
}

#[test]
fn custom_loader_sees_realized_sources() -> Result<()> {
    let config = LazyConfig::default();
    let x = host_f32(&[4], vec![1.0, 2.0, 3.0, 4.0], config)?;
    let doubled = x.e(BinaryOp::Add, &[&x], OpArg::None)?;
    let saw_realized = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&saw_realized);
    let loader = CustomLoader::new(move |out: &LazyBuffer, sources: &[LazyBuffer]| {
        let source = sources.first().context("custom load without a source")?;
        flag.store(source.is_realized(), Ordering::SeqCst);
        let lanes: Vec<f64> = source
            .to_host()?
            .to_lanes()
            .iter()
            .map(|v| v + 0.5)
            .collect();
        Ok(RawBuffer::host(HostData::from_lanes(out.dtype(), &lanes)))
    });
    let custom = LazyBuffer::custom([4], DType::F32, CPU, &[doubled], loader, config)?;

    assert_eq!(read_f32(&custom)?, vec![2.5, 4.5, 6.5, 8.5]);
    assert!(saw_realized.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn custom_results_folded_to_constants_are_inlined() -> Result<()> {
    init();
    let config = LazyConfig::default();
    let loader = CustomLoader::new(|out: &LazyBuffer, _: &[LazyBuffer]| {
        Ok(RawBuffer::constant(5.0, out.dtype()))
    });
    let five = LazyBuffer::custom([1], DType::F32, CPU, &[], loader, config)?;
    let negated = five.e(UnaryOp::Neg, &[], OpArg::None)?;

    // The loader has not run yet, so the kernel still expects a slot for it.
    let items = negated.schedule()?;
    assert_eq!(items.len(), 2);
    assert_eq!(compute_items(&items)[0].slots.len(), 1);

    assert_eq!(read_f32(&negated)?, vec![-5.0]);
    assert_eq!(five.realized().and_then(RawBuffer::as_constant), Some(5.0));

    let x = host_f32(&[4], vec![1.0, 2.0, 3.0, 4.0], config)?;
    let shifted = x.e(BinaryOp::Add, &[&five.expand([4])?], OpArg::None)?;
    let items = shifted.schedule()?;
    let kernels = compute_items(&items);
    assert_eq!(kernels.len(), 1);
    assert_eq!(kernels[0].slots.len(), 1);
    assert_eq!(kernels[0].slots[0].id(), x.id());
    assert!(kernels[0].ast.to_string().contains("(CONST 5 F32 (4))"));
    assert_eq!(read_f32(&shifted)?, vec![6.0, 7.0, 8.0, 9.0]);
    Ok(())
}

#[test]
fn panicking_loader_leaves_the_buffer_realizable() -> Result<()> {
    init();
    let armed = Arc::new(AtomicBool::new(true));
    let trigger = Arc::clone(&armed);
    let loader = CustomLoader::new(move |out: &LazyBuffer, _: &[LazyBuffer]| {
        if trigger.swap(false, Ordering::SeqCst) {
            panic!("loader failed on its first call");
        }
        Ok(RawBuffer::host(HostData::from_lanes(out.dtype(), &[1.0, 2.0])))
    });
    let flaky = LazyBuffer::custom([2], DType::F32, CPU, &[], loader, LazyConfig::default())?;

    let first = panic::catch_unwind(AssertUnwindSafe(|| flaky.realize()));
    assert!(first.is_err());
    assert!(!armed.load(Ordering::SeqCst));
    assert!(!flaky.is_realized());

    assert_eq!(flaky.realize()?.len(), 2);
    assert_eq!(read_f32(&flaky)?, vec![1.0, 2.0]);
    Ok(())
}

#[test]
fn copies_move_data_between_devices() -> Result<()> {
    let target = counting_device("realize-copy");
    let x = host_f32(&[2, 2], vec![1.0, 2.0, 3.0, 4.0], LazyConfig::default())?;
    let moved = x.permute(&[1, 0])?.copy_to("realize-copy:2")?;
    assert_eq!(moved.device(), "realize-copy:2");
    assert_eq!(moved.op().map(|op| op.op().as_load()), Some(Some(LoadOp::From)));

    assert_eq!(read_f32(&moved)?, vec![1.0, 3.0, 2.0, 4.0]);
    assert_eq!(target.uploads(), 1);
    assert_eq!(target.execs(), 0);
    let args = target.last_args().context("copy never reached the target")?;
    assert_eq!(args.get("device").map(String::as_str), Some("2"));
    Ok(())
}

#[test]
fn unknown_devices_fail_at_upload_or_realize() -> Result<()> {
    let err = host_f32_on("nowhere", &[2], vec![0.0, 1.0], LazyConfig::default()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LazyError>(),
        Some(LazyError::UnknownDevice(device)) if device == "nowhere"
    ));

    // Building graphs never touches a backend.
    let pending = LazyBuffer::empty([2], DType::F32, "nowhere:1", LazyConfig::default())?;
    let err = pending.realize().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LazyError>(),
        Some(LazyError::UnknownDevice(_))
    ));
    Ok(())
}

#[test]
fn concurrent_realizes_run_each_unit_once() -> Result<()> {
    let device = "realize-threads";
    let backend = counting_device(device);
    let config = LazyConfig::default();
    let a = host_f32_on(device, &[8], (0..8).map(|i| i as f32).collect(), config)?;
    let b = host_f32_on(device, &[8], vec![2.0; 8], config)?;
    let out = a.e(BinaryOp::Mul, &[&b], OpArg::None)?;

    let results: Vec<Result<RawBuffer>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4).map(|_| scope.spawn(|| out.realize())).collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("realize thread panicked"))
            .collect()
    });
    for result in results {
        assert_eq!(result?.len(), 8);
    }
    assert_eq!(backend.execs(), 1);
    assert_eq!(
        read_f32(&out)?,
        (0..8).map(|i| i as f32 * 2.0).collect::<Vec<_>>()
    );
    Ok(())
}

#[derive(Default)]
struct RecordingSink {
    before: Mutex<Vec<(UnitContext, String)>>,
    after: Mutex<Vec<(UnitContext, UnitStats)>>,
}

impl ExecutionTraceSink for RecordingSink {
    fn before_unit(&self, context: &UnitContext, ast: &LazyOp) {
        self.before
            .lock()
            .expect("recording sink poisoned")
            .push((context.clone(), ast.to_string()));
    }

    fn after_unit(&self, context: &UnitContext, stats: &UnitStats) {
        self.after
            .lock()
            .expect("recording sink poisoned")
            .push((context.clone(), stats.clone()));
    }
}

#[test]
fn trace_sink_sees_every_unit() -> Result<()> {
    let config = LazyConfig::default();
    let x = host_f32(&[4], vec![1.0, 2.0, 3.0, 4.0], config)?;
    let one = x.const_like(1.0)?;
    let out = x.e(BinaryOp::Add, &[&one], OpArg::None)?;
    let ours: HashSet<BufferId> = out.schedule()?.iter().map(|item| item.out.id()).collect();
    assert_eq!(ours.len(), 2);

    let broken = LazyBuffer::loadop(
        LoadOp::Const,
        Shape::scalar(),
        DType::F32,
        CPU,
        OpArg::None,
        &[],
        config,
    )?;

    let sink = Arc::new(RecordingSink::default());
    {
        let _guard = install_global_sink(sink.clone());
        out.realize()?;
        assert!(broken.realize().is_err());
    }

    let before = sink.before.lock().expect("recording sink poisoned");
    let after = sink.after.lock().expect("recording sink poisoned");
    let mine = |context: &UnitContext| ours.contains(&context.output);

    let started: Vec<_> = before.iter().filter(|(ctx, _)| mine(ctx)).collect();
    let finished: Vec<_> = after.iter().filter(|(ctx, _)| mine(ctx)).collect();
    assert_eq!(started.len(), 2);
    assert_eq!(finished.len(), 2);
    assert!(finished
        .iter()
        .all(|(_, stats)| stats.status == UnitStatus::Success));
    assert!(started
        .iter()
        .any(|(ctx, _)| ctx.kind == UnitKind::Load(LoadOp::Const)));
    let (compute, ast) = started
        .iter()
        .find(|(ctx, _)| ctx.kind == UnitKind::Compute)
        .context("compute unit was not traced")?;
    assert_eq!(compute.output, out.id());
    assert_eq!(compute.num_inputs, 1);
    assert!(ast.starts_with("(ADD"));

    let failed = after
        .iter()
        .find(|(ctx, _)| ctx.output == broken.id())
        .context("failed unit was not traced")?;
    assert!(matches!(failed.1.status, UnitStatus::Failure { .. }));
    Ok(())
}

use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use lazy_rs::backend::spec::{Backend, BackendError, BackendResult, DeviceArgs, RawBuffer};
use lazy_rs::ops::{
    BinaryOp, BufferOp, ConstBuffer, LazyOp, MemBuffer, OpArg, Opcode, ReduceOp, UnaryOp,
};
use lazy_rs::tensor::{DType, HostData, Shape};
use lazy_rs::view::ShapeTracker;
use lazy_rs::{LazyBuffer, LazyConfig};
use lazy_rs_backend_ref_cpu::{CpuBackend, CpuKernelInterceptor, GenericCpuBackend};

fn output(shape: &[usize]) -> Result<LazyBuffer> {
    lazy_rs_backend_ref_cpu::register_cpu_backend();
    LazyBuffer::empty(shape.to_vec(), DType::F32, "cpu", LazyConfig::default())
}

fn mem(idx: usize, st: ShapeTracker) -> LazyOp {
    LazyOp::leaf(
        BufferOp::Mem,
        OpArg::Mem(MemBuffer {
            idx,
            dtype: DType::F32,
            st,
        }),
    )
}

fn constant(value: f64, shape: &[usize]) -> Result<LazyOp> {
    let ones = vec![1; shape.len()];
    let st =
        ShapeTracker::from_shape(&Shape::from_static(&ones)).expand(&Shape::from_static(shape))?;
    Ok(LazyOp::leaf(
        BufferOp::Const,
        OpArg::Const(ConstBuffer {
            value,
            dtype: DType::F32,
            st,
        }),
    ))
}

fn input(values: &[f64]) -> RawBuffer {
    RawBuffer::host(HostData::from_lanes(DType::F32, values))
}

fn lanes(raw: &RawBuffer) -> Result<Vec<f64>> {
    Ok(raw.to_host(&[raw.len()])?.to_lanes())
}

#[test]
fn evaluates_fused_elementwise_trees() -> Result<()> {
    let backend = CpuBackend::new();
    let st = ShapeTracker::from_shape(&Shape::from_static(&[4]));
    let ast = LazyOp::new(
        BinaryOp::Mul,
        [
            LazyOp::new(
                BinaryOp::Add,
                [mem(1, st.clone()), mem(2, st.clone())],
                OpArg::None,
            ),
            constant(2.0, &[4])?,
        ],
        OpArg::None,
    );
    let inputs = [input(&[1.0, 2.0, 3.0, 4.0]), input(&[10.0, 20.0, 30.0, 40.0])];

    let raw = backend.exec(&ast, &output(&[4])?, &inputs, &DeviceArgs::new())?;
    assert_eq!(lanes(&raw)?, vec![22.0, 44.0, 66.0, 88.0]);
    Ok(())
}

#[test]
fn reduces_through_masked_views() -> Result<()> {
    let backend = CpuBackend::new();
    // (2, 2) padded to (2, 3) with a trailing zero column, then summed per row.
    let st = ShapeTracker::from_shape(&Shape::from_static(&[2, 2])).pad(&[(0, 0), (0, 1)])?;
    let ast = LazyOp::new(
        ReduceOp::Sum,
        [LazyOp::new(UnaryOp::Neg, [mem(1, st)], OpArg::None)],
        OpArg::Shape(Shape::from_static(&[2, 1])),
    );
    let raw = backend.exec(
        &ast,
        &output(&[2, 1])?,
        &[input(&[1.0, 2.0, 3.0, 4.0])],
        &DeviceArgs::new(),
    )?;
    assert_eq!(lanes(&raw)?, vec![-3.0, -7.0]);
    Ok(())
}

#[test]
fn intermediate_values_round_to_their_dtype() -> Result<()> {
    let backend = CpuBackend::new();
    let st = ShapeTracker::from_shape(&Shape::from_static(&[1]));
    // 0.1f32 + 0.2f32 rounded to f32 before the subtraction.
    let sum = LazyOp::new(
        BinaryOp::Add,
        [mem(1, st.clone()), mem(2, st.clone())],
        OpArg::None,
    );
    let ast = LazyOp::new(BinaryOp::Sub, [sum, mem(1, st)], OpArg::None);
    let a = 0.1f32 as f64;
    let b = 0.2f32 as f64;
    let inputs = [input(&[a]), input(&[b])];
    let raw = backend.exec(&ast, &output(&[1])?, &inputs, &DeviceArgs::new())?;

    let expected = ((a + b) as f32 as f64 - a) as f32 as f64;
    assert_eq!(lanes(&raw)?, vec![expected]);
    Ok(())
}

#[test]
fn bad_slots_report_the_output_buffer() -> Result<()> {
    let backend = CpuBackend::new();
    let out = output(&[4])?;
    let ast = mem(3, ShapeTracker::from_shape(&Shape::from_static(&[4])));
    let err = backend
        .exec(&ast, &out, &[input(&[0.0; 4])], &DeviceArgs::new())
        .unwrap_err();
    match err {
        BackendError::Execution { message } => {
            assert!(message.contains("MEM slot 3"), "{message}");
            assert!(message.contains(&format!("buf{}", out.id())), "{message}");
        }
        other => panic!("unexpected error {other:?}"),
    }
    Ok(())
}

#[test]
fn unresolved_buffer_leaves_are_rejected() -> Result<()> {
    let backend = CpuBackend::new();
    let out = output(&[4])?;
    let ast = LazyOp::new(UnaryOp::Noop, [&out], OpArg::None);
    assert!(backend.exec(&ast, &out, &[], &DeviceArgs::new()).is_err());
    Ok(())
}

#[derive(Default)]
struct ConstantInterceptor {
    hits: AtomicUsize,
}

impl CpuKernelInterceptor for ConstantInterceptor {
    fn try_exec(
        &self,
        ast: &LazyOp,
        output: &LazyBuffer,
        _inputs: &[RawBuffer],
    ) -> Option<BackendResult<RawBuffer>> {
        if ast.op() != Opcode::Unary(UnaryOp::Neg) {
            return None;
        }
        self.hits.fetch_add(1, Ordering::SeqCst);
        Some(Ok(RawBuffer::constant(-1.0, output.dtype())))
    }
}

#[test]
fn interceptor_takes_over_matching_trees() -> Result<()> {
    let backend = GenericCpuBackend::with_interceptor(ConstantInterceptor::default());
    let st = ShapeTracker::from_shape(&Shape::from_static(&[2]));
    let args = DeviceArgs::new();
    let out = output(&[2])?;

    let negated = LazyOp::new(UnaryOp::Neg, [mem(1, st.clone())], OpArg::None);
    let raw = backend.exec(&negated, &out, &[input(&[5.0, 6.0])], &args)?;
    assert_eq!(raw.as_constant(), Some(-1.0));

    let copied = LazyOp::new(UnaryOp::Noop, [mem(1, st)], OpArg::None);
    let raw = backend.exec(&copied, &out, &[input(&[5.0, 6.0])], &args)?;
    assert_eq!(lanes(&raw)?, vec![5.0, 6.0]);

    assert_eq!(backend.interceptor().hits.load(Ordering::SeqCst), 1);
    Ok(())
}

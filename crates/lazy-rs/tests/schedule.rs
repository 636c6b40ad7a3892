use std::collections::{HashMap, HashSet};

use anyhow::Result;
use lazy_rs::ops::{BinaryOp, BufferOp, LoadOp, OpArg, Opcode, ReduceOp, UnaryOp};
use lazy_rs::{DType, FusionLevel, LazyBuffer, LazyConfig, LazyError, Shape};
use proptest::prelude::*;


use lazy_support::{bits, compute_items, host_f32, read_f32, CPU};

#[test]
fn views_of_one_base_share_a_slot_and_constants_take_none() -> Result<()> {
    let a = host_f32(&[2, 2], vec![1.0, 2.0, 3.0, 4.0], LazyConfig::default())?;
    let transposed = a.permute(&[1, 0])?;
    let sum = a.e(BinaryOp::Add, &[&transposed], OpArg::None)?;
    let two = sum.const_like(2.0)?;
    let out = sum.e(BinaryOp::Mul, &[&two], OpArg::None)?;

    let items = out.schedule()?;
    let kernels = compute_items(&items);
    assert_eq!(kernels.len(), 1);
    let kernel = kernels[0];
    assert_eq!(kernel.slots.len(), 1);
    assert_eq!(kernel.slots[0].id(), a.id());
    assert_eq!(kernel.inputs.len(), 3);

    let leaves: Vec<_> = kernel
        .ast
        .nodes()
        .into_iter()
        .filter(|node| matches!(node.op(), Opcode::Buffer(_)))
        .collect();
    let mem_slots: Vec<usize> = leaves
        .iter()
        .filter_map(|node| match node.arg() {
            OpArg::Mem(mem) => Some(mem.idx),
            _ => None,
        })
        .collect();
    assert_eq!(mem_slots, vec![1, 1]);
    assert_eq!(
        leaves
            .iter()
            .filter(|node| node.op() == Opcode::Buffer(BufferOp::Const))
            .count(),
        1
    );

    assert_eq!(read_f32(&out)?, vec![4.0, 10.0, 10.0, 16.0]);
    Ok(())
}

#[test]
fn constant_without_a_value_is_an_unhandled_buffer() -> Result<()> {
    let config = LazyConfig::default();
    let x = host_f32(&[4], vec![1.0; 4], config)?;
    let broken = LazyBuffer::loadop(
        LoadOp::Const,
        Shape::scalar(),
        DType::F32,
        CPU,
        OpArg::None,
        &[],
        config,
    )?
    .reshape([1])?
    .expand([4])?;
    let out = x.e(BinaryOp::Add, &[&broken], OpArg::None)?;

    let err = out.schedule().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LazyError>(),
        Some(LazyError::UnhandledBufferKind(_))
    ));

    let err = broken.realize().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LazyError>(),
        Some(LazyError::UnhandledBufferKind(_))
    ));
    Ok(())
}

#[test]
fn load_arity_is_checked() -> Result<()> {
    let x = host_f32(&[4], vec![1.0; 4], LazyConfig::default())?;
    let err = LazyBuffer::loadop(
        LoadOp::Empty,
        [4],
        DType::F32,
        CPU,
        OpArg::None,
        std::slice::from_ref(&x),
        LazyConfig::default(),
    )
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LazyError>(),
        Some(LazyError::InvariantViolation(_))
    ));
    Ok(())
}

#[test]
fn dependencies_come_first_and_each_base_once() -> Result<()> {
    let config = LazyConfig::default().with_fusion(FusionLevel::None);
    let x = host_f32(&[4], vec![1.0, 2.0, 3.0, 4.0], config)?;
    let y = x.e(BinaryOp::Add, &[&x], OpArg::None)?;
    let squared = y.e(BinaryOp::Mul, &[&y], OpArg::None)?;
    let one = y.const_like(1.0)?;
    let shifted = y.e(BinaryOp::Add, &[&one], OpArg::None)?;
    let out = squared.e(BinaryOp::Sub, &[&shifted], OpArg::None)?;

    let items = out.schedule()?;
    let position: HashMap<_, _> = items
        .iter()
        .enumerate()
        .map(|(idx, item)| (item.out.id(), idx))
        .collect();
    assert_eq!(position.len(), items.len(), "a base was scheduled twice");
    assert_eq!(compute_items(&items).len(), 4);
    assert!(position[&y.id()] < position[&squared.id()]);
    assert!(position[&y.id()] < position[&shifted.id()]);
    assert_eq!(position[&out.id()], items.len() - 1);
    assert!(!position.contains_key(&x.id()));

    for item in items.iter().filter(|item| item.is_load()) {
        assert!(item.inputs.is_empty());
        assert!(item.slots.is_empty());
    }

    // (2x)^2 - (2x + 1)
    assert_eq!(read_f32(&out)?, vec![1.0, 11.0, 29.0, 55.0]);
    Ok(())
}

#[test]
fn contiguous_is_lowered_to_a_copy_kernel() -> Result<()> {
    let t = host_f32(&[2, 2], vec![1.0, 2.0, 3.0, 4.0], LazyConfig::default())?;
    let dense = t.permute(&[1, 0])?.contiguous();
    assert_eq!(dense.op().map(|op| op.op()), Some(Opcode::Load(LoadOp::Contiguous)));

    let items = dense.schedule()?;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].ast.op(), Opcode::Unary(UnaryOp::Noop));
    assert!(!items[0].is_load());
    assert_eq!(items[0].slots.len(), 1);
    assert_eq!(items[0].slots[0].id(), t.id());
    assert_eq!(read_f32(&dense)?, vec![1.0, 3.0, 2.0, 4.0]);
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Add(usize, usize),
    Mul(usize, usize),
    Max(usize, usize),
    Neg(usize),
    SumBroadcast(usize),
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (any::<usize>(), any::<usize>()).prop_map(|(a, b)| Step::Add(a, b)),
        (any::<usize>(), any::<usize>()).prop_map(|(a, b)| Step::Mul(a, b)),
        (any::<usize>(), any::<usize>()).prop_map(|(a, b)| Step::Max(a, b)),
        any::<usize>().prop_map(Step::Neg),
        any::<usize>().prop_map(Step::SumBroadcast),
    ]
}

fn build(steps: &[Step], fusion: FusionLevel) -> Result<LazyBuffer> {
    let config = LazyConfig::default().with_fusion(fusion);
    let mut pool = vec![
        host_f32(&[4], vec![1.0, -2.0, 3.0, 0.5], config)?,
        host_f32(&[4], vec![-1.0, 4.0, 0.25, 2.0], config)?,
    ];
    for step in steps {
        let pick = |idx: usize| pool[idx % pool.len()].clone();
        let next = match *step {
            Step::Add(a, b) => pick(a).e(BinaryOp::Add, &[&pick(b)], OpArg::None)?,
            Step::Mul(a, b) => pick(a).e(BinaryOp::Mul, &[&pick(b)], OpArg::None)?,
            Step::Max(a, b) => pick(a).e(BinaryOp::Max, &[&pick(b)], OpArg::None)?,
            Step::Neg(a) => pick(a).e(UnaryOp::Neg, &[], OpArg::None)?,
            Step::SumBroadcast(a) => pick(a).r(ReduceOp::Sum, [1])?.expand([4])?,
        };
        pool.push(next);
    }
    pool.last()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("empty pool"))
}

proptest! {
    #[test]
    fn schedules_are_ordered_and_fusion_is_transparent(
        steps in prop::collection::vec(arb_step(), 1..10)
    ) {
        let fused = build(&steps, FusionLevel::ElementwiseAndOneReduceMerge).unwrap();
        let items = fused.schedule().unwrap();

        let mut done = HashSet::new();
        for item in &items {
            for input in &item.inputs {
                let base = input.base();
                prop_assert!(
                    base.is_realized() || done.contains(&base.id()),
                    "buf{} scheduled before its input buf{}",
                    item.out.id(),
                    base.id()
                );
            }
            prop_assert!(done.insert(item.out.id()), "buf{} scheduled twice", item.out.id());
        }

        let unfused = build(&steps, FusionLevel::None).unwrap();
        let fused_values = read_f32(&fused).unwrap();
        let unfused_values = read_f32(&unfused).unwrap();
        prop_assert_eq!(bits(&fused_values), bits(&unfused_values));
    }
}

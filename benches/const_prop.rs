//! Pass throughput over synthetic straight-line blocks.

use krait::ir::{IrFunc, IrOp, OffsetType, Ref, Width};
use krait::ConstProp;

fn main() {
    divan::main();
}

/// A long block of repeated constants feeding adds: pooling-heavy.
fn build_pool_heavy(len: u64) -> IrFunc {
    let mut ir = IrFunc::new();
    let block = ir.create_block();
    let x = ir.push(block, IrOp::LoadContext { offset: 0 }, Width::W8, vec![]);
    for i in 0..len {
        let c = ir.push(
            block,
            IrOp::Constant { value: i % 16 },
            Width::W8,
            vec![],
        );
        ir.push(block, IrOp::Add, Width::W8, vec![Ref::Node(x), Ref::Node(c)]);
    }
    ir
}

/// Chains of fully-constant arithmetic: fold-heavy.
fn build_fold_heavy(len: u64) -> IrFunc {
    let mut ir = IrFunc::new();
    let block = ir.create_block();
    for i in 0..len {
        let a = ir.push(block, IrOp::Constant { value: i }, Width::W8, vec![]);
        let b = ir.push(
            block,
            IrOp::Constant { value: i ^ 0x5555 },
            Width::W8,
            vec![],
        );
        let sum = ir.push(block, IrOp::Add, Width::W8, vec![Ref::Node(a), Ref::Node(b)]);
        ir.push(
            block,
            IrOp::Lshl,
            Width::W8,
            vec![Ref::Node(sum), Ref::Node(b)],
        );
    }
    ir
}

/// Constant-address loads marching through a region: coalescing-heavy.
fn build_addressgen_heavy(len: u64) -> IrFunc {
    let mut ir = IrFunc::new();
    let block = ir.create_block();
    for i in 0..len {
        let addr = ir.push(
            block,
            IrOp::Constant {
                value: 0x10000 + i * 8,
            },
            Width::W8,
            vec![],
        );
        ir.push(
            block,
            IrOp::LoadMem {
                offset_type: OffsetType::Sxtx,
            },
            Width::W8,
            vec![Ref::Node(addr), Ref::Invalid],
        );
    }
    ir
}

#[divan::bench(args = [256, 2048])]
fn pool_heavy(bencher: divan::Bencher, len: u64) {
    bencher
        .with_inputs(|| build_pool_heavy(len))
        .bench_local_values(|mut ir| {
            ConstProp::new(true, true).run(&mut ir);
        });
}

#[divan::bench(args = [256, 2048])]
fn fold_heavy(bencher: divan::Bencher, len: u64) {
    bencher
        .with_inputs(|| build_fold_heavy(len))
        .bench_local_values(|mut ir| {
            ConstProp::new(true, true).run(&mut ir);
        });
}

#[divan::bench(args = [64, 512])]
fn addressgen_heavy(bencher: divan::Bencher, len: u64) {
    bencher
        .with_inputs(|| build_addressgen_heavy(len))
        .bench_local_values(|mut ir| {
            ConstProp::new(true, true).run(&mut ir);
        });
}

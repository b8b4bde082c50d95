//! Benchmarks for the trace optimizer and loop peeling

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use compiler::codegen::TraceInterpreter;
use compiler::ir::lowering::lower_text;
use compiler::ir::{IdAllocator, IrKind, IrValue, Opcode, RuntimeValue, TargetToken, TraceBuilder};
use compiler::resume::CodePosition;
use compiler::{optimize_trace, CompilationManager, JitConfig, OptimizerConfig};
use std::sync::Arc;

fn generate_arithmetic_loop(length: usize) -> String {
    let mut text = String::new();

    text.push_str("[i0, i1]\n");
    text.push_str("label(i0, i1, descr=loop)\n");

    // A chain of additions with a loop-invariant operand and a redundant guard every few steps
    let mut last = "i0".to_string();
    for i in 0..length {
        let name = format!("i{}", i + 2);
        text.push_str(&format!("{} = int_add({}, i1)\n", name, last));
        if i % 4 == 3 {
            text.push_str(&format!("i{} = int_lt({}, 1000000)\n", 100_000 + i, name));
            text.push_str(&format!("guard_true(i{}) [{}, i1]\n", 100_000 + i, name));
        }
        last = name;
    }

    text.push_str(&format!("jump({}, i1, descr=loop)\n", last));
    text
}

fn generate_virtual_loop(fields: usize) -> String {
    let mut text = String::new();

    text.push_str("descr Point = struct(vtable=0x1000)\n");
    for f in 0..fields {
        text.push_str(&format!("descr x{} = field(Point, int)\n", f));
    }
    text.push_str("[i0]\n");
    text.push_str("label(i0, descr=loop)\n");
    text.push_str("p1 = new_with_vtable(descr=Point)\n");

    // Every field is written and read back; nothing escapes
    for f in 0..fields {
        text.push_str(&format!("setfield_gc(p1, i0, descr=x{})\n", f));
    }
    let mut last = "i0".to_string();
    for f in 0..fields {
        text.push_str(&format!("i{} = getfield_gc_i(p1, descr=x{})\n", 1000 + f, f));
        text.push_str(&format!("i{} = int_add({}, i{})\n", 2000 + f, last, 1000 + f));
        last = format!("i{}", 2000 + f);
    }
    text.push_str(&format!("i3000 = int_lt({}, 1000000)\n", last));
    text.push_str("guard_true(i3000) [p1]\n");
    text.push_str("i9 = int_add(i0, 1)\n");
    text.push_str("jump(i9, descr=loop)\n");
    text
}

fn benchmark_linear_optimization(c: &mut Criterion) {
    let mut group = c.benchmark_group("linear_optimization");
    let config = OptimizerConfig {
        unroll: false,
        ..OptimizerConfig::default()
    };

    for length in [16, 64, 256, 1024].iter() {
        let ids = Arc::new(IdAllocator::new());
        let lowered = lower_text(&generate_arithmetic_loop(*length), ids.clone()).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(length), &lowered.trace, |b, trace| {
            b.iter(|| {
                let result = optimize_trace(black_box(trace), &config, &ids);
                black_box(result);
            });
        });
    }

    group.finish();
}

fn benchmark_loop_peeling(c: &mut Criterion) {
    let mut group = c.benchmark_group("loop_peeling");
    let config = OptimizerConfig::default();

    for length in [16, 64, 256, 1024].iter() {
        let ids = Arc::new(IdAllocator::new());
        let lowered = lower_text(&generate_arithmetic_loop(*length), ids.clone()).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(length), &lowered.trace, |b, trace| {
            b.iter(|| {
                let result = optimize_trace(black_box(trace), &config, &ids);
                black_box(result);
            });
        });
    }

    group.finish();
}

fn benchmark_virtual_removal(c: &mut Criterion) {
    let mut group = c.benchmark_group("virtual_removal");
    let config = OptimizerConfig::default();

    for fields in [4, 16, 64].iter() {
        let ids = Arc::new(IdAllocator::new());
        let lowered = lower_text(&generate_virtual_loop(*fields), ids.clone()).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(fields), &lowered.trace, |b, trace| {
            b.iter(|| {
                let result = optimize_trace(black_box(trace), &config, &ids);
                black_box(result);
            });
        });
    }

    group.finish();
}

fn benchmark_builder_traces(c: &mut Criterion) {
    // Skips the text format entirely
    c.bench_function("builder_trace_optimization", |b| {
        let ids = Arc::new(IdAllocator::new());
        let token = TargetToken::new(ids.token());
        let mut builder = TraceBuilder::new(ids.clone());
        let i0 = builder.input(IrKind::Int);
        builder.build_label(&token, &[i0]);
        let mut last: IrValue = i0.into();
        for step in 0..128u32 {
            let next = builder.build_int(Opcode::IntAdd, last, IrValue::int(1));
            let check = builder.build_int(Opcode::IntLt, next, IrValue::int(1 << 20));
            builder
                .at(CodePosition::new(0, step))
                .build_guard(Opcode::GuardTrue, &[check.into()], &[next.into()]);
            last = next.into();
        }
        builder.build_jump(&token, &[last]);
        let trace = builder.finish();
        let config = OptimizerConfig::default();

        b.iter(|| {
            let result = optimize_trace(black_box(&trace), &config, &ids);
            black_box(result);
        });
    });
}

fn benchmark_compile_and_run(c: &mut Criterion) {
    let text = generate_arithmetic_loop(64);

    c.bench_function("compile_and_run_loop", |b| {
        b.iter(|| {
            let manager = CompilationManager::new(TraceInterpreter::default(), JitConfig::production());
            let lowered = lower_text(black_box(&text), manager.context().ids().clone()).unwrap();
            let cell = manager.compile_loop(&lowered.trace).unwrap();
            let args = [RuntimeValue::Int(0), RuntimeValue::Int(1)];
            let outcome = manager.backend().execute(cell.entry, &args);
            black_box(outcome.is_ok());
        });
    });
}

criterion_group!(
    benches,
    benchmark_linear_optimization,
    benchmark_loop_peeling,
    benchmark_virtual_removal,
    benchmark_builder_traces,
    benchmark_compile_and_run
);
criterion_main!(benches);

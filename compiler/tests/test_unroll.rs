//! Loop peeling tests

use compiler::ir::lowering::lower_text;
use compiler::ir::{IdAllocator, Opcode, Operation};
use compiler::{optimize_trace, OptimizedTrace, OptimizerConfig};
use std::sync::Arc;

fn optimize_with(text: &str, config: OptimizerConfig) -> OptimizedTrace {
    let ids = Arc::new(IdAllocator::new());
    let lowered = lower_text(text, ids.clone()).expect("trace lowers");
    optimize_trace(&lowered.trace, &config, &ids).expect("trace optimizes")
}

/// Operations from the peeled loop's label to the end
fn body(optimized: &OptimizedTrace) -> &[Operation] {
    let start = optimized
        .trace
        .ops
        .iter()
        .rposition(|op| op.opcode == Opcode::Label)
        .expect("loop label");
    &optimized.trace.ops[start..]
}

fn count(ops: &[Operation], opcode: Opcode) -> usize {
    ops.iter().filter(|op| op.opcode == opcode).count()
}

const INVARIANT_MUL: &str = "
    [i0, i1]
    label(i0, i1, descr=loop)
    i2 = int_mul(i1, 3)
    i3 = int_add(i0, i2)
    i4 = int_lt(i3, 1000)
    guard_true(i4) [i3]
    jump(i3, i1, descr=loop)
";

#[test]
fn test_loop_gets_preamble_and_body() {
    let optimized = optimize_with(INVARIANT_MUL, OptimizerConfig::default());
    let trace = &optimized.trace;
    let loop_token = optimized.loop_token.as_ref().expect("loop was peeled");

    assert_eq!(trace.count(Opcode::Label), 2);
    assert_eq!(trace.count(Opcode::Jump), 2);
    assert!(!trace.is_loop());

    let body = body(&optimized);
    let label = body[0].descr.as_ref().and_then(|d| d.as_target()).unwrap();
    assert_eq!(label.id, loop_token.id);
    let jump = body.last().unwrap();
    let target = jump.descr.as_ref().and_then(|d| d.as_target()).unwrap();
    assert_eq!(target.id, loop_token.id);
    assert_eq!(jump.num_args(), body[0].num_args());
    assert_eq!(optimized.stats.get("unroll.peeled"), 1);
}

#[test]
fn test_invariant_operation_is_hoisted() {
    let optimized = optimize_with(INVARIANT_MUL, OptimizerConfig::default());
    let body = body(&optimized);
    let preamble_len = optimized.trace.len() - body.len();

    assert_eq!(count(&optimized.trace.ops[..preamble_len], Opcode::IntMul), 1);
    assert_eq!(count(body, Opcode::IntMul), 0);
    assert_eq!(count(body, Opcode::IntAdd), 1);
    assert_eq!(count(body, Opcode::GuardTrue), 1);
}

#[test]
fn test_body_guards_have_their_own_descriptors() {
    let optimized = optimize_with(INVARIANT_MUL, OptimizerConfig::default());
    let ids: Vec<_> = optimized.trace.guards().map(|g| g.id()).collect();
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);
}

#[test]
fn test_virtual_carried_around_the_loop() {
    let optimized = optimize_with(
        "
        descr Cell = struct(vtable=0x2000)
        descr count = field(Cell, int)
        [i0]
        label(i0, descr=loop)
        p1 = new_with_vtable(descr=Cell)
        setfield_gc(p1, i0, descr=count)
        i2 = getfield_gc_i(p1, descr=count)
        i3 = int_add(i2, 1)
        i4 = int_lt(i3, 50)
        guard_true(i4) [p1, i3]
        jump(i3, descr=loop)
        ",
        OptimizerConfig::default(),
    );
    assert!(optimized.loop_token.is_some());
    assert_eq!(optimized.trace.count(Opcode::NewWithVtable), 0);
    assert_eq!(optimized.trace.count(Opcode::GetfieldGcI), 0);
    for guard in optimized.trace.guards() {
        assert_eq!(guard.virtuals().len(), 1);
    }
}

#[test]
fn test_unroll_disabled_keeps_single_label() {
    let config = OptimizerConfig {
        unroll: false,
        ..OptimizerConfig::default()
    };
    let optimized = optimize_with(INVARIANT_MUL, config);
    assert!(optimized.loop_token.is_none());
    assert_eq!(optimized.trace.count(Opcode::Label), 1);
    assert!(optimized.trace.is_loop());
    assert_eq!(optimized.stats.get("unroll.peeled"), 0);
}

#[test]
fn test_peeled_bound_removes_body_guard() {
    // the body is entered with i0 in [1, 100], so only the upper check remains
    let optimized = optimize_with(
        "
        [i0]
        label(i0, descr=loop)
        i1 = int_ge(i0, 0)
        guard_true(i1) [i0]
        i2 = int_lt(i0, 100)
        guard_true(i2) [i0]
        i3 = int_add(i0, 1)
        jump(i3, descr=loop)
        ",
        OptimizerConfig::default(),
    );
    let body = body(&optimized);
    assert_eq!(count(body, Opcode::GuardTrue), 1);
    assert_eq!(count(body, Opcode::IntGe), 0);
    assert_eq!(count(body, Opcode::IntLt), 1);
}

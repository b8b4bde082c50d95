//! Optimizer pass tests on straight-line traces

use compiler::ir::lowering::{lower_text, LoweredTrace};
use compiler::ir::{IdAllocator, IrValue, Opcode, Operation};
use compiler::optimizer::optimize_linear;
use compiler::{optimize_trace, OptimizedTrace, OptimizerConfig};
use std::sync::Arc;

fn lower(text: &str) -> (LoweredTrace, Arc<IdAllocator>) {
    let ids = Arc::new(IdAllocator::new());
    let lowered = lower_text(text, ids.clone()).expect("trace lowers");
    (lowered, ids)
}

fn optimize(text: &str) -> OptimizedTrace {
    let (lowered, ids) = lower(text);
    optimize_trace(&lowered.trace, &OptimizerConfig::default(), &ids).expect("trace optimizes")
}

#[test]
fn test_implied_guard_is_removed() {
    let optimized = optimize(
        "
        [i0]
        i1 = int_lt(i0, 4)
        guard_true(i1) [i0]
        i2 = int_lt(i0, 5)
        guard_true(i2) [i0]
        finish(i0)
        ",
    );
    assert_eq!(optimized.trace.count(Opcode::GuardTrue), 1);
    assert_eq!(optimized.trace.count(Opcode::IntLt), 1);
    assert!(optimized.loop_token.is_none());
    assert!(optimized.stats.modified);
}

#[test]
fn test_contradicting_guards_invalidate_the_trace() {
    let (lowered, ids) = lower(
        "
        [i0]
        i1 = int_eq(i0, 5)
        guard_true(i1) [i0]
        i2 = int_ne(i0, 5)
        guard_true(i2) [i0]
        finish(i0)
        ",
    );
    let err = optimize_trace(&lowered.trace, &OptimizerConfig::default(), &ids).unwrap_err();
    assert!(err.to_string().starts_with("invalid loop"), "{}", err);
}

#[test]
fn test_constants_fold_through_arithmetic() {
    let optimized = optimize(
        "
        [i0]
        i1 = int_add(3, 4)
        i2 = int_mul(i1, 2)
        i3 = int_add(i0, 0)
        i4 = int_sub(i3, i3)
        i5 = int_add(i2, i4)
        finish(i5)
        ",
    );
    let finish = optimized.trace.terminal().unwrap();
    assert_eq!(finish.opcode, Opcode::Finish);
    assert_eq!(finish.arg(0).as_int(), Some(14));
    assert_eq!(optimized.trace.len(), 1);
}

#[test]
fn test_repeated_pure_operation_is_shared() {
    let optimized = optimize(
        "
        [i0, i1]
        i2 = int_mul(i0, i1)
        i3 = int_mul(i0, i1)
        i4 = int_add(i2, i3)
        finish(i4)
        ",
    );
    assert_eq!(optimized.trace.count(Opcode::IntMul), 1);
    let add = &optimized.trace.ops[1];
    assert_eq!(add.opcode, Opcode::IntAdd);
    assert_eq!(add.arg(0), add.arg(1));
}

#[test]
fn test_virtual_object_is_removed() {
    let optimized = optimize(
        "
        descr Node = struct(vtable=0x1000)
        descr value = field(Node, int)
        [i0]
        p1 = new_with_vtable(descr=Node)
        setfield_gc(p1, i0, descr=value)
        i2 = getfield_gc_i(p1, descr=value)
        i3 = int_add(i2, 1)
        finish(i3)
        ",
    );
    let trace = &optimized.trace;
    assert_eq!(trace.count(Opcode::NewWithVtable), 0);
    assert_eq!(trace.count(Opcode::SetfieldGc), 0);
    assert_eq!(trace.count(Opcode::GetfieldGcI), 0);
    assert_eq!(trace.ops[0].arg(0), IrValue::Box(trace.inputargs[0]));
    assert_eq!(optimized.stats.get("virtualize.alloc"), 1);
}

#[test]
fn test_virtual_escapes_at_call() {
    let optimized = optimize(
        "
        descr Node = struct(vtable=0x1000)
        descr value = field(Node, int)
        descr sink = call(ref -> void)
        [i0]
        p1 = new_with_vtable(descr=Node)
        setfield_gc(p1, i0, descr=value)
        i2 = getfield_gc_i(p1, descr=value)
        call_n(@sink, p1, descr=sink)
        finish(i2)
        ",
    );
    let trace = &optimized.trace;
    let position = |opcode: Opcode| trace.ops.iter().position(|op| op.opcode == opcode);
    let alloc = position(Opcode::NewWithVtable).expect("allocation is forced");
    let store = position(Opcode::SetfieldGc).expect("field is written");
    let call = position(Opcode::CallN).expect("call survives");
    assert!(alloc < store && store < call);
    assert_eq!(trace.count(Opcode::GetfieldGcI), 0);
    assert_eq!(trace.terminal().unwrap().arg(0), IrValue::Box(trace.inputargs[0]));
}

#[test]
fn test_virtual_in_snapshot_becomes_description() {
    let optimized = optimize(
        "
        descr Node = struct(vtable=0x1000)
        descr value = field(Node, int)
        [i0]
        p1 = new_with_vtable(descr=Node)
        setfield_gc(p1, i0, descr=value)
        i2 = int_lt(i0, 10)
        guard_true(i2) [p1]
        finish(i0)
        ",
    );
    let guard = optimized.trace.guards().next().unwrap();
    assert_eq!(guard.virtuals().len(), 1);
    assert_eq!(guard.fail_args(), &optimized.trace.inputargs[..]);
    assert_eq!(optimized.trace.count(Opcode::NewWithVtable), 0);
}

#[test]
fn test_virtual_array_index_out_of_range() {
    let (lowered, ids) = lower(
        "
        descr items = array(int)
        [i0]
        p1 = new_array(3, descr=items)
        setarrayitem_gc(p1, 1, i0, descr=items)
        i2 = getarrayitem_gc_i(p1, 5, descr=items)
        finish(i2)
        ",
    );
    assert!(optimize_trace(&lowered.trace, &OptimizerConfig::default(), &ids).is_err());
}

#[test]
fn test_virtual_array_reads_written_items() {
    let optimized = optimize(
        "
        descr items = array(int)
        [i0]
        p1 = new_array(3, descr=items)
        setarrayitem_gc(p1, 1, i0, descr=items)
        i2 = getarrayitem_gc_i(p1, 1, descr=items)
        i3 = getarrayitem_gc_i(p1, 2, descr=items)
        i4 = arraylen_gc(p1, descr=items)
        i5 = int_add(i2, i3)
        i6 = int_add(i5, i4)
        finish(i6)
        ",
    );
    let trace = &optimized.trace;
    assert_eq!(trace.count(Opcode::NewArray), 0);
    assert_eq!(trace.len(), 2);
    assert_eq!(trace.ops[0].opcode, Opcode::IntAdd);
    assert_eq!(trace.ops[0].arg(1).as_int(), Some(3));
}

#[test]
fn test_disabled_optimizer_keeps_every_operation() {
    let text = "
        [i0]
        i1 = int_add(i0, 0)
        i2 = int_add(i0, 0)
        i3 = int_lt(i1, 4)
        guard_true(i3) [i1]
        finish(i2)
    ";
    let (lowered, ids) = lower(text);
    let optimized = optimize_trace(&lowered.trace, &OptimizerConfig::disabled(), &ids).unwrap();
    assert_eq!(optimized.trace.len(), lowered.trace.len());
    assert!(!optimized.stats.modified);
    assert_eq!(optimized.stats.ops_removed, 0);
}

#[test]
fn test_linear_optimization_is_idempotent() {
    let (lowered, ids) = lower(
        "
        [i0, i1]
        i2 = int_add(i0, 0)
        i3 = int_mul(i2, i1)
        i4 = int_mul(i0, i1)
        i5 = int_lt(i3, 100)
        guard_true(i5) [i3]
        i6 = int_lt(i4, 100)
        guard_true(i6) [i4]
        finish(i4)
        ",
    );
    let config = OptimizerConfig::default();
    let (first, _) = optimize_linear(&lowered.trace, &config, &ids).unwrap();
    let (second, _) = optimize_linear(&first, &config, &ids).unwrap();
    let opcodes = |ops: &[Operation]| ops.iter().map(|op| op.opcode).collect::<Vec<_>>();
    assert_eq!(opcodes(&first.ops), opcodes(&second.ops));
    assert!(first.len() < lowered.trace.len());
}

#[test]
fn test_pointer_guards_merge_into_the_earlier_guard() {
    let (lowered, ids) = lower(
        "
        descr Node = struct(vtable=0x1000)
        [p0, i1]
        guard_nonnull(p0) [p0, i1]
        i2 = int_add(i1, 1)
        guard_class(p0, @Node) [p0, i2]
        finish(i2)
        ",
    );
    let first = lowered.trace.guards().next().unwrap().id();
    let optimized = optimize_trace(&lowered.trace, &OptimizerConfig::default(), &ids).unwrap();
    let trace = &optimized.trace;

    let guards: Vec<_> = trace.guards().collect();
    assert_eq!(guards.len(), 1);
    assert_eq!(guards[0].id(), first);
    assert_eq!(guards[0].guard(), Opcode::GuardNonnullClass);
    assert_eq!(trace.count(Opcode::GuardNonnullClass), 1);
    assert_eq!(trace.count(Opcode::GuardNonnull), 0);
    assert_eq!(trace.count(Opcode::GuardClass), 0);
    assert_eq!(optimized.stats.get("guard_merge.class"), 1);
}

#[test]
fn test_call_forgets_only_fields_it_writes() {
    let optimized = optimize(
        "
        descr Node = struct(vtable=0x1000)
        descr a = field(Node, int)
        descr b = field(Node, int)
        descr put = call(ref, int -> void, writes=[a])
        [p0, i1]
        i2 = getfield_gc_i(p0, descr=a)
        i3 = getfield_gc_i(p0, descr=b)
        call_n(@put, p0, i1, descr=put)
        i4 = getfield_gc_i(p0, descr=a)
        i5 = getfield_gc_i(p0, descr=b)
        i6 = int_add(i2, i3)
        i7 = int_add(i4, i5)
        i8 = int_add(i6, i7)
        finish(i8)
        ",
    );
    let trace = &optimized.trace;
    let call = trace
        .ops
        .iter()
        .position(|op| op.opcode == Opcode::CallN)
        .expect("call survives");
    let field_of = |op: &Operation| op.descr.as_ref().and_then(|d| d.as_field()).map(|f| f.name.clone());
    let reloaded: Vec<_> = trace.ops[call..]
        .iter()
        .filter(|op| op.opcode == Opcode::GetfieldGcI)
        .filter_map(field_of)
        .collect();
    assert_eq!(reloaded, vec!["a".to_string()]);
    assert_eq!(trace.count(Opcode::GetfieldGcI), 3);
}

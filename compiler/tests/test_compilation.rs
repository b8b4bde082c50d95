//! Compilation manager end-to-end: loops, guard failures, bridges

use compiler::codegen::{BackendError, BackendLimits, ExecOutcome, ProfileConfig, TraceInterpreter};
use compiler::ir::lowering::{LoweredTrace, Lowering};
use compiler::ir::{GcRef, IdAllocator, IrKind, IrValue, Opcode, RuntimeValue};
use compiler::resume::{CodePosition, FrameState};
use compiler::{
    CellToken, CompilationContext, CompilationManager, GuardAction, GuardState, JitConfig, Rejected,
};
use std::sync::Arc;

const SUM_LOOP: &str = "
    [i0, i1]
    label(i0, i1, descr=loop)
    i2 = int_add(i0, 1)
    i3 = int_add(i1, i0)
    i4 = int_lt(i2, 10)
    guard_true(i4) [i2, i3]
    jump(i2, i3, descr=loop)
";

fn manager() -> CompilationManager<TraceInterpreter> {
    manager_with(TraceInterpreter::default())
}

fn manager_with(backend: TraceInterpreter) -> CompilationManager<TraceInterpreter> {
    let config = JitConfig {
        profile: ProfileConfig {
            bridge_threshold: 1,
            ..ProfileConfig::development()
        },
        ..JitConfig::development()
    };
    CompilationManager::new(backend, config)
}

fn lower(manager: &CompilationManager<TraceInterpreter>, text: &str) -> LoweredTrace {
    let file = parser::parse_trace_file(text).expect("trace parses");
    Lowering::new(manager.context().ids().clone())
        .with_tokens(manager.context().pseudo_tokens())
        .lower(&file)
        .expect("trace lowers")
}

fn run(manager: &CompilationManager<TraceInterpreter>, cell: &CellToken, args: &[i64]) -> ExecOutcome {
    let args: Vec<RuntimeValue> = args.iter().map(|v| RuntimeValue::Int(*v)).collect();
    manager.backend().execute(cell.entry, &args).expect("execution succeeds")
}

#[test]
fn test_bridge_loops_back_into_compiled_code() {
    let manager = manager();
    let lowered = lower(&manager, SUM_LOOP);
    let cell = manager.compile_loop(&lowered.trace).unwrap();
    let start = cell.start.clone().expect("loop has a start label");

    let ExecOutcome::GuardFailed { guard, frame } = run(&manager, &cell, &[0, 0]) else {
        panic!("loop must leave through its guard");
    };
    let failure = manager.deoptimize(&guard, &frame).unwrap();
    assert_eq!(failure.action, GuardAction::CompileBridge);
    assert_eq!(
        failure.frames[0].values,
        vec![RuntimeValue::Int(10), RuntimeValue::Int(45)]
    );

    // restart the count while the sum stays below 200
    let (mut history, frames) = manager.start_bridge(&guard).unwrap();
    let sum = frames[0].values[1];
    let below = history
        .record(Opcode::IntLt, &[sum, IrValue::int(200)], None)
        .unwrap()
        .unwrap();
    history
        .record_guard(Opcode::GuardTrue, &[below.into()], &frames)
        .unwrap();
    history.jump_to(start, &[IrValue::int(0), sum]).unwrap();
    let bridge = history.into_trace().unwrap();
    let attached = manager.compile_bridge(&guard, &bridge).unwrap();
    assert_eq!(
        manager.context().guard_state(guard.id()),
        Some(GuardState::BridgeAttached(attached.address))
    );

    let ExecOutcome::GuardFailed { guard: exit, frame } = run(&manager, &cell, &[0, 0]) else {
        panic!("bridge guard must fail eventually");
    };
    assert_ne!(exit.id(), guard.id());
    assert_eq!(manager.context().guard_state(exit.id()), Some(GuardState::Compiled));
    let failure = manager.deoptimize(&exit, &frame).unwrap();
    assert_eq!(
        failure.frames[0].values,
        vec![RuntimeValue::Int(10), RuntimeValue::Int(225)]
    );

    let stats = manager.statistics();
    assert_eq!(stats.loops_compiled, 1);
    assert_eq!(stats.bridges_attached, 1);
    assert_eq!(stats.guard_failures, 2);
    assert_eq!(manager.context().cells().len(), 1);
}

#[test]
fn test_abandoned_bridge_can_be_requested_again() {
    let manager = manager();
    let lowered = lower(&manager, SUM_LOOP);
    let cell = manager.compile_loop(&lowered.trace).unwrap();

    let ExecOutcome::GuardFailed { guard, frame } = run(&manager, &cell, &[0, 0]) else {
        panic!("loop must leave through its guard");
    };
    let failure = manager.deoptimize(&guard, &frame).unwrap();
    assert_eq!(failure.action, GuardAction::CompileBridge);

    manager.abandon_bridge(&guard);
    assert_eq!(manager.context().guard_state(guard.id()), Some(GuardState::Compiled));
    assert_eq!(manager.context().guard_failures(guard.id()), 0);

    let failure = manager.deoptimize(&guard, &frame).unwrap();
    assert_eq!(failure.action, GuardAction::CompileBridge);
}

#[test]
fn test_unknown_guard_is_rejected() {
    let manager = manager();
    let other = crate::manager();
    let lowered = lower(&other, SUM_LOOP);
    let cell = other.compile_loop(&lowered.trace).unwrap();
    let ExecOutcome::GuardFailed { guard, .. } = run(&other, &cell, &[0, 0]) else {
        panic!("loop must leave through its guard");
    };

    let (mut history, _) = manager.start_bridge(&guard).unwrap();
    history.finish(None).unwrap();
    let bridge = history.into_trace().unwrap();
    assert_eq!(
        manager.compile_bridge(&guard, &bridge),
        Err(Rejected::UnknownGuard(guard.id()))
    );
    assert_eq!(manager.statistics().rejections.get("unknown_guard"), Some(&1));
}

#[test]
fn test_malformed_trace_is_rejected() {
    let manager = manager();
    let lowered = lower(&manager, SUM_LOOP);
    // drop the guard's comparison so its argument is never defined
    let mut trace = lowered.trace.clone();
    trace.ops.remove(3);
    let err = manager.compile_loop(&trace).unwrap_err();
    assert!(matches!(err, Rejected::Malformed(ref errors) if !errors.is_empty()), "{}", err);
    assert_eq!(err.reason(), "malformed");
    assert_eq!(manager.statistics().loops_compiled, 0);
}

#[test]
fn test_recorded_loop_compiles_like_text() {
    let manager = manager();
    let mut history = manager.start_tracing(&[IrKind::Int]);
    let i0 = IrValue::Box(history.inputargs()[0]);
    let doubled = history
        .record(Opcode::IntAdd, &[i0, i0], None)
        .unwrap()
        .unwrap();
    let small = history
        .record(Opcode::IntLt, &[doubled.into(), IrValue::int(1000)], None)
        .unwrap()
        .unwrap();
    let frames = [FrameState::new(CodePosition::new(0, 3), vec![doubled.into()])];
    history
        .record_guard(Opcode::GuardTrue, &[small.into()], &frames)
        .unwrap();
    history.close_loop(&[doubled.into()]).unwrap();
    let trace = history.into_trace().unwrap();

    let cell = manager.compile_loop(&trace).unwrap();
    assert!(cell.loop_token.is_some());
    let ExecOutcome::GuardFailed { guard, frame } = run(&manager, &cell, &[1]) else {
        panic!("doubling must leave the loop");
    };
    let failure = manager.deoptimize(&guard, &frame).unwrap();
    assert_eq!(failure.frames[0].position, CodePosition::new(0, 3));
    assert_eq!(failure.frames[0].values, vec![RuntimeValue::Int(1024)]);
}

#[test]
fn test_pseudo_loops_leave_the_frame() {
    let ids = Arc::new(IdAllocator::new());
    let manager = CompilationManager::with_context(
        CompilationContext::new(ids.clone()),
        TraceInterpreter::default(),
        JitConfig::development(),
    );
    let file = parser::parse_trace_file(
        "
        [i0, p1]
        i2 = int_gt(i0, 0)
        guard_true(i2) [i0, p1]
        jump(p1, descr=exit_frame_with_exception)
        ",
    )
    .unwrap();
    let lowered = Lowering::new(ids)
        .with_tokens(manager.context().pseudo_tokens())
        .lower(&file)
        .unwrap();
    let cell = manager.compile_loop(&lowered.trace).unwrap();
    assert!(cell.start.is_none());

    let args = [RuntimeValue::Int(3), RuntimeValue::Ref(GcRef(0x40))];
    let outcome = manager.backend().execute(cell.entry, &args).unwrap();
    assert!(matches!(
        outcome,
        ExecOutcome::Exception(Some(RuntimeValue::Ref(GcRef(0x40))))
    ));
}

#[test]
fn test_backend_rejection_leaves_guard_deoptimizing() {
    // room for the loop only
    let manager = manager_with(TraceInterpreter::new(BackendLimits {
        max_units: 1,
        ..BackendLimits::default()
    }));
    let lowered = lower(&manager, SUM_LOOP);
    let cell = manager.compile_loop(&lowered.trace).unwrap();

    let ExecOutcome::GuardFailed { guard, frame } = run(&manager, &cell, &[0, 0]) else {
        panic!("loop must leave through its guard");
    };
    let failure = manager.deoptimize(&guard, &frame).unwrap();
    assert_eq!(failure.action, GuardAction::CompileBridge);

    let (mut history, _) = manager.start_bridge(&guard).unwrap();
    history.finish(None).unwrap();
    let bridge = history.into_trace().unwrap();
    let err = manager.compile_bridge(&guard, &bridge).unwrap_err();
    assert!(
        matches!(err, Rejected::Backend(BackendError::CodeBufferFull { units: 1 })),
        "{}",
        err
    );
    assert_eq!(err.reason(), "backend");
    assert_eq!(manager.statistics().rejections.get("backend"), Some(&1));
    assert_eq!(manager.context().guard_state(guard.id()), Some(GuardState::Compiled));
    assert_eq!(manager.context().guard_failures(guard.id()), 0);

    // the guard keeps deoptimizing into the interpreter
    let ExecOutcome::GuardFailed { guard: again, .. } = run(&manager, &cell, &[0, 0]) else {
        panic!("no bridge was attached");
    };
    assert_eq!(again.id(), guard.id());
}

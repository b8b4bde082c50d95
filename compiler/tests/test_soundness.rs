//! Optimized and unoptimized code must leave through the same exit with the same values

use compiler::codegen::{CodeAddress, ExecOutcome, TraceInterpreter};
use compiler::ir::lowering::{LoweredTrace, Lowering};
use compiler::ir::{GcRef, RuntimeValue};
use compiler::resume::ResumedFrame;
use compiler::{CompilationManager, JitConfig, OptimizerConfig};

#[derive(Debug, PartialEq)]
enum Exit {
    Finished(Option<RuntimeValue>),
    Raised(Option<RuntimeValue>),
    Deopt(Vec<ResumedFrame>),
}

struct Runner {
    manager: CompilationManager<TraceInterpreter>,
    lowered: LoweredTrace,
    entry: CodeAddress,
}

impl Runner {
    fn new(text: &str, optimizer: OptimizerConfig) -> Self {
        let config = JitConfig {
            optimizer,
            ..JitConfig::development()
        };
        let manager = CompilationManager::new(TraceInterpreter::default(), config);
        let file = parser::parse_trace_file(text).expect("trace parses");
        let lowered = Lowering::new(manager.context().ids().clone())
            .with_tokens(manager.context().pseudo_tokens())
            .lower(&file)
            .expect("trace lowers");
        let cell = manager.compile_loop(&lowered.trace).expect("trace compiles");
        Self {
            manager,
            lowered,
            entry: cell.entry,
        }
    }

    fn run(&self, args: &[RuntimeValue]) -> Exit {
        let outcome = self
            .manager
            .backend()
            .execute(self.entry, args)
            .expect("execution succeeds");
        match outcome {
            ExecOutcome::Finished(value) => Exit::Finished(value),
            ExecOutcome::Exception(value) => Exit::Raised(value),
            ExecOutcome::GuardFailed { guard, frame } => {
                let outcome = self
                    .manager
                    .deoptimize(&guard, &frame)
                    .expect("guard failure resumes");
                Exit::Deopt(outcome.frames)
            }
        }
    }
}

fn ints(values: &[i64]) -> Vec<RuntimeValue> {
    values.iter().map(|v| RuntimeValue::Int(*v)).collect()
}

fn assert_same_exits(text: &str, inputs: &[Vec<RuntimeValue>]) {
    let plain = Runner::new(text, OptimizerConfig::disabled());
    let optimized = Runner::new(text, OptimizerConfig::default());
    assert!(
        optimized.manager.context().cells()[0].loop_token.is_some(),
        "loop was not peeled"
    );
    for args in inputs {
        let expected = plain.run(args);
        let actual = optimized.run(args);
        assert_eq!(actual, expected, "inputs {:?}", args);
    }
}

#[test]
fn test_counting_loop_with_redundant_guards() {
    assert_same_exits(
        "
        [i0]
        label(i0, descr=loop)
        i1 = int_lt(i0, 40)
        guard_true(i1) [i0]
        i2 = int_lt(i0, 50)
        guard_true(i2) [i0]
        i3 = int_mul(i0, 2)
        i4 = int_sub(i3, i0)
        i5 = int_add(i4, 1)
        jump(i5, descr=loop)
        ",
        &[ints(&[0]), ints(&[39]), ints(&[45]), ints(&[-5])],
    );
}

#[test]
fn test_overflow_leaves_through_the_same_guard() {
    assert_same_exits(
        "
        [i0, i1]
        label(i0, i1, descr=loop)
        i2 = int_add_ovf(i1, i0)
        guard_no_overflow() [i0, i1]
        i3 = int_add(i0, 1)
        i4 = int_lt(i3, 50)
        guard_true(i4) [i3, i2]
        jump(i3, i2, descr=loop)
        ",
        &[
            ints(&[0, 0]),
            ints(&[10, 7]),
            ints(&[0, i64::MAX - 10]),
            ints(&[3, i64::MIN + 5]),
        ],
    );
}

#[test]
fn test_invariant_work_is_not_observable() {
    assert_same_exits(
        "
        [i0, i1]
        label(i0, i1, descr=loop)
        i2 = int_mul(i1, 3)
        i3 = int_add(i0, i2)
        i4 = int_lt(i3, 1000)
        guard_true(i4) [i3, i1]
        jump(i3, i1, descr=loop)
        ",
        &[ints(&[0, 1]), ints(&[0, 7]), ints(&[999, 0]), ints(&[-20, 100])],
    );
}

#[test]
fn test_virtual_sum_matches_unoptimized_allocation() {
    // the unoptimized run allocates; compare the integer results only
    let text = "
        descr Acc = struct(vtable=0x3000)
        descr total = field(Acc, int)
        [i0, i1]
        label(i0, i1, descr=loop)
        p2 = new_with_vtable(descr=Acc)
        setfield_gc(p2, i1, descr=total)
        i3 = getfield_gc_i(p2, descr=total)
        i4 = int_add(i3, i0)
        setfield_gc(p2, i4, descr=total)
        i5 = getfield_gc_i(p2, descr=total)
        i6 = int_add(i0, 1)
        i7 = int_lt(i6, 20)
        guard_true(i7) [i6, i5]
        jump(i6, i5, descr=loop)
    ";
    assert_same_exits(text, &[ints(&[0, 0]), ints(&[5, 100]), ints(&[30, 1])]);

    let optimized = Runner::new(text, OptimizerConfig::default());
    assert_eq!(optimized.manager.backend().heap().allocations(), 0);
    optimized.run(&ints(&[0, 0]));
    assert_eq!(optimized.manager.backend().heap().allocations(), 0);
}

#[test]
fn test_field_reads_on_a_real_object() {
    let text = "
        descr Node = struct(vtable=0x1000)
        descr step = field(Node, int)
        [p0, i0]
        label(p0, i0, descr=loop)
        i1 = getfield_gc_i(p0, descr=step)
        i2 = int_add(i0, i1)
        i3 = int_lt(i2, 100)
        guard_true(i3) [p0, i2]
        jump(p0, i2, descr=loop)
    ";
    let plain = Runner::new(text, OptimizerConfig::disabled());
    let optimized = Runner::new(text, OptimizerConfig::default());
    for runner in [&plain, &optimized] {
        let node = runner.lowered.descr("Node").and_then(|d| d.as_size()).unwrap().clone();
        let step = runner.lowered.descr("step").and_then(|d| d.as_field()).unwrap().clone();
        let mut backend = runner.manager.backend();
        let object = backend.heap_mut().new_struct(&node);
        let RuntimeValue::Ref(r) = object else {
            panic!("allocation returns a reference");
        };
        assert_eq!(r, GcRef(1));
        backend.heap_mut().set_field(r, &step, RuntimeValue::Int(7)).unwrap();
    }

    let args = vec![RuntimeValue::Ref(GcRef(1)), RuntimeValue::Int(0)];
    let expected = plain.run(&args);
    assert_eq!(
        expected,
        Exit::Deopt(vec![ResumedFrame {
            position: plain.lowered.trace.guards().next().unwrap().snapshot().position,
            values: vec![RuntimeValue::Ref(GcRef(1)), RuntimeValue::Int(105)],
        }])
    );
    assert_eq!(optimized.run(&args), expected);
}

#[test]
fn test_value_guard_does_not_hide_class_guard() {
    // GcRef(1) is the constant the trace checks for, but it has the wrong class
    let text = "
        descr Node = struct(vtable=0x1000)
        descr Other = struct(vtable=0x200)
        [p0]
        guard_class(p0, @Node) [p0]
        guard_value(p0, ConstPtr(0x1)) [p0]
        finish(p0)
    ";
    let plain = Runner::new(text, OptimizerConfig::disabled());
    let optimized = Runner::new(text, OptimizerConfig::default());
    for runner in [&plain, &optimized] {
        let other = runner.lowered.descr("Other").and_then(|d| d.as_size()).unwrap().clone();
        let node = runner.lowered.descr("Node").and_then(|d| d.as_size()).unwrap().clone();
        let mut backend = runner.manager.backend();
        assert_eq!(backend.heap_mut().new_struct(&other), RuntimeValue::Ref(GcRef(1)));
        assert_eq!(backend.heap_mut().new_struct(&node), RuntimeValue::Ref(GcRef(2)));
    }

    let wrong_class = vec![RuntimeValue::Ref(GcRef(1))];
    let expected = plain.run(&wrong_class);
    assert!(matches!(expected, Exit::Deopt(_)), "{:?}", expected);
    assert_eq!(optimized.run(&wrong_class), expected);

    let wrong_value = vec![RuntimeValue::Ref(GcRef(2))];
    assert_eq!(optimized.run(&wrong_value), plain.run(&wrong_value));
}

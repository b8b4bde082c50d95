//! Trace file parsing tests

use parser::{parse_trace_file, Arg, CallEffect, DescrKind, ValueKind};

#[test]
fn test_simple_loop() {
    let text = "
        [i0]
        label(i0, descr=loop)
        i1 = int_add(i0, 1)   # increment
        i2 = int_lt(i1, 100)
        guard_true(i2) [i1]
        jump(i1, descr=loop)
    ";
    let file = parse_trace_file(text).expect("parses");
    assert_eq!(file.inputs, vec!["i0"]);
    assert_eq!(file.ops.len(), 5);

    let add = &file.ops[1];
    assert_eq!(add.result.as_deref(), Some("i1"));
    assert_eq!(add.name, "int_add");
    assert_eq!(add.args, vec![Arg::Var("i0".into()), Arg::Int(1)]);
    assert_eq!(add.line, 4);

    let guard = &file.ops[3];
    assert!(guard.is_guard());
    let frames = guard.snapshot.as_ref().expect("snapshot");
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].values, vec![Arg::Var("i1".into())]);

    assert_eq!(file.ops[4].descr.as_deref(), Some("loop"));
}

#[test]
fn test_declarations() {
    let text = "
        descr Node = struct(size=16, vtable=0x1000)
        descr value = field(Node, int)
        descr next = field(Node, ref, immutable)
        descr items = array(float)
        descr get = call(ref, int -> int, elidable, addr=0x5000)
        descr store = call(ref -> void, writes=[value, items], raises)
        descr opaque = call(-> void)
        [p0]
        finish()
    ";
    let file = parse_trace_file(text).expect("parses");
    assert_eq!(file.decls.len(), 7);
    assert_eq!(
        file.decls[0].kind,
        DescrKind::Struct {
            size: Some(16),
            vtable: Some(0x1000)
        }
    );
    assert_eq!(
        file.decls[2].kind,
        DescrKind::Field {
            owner: "Node".into(),
            kind: ValueKind::Ref,
            immutable: true
        }
    );
    assert_eq!(file.decls[3].kind, DescrKind::Array { item: ValueKind::Float });
    match &file.decls[4].kind {
        DescrKind::Call {
            args,
            result,
            effect,
            address,
            raises,
        } => {
            assert_eq!(args, &vec![ValueKind::Ref, ValueKind::Int]);
            assert_eq!(*result, ValueKind::Int);
            assert_eq!(*effect, CallEffect::Elidable);
            assert_eq!(*address, Some(0x5000));
            assert!(!raises);
        }
        other => panic!("expected a call descriptor, got {:?}", other),
    }
    match &file.decls[5].kind {
        DescrKind::Call { effect, raises, .. } => {
            assert_eq!(*effect, CallEffect::Writes(vec!["value".into(), "items".into()]));
            assert!(*raises);
        }
        other => panic!("expected a call descriptor, got {:?}", other),
    }
    match &file.decls[6].kind {
        DescrKind::Call { args, effect, .. } => {
            assert!(args.is_empty());
            assert_eq!(*effect, CallEffect::Unknown);
        }
        other => panic!("expected a call descriptor, got {:?}", other),
    }
}

#[test]
fn test_multi_frame_snapshot_and_branch() {
    let text = "
        [i0, p1]
        i2 = int_is_true(i0)
        guard_true(i2) [1:4 p1 | 2:9 i0, 7] {
            i3 = int_neg(i0)
            finish(i3)
        }
        guard_value(p1, ConstPtr(0x40)) []
        guard_class(p1, @Node)
        finish(NULL)
    ";
    let file = parse_trace_file(text).expect("parses");
    let guard = &file.ops[1];
    let frames = guard.snapshot.as_ref().expect("snapshot");
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].position, Some((1, 4)));
    assert_eq!(frames[1].position, Some((2, 9)));
    assert_eq!(frames[1].values, vec![Arg::Var("i0".into()), Arg::Int(7)]);

    let branch = guard.branch.as_ref().expect("branch");
    assert_eq!(branch.len(), 2);
    assert_eq!(branch[1].name, "finish");

    assert_eq!(file.ops[2].args[1], Arg::Ptr(0x40));
    assert_eq!(file.ops[3].args[1], Arg::Addr("Node".into()));
    assert!(file.ops[3].snapshot.is_none());
    assert_eq!(file.ops[4].args, vec![Arg::Null]);
}

#[test]
fn test_error_position() {
    let text = "[i0]\ni1 = int_add(i0,, 1)\nfinish(i1)\n";
    let err = parse_trace_file(text).unwrap_err();
    assert_eq!(err.position.line, 2);
    assert!(err.message.contains("argument list"), "{}", err);
}

#[test]
fn test_missing_input_list() {
    let err = parse_trace_file("i1 = int_add(i0, 1)").unwrap_err();
    assert_eq!(err.position.line, 1);
    assert!(err.message.contains("input list"), "{}", err);
}

//! Trace Dump Utility
//!
//! Pretty-prints traces in the textual trace format, and compares traces
//! structurally. Useful for debugging optimization passes and for tests
//! that state the expected optimizer output as text.

use super::{Descr, IrBox, IrId, IrValue, Operation, TargetToken, TokenId, Trace};
use crate::resume::{FailDescr, SnapshotValue};
use fxhash::FxHashMap;
use std::fmt::Write;

/// What to print after a guard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GuardDetail {
    /// The fail args, which is what the text format reads back as a snapshot
    #[default]
    FailArgs,
    /// The full snapshot chain with frame positions and virtuals
    Snapshot,
}

fn token_name(token: &TargetToken) -> String {
    match token.pseudo {
        Some(pseudo) => pseudo.name().to_string(),
        None => format!("token{}", token.id.0),
    }
}

fn write_snapshot(out: &mut String, descr: &FailDescr) {
    out.push_str(" [");
    for (i, frame) in descr.snapshot().frames().into_iter().enumerate() {
        if i > 0 {
            out.push_str(" |");
        }
        let _ = write!(out, "{}:{}", frame.position.code, frame.position.pc);
        for (j, value) in frame.values.iter().enumerate() {
            out.push_str(if j == 0 { " " } else { ", " });
            match value {
                SnapshotValue::Value(v) => {
                    let _ = write!(out, "{}", v);
                }
                SnapshotValue::Virtual(index) => {
                    let _ = write!(out, "<virtual #{}>", index);
                }
            }
        }
    }
    out.push(']');
}

/// Format one operation in the text format
pub fn dump_operation(op: &Operation, detail: GuardDetail) -> String {
    let mut out = String::new();
    if let Some(result) = op.result {
        let _ = write!(out, "{} = ", result);
    }
    let _ = write!(out, "{}(", op.opcode);
    for (i, arg) in op.args.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{}", arg);
    }
    match &op.descr {
        Some(Descr::Fail(descr)) => {
            out.push(')');
            match detail {
                GuardDetail::FailArgs => {
                    out.push_str(" [");
                    for (i, arg) in descr.fail_args().iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        let _ = write!(out, "{}", arg);
                    }
                    out.push(']');
                }
                GuardDetail::Snapshot => write_snapshot(&mut out, descr),
            }
        }
        Some(descr) => {
            if !op.args.is_empty() {
                out.push_str(", ");
            }
            let name = match descr {
                Descr::Target(token) => token_name(token),
                other => other.to_string(),
            };
            let _ = write!(out, "descr={})", name);
        }
        None => out.push(')'),
    }
    out
}

fn dump_ops(out: &mut String, trace: &Trace, ops: &[Operation], depth: usize, detail: GuardDetail) {
    let indent = "    ".repeat(depth);
    for op in ops {
        let _ = write!(out, "{}{}", indent, dump_operation(op, detail));
        match op.branch.and_then(|id| trace.branch(id)) {
            Some(branch) => {
                out.push_str(" {\n");
                dump_ops(out, trace, &branch.ops, depth + 1, detail);
                let _ = writeln!(out, "{}}}", indent);
            }
            None => out.push('\n'),
        }
    }
}

/// Dump a trace, inline branches included
pub fn dump_trace(trace: &Trace) -> String {
    dump_trace_with(trace, GuardDetail::FailArgs)
}

pub fn dump_trace_with(trace: &Trace, detail: GuardDetail) -> String {
    let mut out = String::new();
    out.push('[');
    for (i, input) in trace.inputargs.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{}", input);
    }
    out.push_str("]\n");
    dump_ops(&mut out, trace, &trace.ops, 0, detail);
    out
}

/// Bijection between the boxes and tokens of two traces
#[derive(Default)]
struct Renaming {
    boxes: FxHashMap<IrId, IrId>,
    reverse: FxHashMap<IrId, IrId>,
    tokens: FxHashMap<TokenId, TokenId>,
    reverse_tokens: FxHashMap<TokenId, TokenId>,
}

impl Renaming {
    fn boxes(&mut self, a: IrBox, b: IrBox) -> bool {
        if a.kind() != b.kind() {
            return false;
        }
        match (self.boxes.get(&a.id()), self.reverse.get(&b.id())) {
            (Some(x), Some(y)) => *x == b.id() && *y == a.id(),
            (None, None) => {
                self.boxes.insert(a.id(), b.id());
                self.reverse.insert(b.id(), a.id());
                true
            }
            _ => false,
        }
    }

    fn values(&mut self, a: IrValue, b: IrValue) -> bool {
        match (a, b) {
            (IrValue::Const(x), IrValue::Const(y)) => x == y && x.kind() == y.kind(),
            (IrValue::Box(x), IrValue::Box(y)) => self.boxes(x, y),
            _ => false,
        }
    }

    fn tokens(&mut self, a: &TargetToken, b: &TargetToken) -> bool {
        if a.pseudo != b.pseudo {
            return false;
        }
        match (self.tokens.get(&a.id), self.reverse_tokens.get(&b.id)) {
            (Some(x), Some(y)) => *x == b.id && *y == a.id,
            (None, None) => {
                self.tokens.insert(a.id, b.id);
                self.reverse_tokens.insert(b.id, a.id);
                true
            }
            _ => false,
        }
    }

    fn descrs(&mut self, a: &Option<Descr>, b: &Option<Descr>) -> bool {
        match (a, b) {
            (None, None) => true,
            (Some(Descr::Fail(x)), Some(Descr::Fail(y))) => {
                x.fail_args().len() == y.fail_args().len()
                    && x
                        .fail_args()
                        .iter()
                        .zip(y.fail_args())
                        .all(|(p, q)| self.boxes(*p, *q))
            }
            (Some(Descr::Target(x)), Some(Descr::Target(y))) => self.tokens(x, y),
            // layouts compare by name so traces from separate registries match
            (Some(x), Some(y)) => {
                std::mem::discriminant(x) == std::mem::discriminant(y)
                    && x.to_string() == y.to_string()
            }
            _ => false,
        }
    }

    fn ops(&mut self, a: &Trace, b: &Trace, xs: &[Operation], ys: &[Operation]) -> bool {
        if xs.len() != ys.len() {
            return false;
        }
        for (x, y) in xs.iter().zip(ys) {
            if x.opcode != y.opcode || x.num_args() != y.num_args() {
                return false;
            }
            if !x.args.iter().zip(&y.args).all(|(p, q)| self.values(*p, *q)) {
                return false;
            }
            let results = match (x.result, y.result) {
                (Some(p), Some(q)) => self.boxes(p, q),
                (None, None) => true,
                _ => false,
            };
            if !results || !self.descrs(&x.descr, &y.descr) {
                return false;
            }
            let branches = match (x.branch, y.branch) {
                (None, None) => true,
                (Some(p), Some(q)) => match (a.branch(p), b.branch(q)) {
                    (Some(p), Some(q)) => self.ops(a, b, &p.ops, &q.ops),
                    _ => false,
                },
                _ => false,
            };
            if !branches {
                return false;
            }
        }
        true
    }
}

/// True when the traces are identical up to renaming boxes and tokens
pub fn traces_equivalent(a: &Trace, b: &Trace) -> bool {
    let mut renaming = Renaming::default();
    a.inputargs.len() == b.inputargs.len()
        && a
            .inputargs
            .iter()
            .zip(&b.inputargs)
            .all(|(x, y)| renaming.boxes(*x, *y))
        && renaming.ops(a, b, &a.ops, &b.ops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::lowering::lower_text;
    use crate::ir::IdAllocator;
    use std::sync::Arc;

    const LOOP: &str = "
        [i0, p1]
        label(i0, p1, descr=loop)
        i2 = int_add(i0, 1)
        i3 = int_lt(i2, 10)
        guard_true(i3) [i2, p1]
        jump(i2, p1, descr=loop)
    ";

    #[test]
    fn test_dump_format() {
        let lowered = lower_text(LOOP, Arc::new(IdAllocator::new())).unwrap();
        let text = dump_trace(&lowered.trace);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "[i0, p1]");
        assert_eq!(lines[2], "i2 = int_add(i0, 1)");
        assert_eq!(lines[4], "guard_true(i3) [i2, p1]");
        assert!(lines[5].starts_with("jump(i2, p1, descr=token"));
    }

    #[test]
    fn test_equivalence_is_modulo_renaming() {
        let ids = Arc::new(IdAllocator::new());
        let a = lower_text(LOOP, ids.clone()).unwrap();
        let renamed = LOOP.replace("i2", "i7").replace("i3", "i9");
        let b = lower_text(&renamed, ids.clone()).unwrap();
        assert!(traces_equivalent(&a.trace, &b.trace));

        let different = LOOP.replace("int_lt(i2, 10)", "int_lt(i2, 11)");
        let c = lower_text(&different, ids).unwrap();
        assert!(!traces_equivalent(&a.trace, &c.trace));
    }

    #[test]
    fn test_dump_reparses_to_an_equivalent_trace() {
        let ids = Arc::new(IdAllocator::new());
        let text = "
            [i0]
            i1 = int_is_zero(i0)
            guard_false(i1) [i0] {
                finish(-1)
            }
            i2 = int_mul(i0, 3)
            finish(i2)
        ";
        let first = lower_text(text, ids.clone()).unwrap();
        let dumped = dump_trace(&first.trace);
        let second = lower_text(&dumped, ids).unwrap();
        assert!(traces_equivalent(&first.trace, &second.trace), "{}", dumped);
    }
}

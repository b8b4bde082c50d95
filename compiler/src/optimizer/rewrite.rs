//! Constant folding, algebraic simplification and guard removal

use super::{Chain, IntBound, InvalidLoop, OptState, OptimizationPass, PureKey};
use crate::ir::eval::{eval_ovf, fold_constants};
use crate::ir::{IrConst, IrKind, IrValue, Opcode, Operation};
use tracing::trace;

pub struct Rewrite {
    /// The last overflow-checked operation was folded; drop its guard
    folded_ovf: bool,
}

impl Rewrite {
    pub fn new() -> Self {
        Self { folded_ovf: false }
    }

    fn replace_with(
        &self,
        op: &Operation,
        value: IrValue,
        state: &mut OptState,
        reason: &str,
    ) -> Result<(), InvalidLoop> {
        trace!("rewrite: {} => {}", op, value);
        if let Some(result) = op.result {
            state.make_equal_to(result, value)?;
        }
        state.stats.removed(reason);
        Ok(())
    }

    /// Fold identities such as `x + 0` and `x - x`
    fn simplify(&self, op: &Operation, state: &OptState) -> Option<IrValue> {
        use Opcode::*;

        if op.num_args() == 1 {
            let x = op.arg(0);
            return match op.opcode {
                IntIsTrue if IntBound::BOOL.contains_bound(&state.bound(x)) => Some(x),
                _ => None,
            };
        }
        if op.num_args() != 2 {
            return None;
        }
        let (a, b) = (op.arg(0), op.arg(1));
        let (ca, cb) = (a.as_int(), b.as_int());
        let same = a == b && !a.is_const();
        match op.opcode {
            IntAdd if cb == Some(0) => Some(a),
            IntAdd if ca == Some(0) => Some(b),
            IntSub if cb == Some(0) => Some(a),
            IntSub | IntXor if same => Some(IrValue::int(0)),
            IntMul if cb == Some(1) => Some(a),
            IntMul if ca == Some(1) => Some(b),
            IntMul if ca == Some(0) || cb == Some(0) => Some(IrValue::int(0)),
            IntAnd if ca == Some(0) || cb == Some(0) => Some(IrValue::int(0)),
            IntAnd if cb == Some(-1) => Some(a),
            IntAnd if ca == Some(-1) => Some(b),
            IntAnd | IntOr if same => Some(a),
            IntOr | IntXor if cb == Some(0) => Some(a),
            IntOr | IntXor if ca == Some(0) => Some(b),
            IntLshift | IntRshift | UintRshift if cb == Some(0) => Some(a),
            IntLshift | IntRshift | UintRshift if ca == Some(0) => Some(IrValue::int(0)),
            IntLt | IntGt | IntNe | UintLt | UintGt | PtrNe if same => Some(IrValue::int(0)),
            IntLe | IntGe | IntEq | UintLe | UintGe | PtrEq if same => Some(IrValue::int(1)),
            PtrEq | PtrNe => {
                let known_distinct = state.is_virtual(a)
                    || state.is_virtual(b)
                    || (state.is_null(a) && state.is_nonnull(b))
                    || (state.is_null(b) && state.is_nonnull(a));
                known_distinct.then(|| IrValue::int((op.opcode == PtrNe) as i64))
            }
            _ => None,
        }
    }

    /// Reuse an earlier comparison with swapped arguments or the opposite outcome
    fn find_rewritable_bool(&self, op: &Operation, state: &OptState) -> Option<IrValue> {
        if !op.opcode.is_comparison() || op.num_args() != 2 {
            return None;
        }
        let (a, b) = (op.arg(0), op.arg(1));
        if let Some(reflex) = op.opcode.bool_reflex() {
            if let Some(value) = state.pure.lookup(&PureKey::new(reflex, [b, a], None)) {
                return Some(value);
            }
        }
        let inverse = op.opcode.bool_inverse()?;
        let mut candidates = vec![PureKey::new(inverse, [a, b], None)];
        if let Some(reflex) = inverse.bool_reflex() {
            candidates.push(PureKey::new(reflex, [b, a], None));
        }
        candidates.iter().find_map(|key| {
            let known = state.get_replacement(state.pure.lookup(key)?);
            known.as_int().map(|v| IrValue::int((v == 0) as i64))
        })
    }

    fn optimize_guard(
        &mut self,
        op: Operation,
        state: &mut OptState,
        next: &mut Chain<'_>,
    ) -> Result<(), InvalidLoop> {
        use Opcode::*;

        let fail = |what: &str| Err(InvalidLoop::new(format!("{} always fails: {}", op, what)));
        match op.opcode {
            GuardTrue | GuardFalse => {
                let value = op.arg(0);
                let expected = op.opcode == GuardTrue;
                if let Some(c) = value.as_int() {
                    if (c != 0) == expected {
                        state.stats.removed("rewrite.guard");
                        return Ok(());
                    }
                    return fail("constant condition");
                }
                let bound = state.bound(value);
                if !bound.contains(0) {
                    if expected {
                        state.stats.removed("rewrite.guard");
                        return Ok(());
                    }
                    return fail("condition is never zero");
                }
                let boolean = IntBound::BOOL.contains_bound(&bound)
                    || state.definition(value).is_some();
                next.emit(op, state)?;
                if let IrValue::Box(b) = state.get_replacement(value) {
                    if !expected {
                        state.make_constant(b, IrConst::Int(0))?;
                    } else if boolean {
                        state.make_constant(b, IrConst::Int(1))?;
                    }
                }
                Ok(())
            }
            GuardValue => {
                let (value, expected) = (op.arg(0), op.arg(1));
                let Some(constant) = expected.as_const() else {
                    return next.emit(op, state);
                };
                if state.is_virtual(value) {
                    return fail("a virtual is never a constant");
                }
                if let Some(known) = value.as_const() {
                    if known == constant {
                        state.stats.removed("rewrite.guard");
                        return Ok(());
                    }
                    return fail("different constant");
                }
                if let Some(c) = constant.as_int() {
                    if value.kind() == IrKind::Int && !state.bound(value).contains(c) {
                        return fail("constant outside the known range");
                    }
                }
                if constant.is_null() && state.is_nonnull(value) {
                    return fail("value is known non-null");
                }
                next.emit(op, state)?;
                if let IrValue::Box(b) = state.get_replacement(value) {
                    state.make_constant(b, constant)?;
                }
                Ok(())
            }
            GuardNonnull => {
                let value = op.arg(0);
                if state.is_nonnull(value) {
                    state.stats.removed("rewrite.guard");
                    return Ok(());
                }
                if state.is_null(value) {
                    return fail("value is null");
                }
                next.emit(op, state)?;
                state.mark_nonnull(value);
                Ok(())
            }
            GuardIsnull => {
                let value = op.arg(0);
                if state.is_null(value) {
                    state.stats.removed("rewrite.guard");
                    return Ok(());
                }
                if state.is_nonnull(value) {
                    return fail("value is known non-null");
                }
                next.emit(op, state)?;
                if let IrValue::Box(b) = state.get_replacement(value) {
                    state.make_constant(b, IrConst::NULL)?;
                }
                Ok(())
            }
            GuardClass | GuardNonnullClass => {
                let value = op.arg(0);
                let Some(vtable) = op.arg(1).as_int() else {
                    return next.emit(op, state);
                };
                if state.is_null(value) {
                    return fail("value is null");
                }
                match state.known_class(value) {
                    Some(known) if known as i64 == vtable => {
                        state.stats.removed("rewrite.guard");
                        return Ok(());
                    }
                    Some(_) => return fail("different class"),
                    None => {}
                }
                let op = if op.opcode == GuardNonnullClass && state.is_nonnull(value) {
                    op.with_opcode(GuardClass)
                } else {
                    op
                };
                next.emit(op, state)?;
                state.mark_class(value, vtable as usize);
                Ok(())
            }
            GuardNoException => {
                if !state.exception_pending() {
                    state.stats.removed("rewrite.guard");
                    return Ok(());
                }
                next.emit(op, state)
            }
            GuardNoOverflow | GuardOverflow if self.folded_ovf => {
                self.folded_ovf = false;
                if op.opcode == GuardOverflow {
                    return fail("the operation cannot overflow");
                }
                state.stats.removed("rewrite.guard");
                Ok(())
            }
            _ => next.emit(op, state),
        }
    }
}

impl OptimizationPass for Rewrite {
    fn name(&self) -> &'static str {
        "rewrite"
    }

    fn propagate_forward(
        &mut self,
        op: Operation,
        state: &mut OptState,
        next: &mut Chain<'_>,
    ) -> Result<(), InvalidLoop> {
        if op.is_guard() {
            return self.optimize_guard(op, state, next);
        }
        self.folded_ovf = false;

        if op.opcode.is_same_as() {
            return self.replace_with(&op, op.arg(0), state, "rewrite.same_as");
        }

        let constants: Option<Vec<IrConst>> = op.args.iter().map(|a| a.as_const()).collect();
        if let Some(constants) = constants {
            if let Some(folded) = fold_constants(op.opcode, &constants) {
                return self.replace_with(&op, IrValue::Const(folded), state, "rewrite.fold");
            }
            if let ([a, b], true) = (constants.as_slice(), op.opcode.is_ovf()) {
                if let (Some(a), Some(b)) = (a.as_int(), b.as_int()) {
                    if let Some((value, false)) = eval_ovf(op.opcode, a, b) {
                        self.folded_ovf = true;
                        return self.replace_with(&op, IrValue::int(value), state, "rewrite.fold");
                    }
                }
            }
        }

        if op.opcode.is_always_pure() {
            if let Some(value) = self.simplify(&op, state) {
                return self.replace_with(&op, value, state, "rewrite.identity");
            }
            if let Some(value) = self.find_rewritable_bool(&op, state) {
                return self.replace_with(&op, value, state, "rewrite.bool");
            }
        }

        next.emit(op, state)
    }
}

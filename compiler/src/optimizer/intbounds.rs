//! Integer range propagation
//!
//! Ranges flow forward through arithmetic and backward from guards on
//! comparisons. Overflow-checked operations whose ranges rule out overflow
//! lose the check and their guard.

use super::{Chain, IntBound, InvalidLoop, OptState, OptimizationPass};
use crate::ir::{IrBox, IrConst, Opcode, Operation};
use tracing::trace;

enum Overflow {
    /// The operation was proven not to overflow and its guard must go
    Impossible,
    /// Range of the result, valid once the no-overflow guard passed
    Checked(IrBox, IntBound),
}

pub struct IntBounds {
    pending: Option<Overflow>,
}

impl IntBounds {
    pub fn new() -> Self {
        Self { pending: None }
    }

    fn result_bound(op: &Operation, state: &OptState) -> Option<IntBound> {
        use Opcode::*;

        let arg = |i: usize| state.bound(op.arg(i));
        let bound = match op.opcode {
            IntAdd => arg(0).add(&arg(1)),
            IntSub => arg(0).sub(&arg(1)),
            IntMul => arg(0).mul(&arg(1)),
            IntNeg => arg(0).neg(),
            IntAnd => arg(0).and(&arg(1)),
            IntOr | IntXor => arg(0).or(&arg(1)),
            IntLshift => arg(0).lshift(&arg(1)),
            IntRshift => arg(0).rshift(&arg(1)),
            UintRshift => arg(0).urshift(&arg(1)),
            IntIsTrue | IntIsZero | FloatLt | FloatLe | FloatGt | FloatGe | FloatEq | FloatNe
            | PtrEq | PtrNe => IntBound::BOOL,
            ArraylenGc => IntBound::NONNEGATIVE,
            _ => return None,
        };
        Some(bound)
    }

    /// Outcome of a comparison that the ranges already decide
    fn known_comparison(op: &Operation, state: &OptState) -> Option<bool> {
        use Opcode::*;

        let (a, b) = (state.bound(op.arg(0)), state.bound(op.arg(1)));
        let unsigned = a.is_nonnegative() && b.is_nonnegative();
        let decide = |yes: bool, no: bool| {
            if yes {
                Some(true)
            } else if no {
                Some(false)
            } else {
                None
            }
        };
        match op.opcode {
            IntLt => decide(a.known_lt(&b), a.known_ge(&b)),
            IntLe => decide(a.known_le(&b), a.known_gt(&b)),
            IntGt => decide(a.known_gt(&b), a.known_le(&b)),
            IntGe => decide(a.known_ge(&b), a.known_lt(&b)),
            IntEq => decide(a.known_eq(&b), a.known_ne(&b)),
            IntNe => decide(a.known_ne(&b), a.known_eq(&b)),
            UintLt if unsigned => decide(a.known_lt(&b), a.known_ge(&b)),
            UintLe if unsigned => decide(a.known_le(&b), a.known_gt(&b)),
            UintGt if unsigned => decide(a.known_gt(&b), a.known_le(&b)),
            UintGe if unsigned => decide(a.known_ge(&b), a.known_lt(&b)),
            _ => None,
        }
    }

    fn optimize_ovf(
        &mut self,
        op: Operation,
        state: &mut OptState,
        next: &mut Chain<'_>,
    ) -> Result<(), InvalidLoop> {
        let (a, b) = (state.bound(op.arg(0)), state.bound(op.arg(1)));
        let (safe, checked) = match op.opcode {
            Opcode::IntAddOvf => (
                a.add_cannot_overflow(&b),
                IntBound::new(
                    a.lower.saturating_add(b.lower),
                    a.upper.saturating_add(b.upper),
                ),
            ),
            Opcode::IntSubOvf => (
                a.sub_cannot_overflow(&b),
                IntBound::new(
                    a.lower.saturating_sub(b.upper),
                    a.upper.saturating_sub(b.lower),
                ),
            ),
            _ => {
                let corners = [
                    a.lower.saturating_mul(b.lower),
                    a.lower.saturating_mul(b.upper),
                    a.upper.saturating_mul(b.lower),
                    a.upper.saturating_mul(b.upper),
                ];
                let lower = corners.iter().copied().min().unwrap_or(i64::MIN);
                let upper = corners.iter().copied().max().unwrap_or(i64::MAX);
                (a.mul_cannot_overflow(&b), IntBound::new(lower, upper))
            }
        };
        let result = op.result;
        match (safe, op.opcode.without_overflow(), result) {
            (true, Some(plain), Some(result)) => {
                trace!("intbounds: {} cannot overflow", op);
                state.stats.bump("intbounds.ovf");
                next.emit(op.with_opcode(plain), state)?;
                self.pending = Some(Overflow::Impossible);
                state.intersect_bound(result.into(), checked)
            }
            (_, _, Some(result)) => {
                next.emit(op, state)?;
                self.pending = Some(Overflow::Checked(result, checked));
                Ok(())
            }
            _ => next.emit(op, state),
        }
    }

    fn optimize_overflow_guard(
        &mut self,
        op: Operation,
        state: &mut OptState,
        next: &mut Chain<'_>,
    ) -> Result<(), InvalidLoop> {
        match (self.pending.take(), op.opcode) {
            (Some(Overflow::Impossible), Opcode::GuardNoOverflow) => {
                state.stats.removed("intbounds.guard");
                Ok(())
            }
            (Some(Overflow::Impossible), _) => Err(InvalidLoop::new(
                "guard_overflow after an operation that cannot overflow",
            )),
            (Some(Overflow::Checked(result, bound)), Opcode::GuardNoOverflow) => {
                next.emit(op, state)?;
                state.intersect_bound(result.into(), bound)
            }
            _ => next.emit(op, state),
        }
    }

    /// Narrow the arguments of the comparison behind a passed guard
    fn propagate_guard(
        &self,
        def: Option<Operation>,
        holds: bool,
        state: &mut OptState,
    ) -> Result<(), InvalidLoop> {
        use Opcode::*;

        let Some(def) = def else {
            return Ok(());
        };
        if def.num_args() == 1 {
            let zero = match (def.opcode, holds) {
                (IntIsTrue, false) | (IntIsZero, true) => true,
                _ => false,
            };
            if zero {
                state.intersect_bound(def.arg(0), IntBound::exact(0))?;
            }
            return Ok(());
        }
        if def.num_args() != 2 {
            return Ok(());
        }
        // normalize to the comparison that holds
        let opcode = if holds {
            Some(def.opcode)
        } else {
            def.opcode.bool_inverse()
        };
        let (a, b) = (def.arg(0), def.arg(1));
        let (mut ba, mut bb) = (state.bound(a), state.bound(b));
        let unsigned = ba.is_nonnegative() && bb.is_nonnegative();
        let ok = match opcode {
            Some(IntLt) => ba.make_lt(&state.bound(b)) && bb.make_gt(&state.bound(a)),
            Some(IntLe) => ba.make_le(&state.bound(b)) && bb.make_ge(&state.bound(a)),
            Some(IntGt) => ba.make_gt(&state.bound(b)) && bb.make_lt(&state.bound(a)),
            Some(IntGe) => ba.make_ge(&state.bound(b)) && bb.make_le(&state.bound(a)),
            Some(IntEq) => match ba.intersect(&bb) {
                Some(both) => {
                    ba = both;
                    bb = both;
                    true
                }
                None => false,
            },
            // a <u b with b >= 0 implies 0 <= a < b
            Some(UintLt) if bb.is_nonnegative() => {
                ba.make_ge(&IntBound::exact(0)) && ba.make_lt(&state.bound(b))
            }
            Some(UintLe) if bb.is_nonnegative() => {
                ba.make_ge(&IntBound::exact(0)) && ba.make_le(&state.bound(b))
            }
            Some(UintGt) if unsigned => ba.make_gt(&state.bound(b)) && bb.make_lt(&state.bound(a)),
            Some(UintGe) if unsigned => ba.make_ge(&state.bound(b)) && bb.make_le(&state.bound(a)),
            _ => return Ok(()),
        };
        if !ok {
            return Err(InvalidLoop::new(format!("{} can never be {}", def, holds)));
        }
        state.intersect_bound(a, ba)?;
        state.intersect_bound(b, bb)
    }
}

impl OptimizationPass for IntBounds {
    fn name(&self) -> &'static str {
        "intbounds"
    }

    fn propagate_forward(
        &mut self,
        op: Operation,
        state: &mut OptState,
        next: &mut Chain<'_>,
    ) -> Result<(), InvalidLoop> {
        if op.opcode.is_overflow_guard() {
            return self.optimize_overflow_guard(op, state, next);
        }
        self.pending = None;

        if op.opcode.is_ovf() {
            return self.optimize_ovf(op, state, next);
        }

        match op.opcode {
            Opcode::GuardTrue | Opcode::GuardFalse => {
                let def = state.definition(op.arg(0)).cloned();
                let holds = op.opcode == Opcode::GuardTrue;
                next.emit(op, state)?;
                return self.propagate_guard(def, holds, state);
            }
            Opcode::GuardValue => {
                let def = state.definition(op.arg(0)).cloned();
                let expected = op.arg(1).as_int();
                next.emit(op, state)?;
                if let Some(c) = expected {
                    return self.propagate_guard(def, c != 0, state);
                }
                return Ok(());
            }
            _ => {}
        }

        if op.opcode.is_comparison() && op.num_args() == 2 {
            if let (Some(known), Some(result)) = (Self::known_comparison(&op, state), op.result) {
                trace!("intbounds: {} is always {}", op, known);
                state.make_constant(result, IrConst::bool(known))?;
                state.stats.removed("intbounds.compare");
                return Ok(());
            }
        }

        let bound = Self::result_bound(&op, state).or_else(|| {
            (op.opcode.is_comparison()).then_some(IntBound::BOOL)
        });
        let result = op.result;
        match (bound, result) {
            (Some(bound), Some(result)) => {
                if let (Some(c), true) = (bound.constant(), op.opcode.is_always_pure()) {
                    trace!("intbounds: {} is always {}", op, c);
                    state.make_constant(result, IrConst::Int(c))?;
                    state.stats.removed("intbounds.constant");
                    return Ok(());
                }
                next.emit(op, state)?;
                state.intersect_bound(result.into(), bound)
            }
            _ => next.emit(op, state),
        }
    }
}

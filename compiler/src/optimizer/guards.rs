//! Guard strengthening
//!
//! A pointer guard that follows an earlier, weaker guard on the same box is
//! folded into the earlier one. The earlier guard keeps its descriptor id and
//! snapshot, which is older and therefore valid for the stronger check too.
//! Only implied checks are folded: `guard_class` absorbs `guard_nonnull`, and
//! `guard_value` absorbs `guard_nonnull`. A constant says nothing about the
//! class, so `guard_value` never replaces a class guard.

use super::{resume_data, Chain, InvalidLoop, OptState, OptimizationPass};
use crate::ir::{Descr, IrId, IrKind, IrValue, Opcode, Operation};
use fxhash::FxHashMap;
use smallvec::smallvec;
use tracing::trace;

pub struct GuardMerge {
    /// Output index of the last pointer guard on each box
    last: FxHashMap<IrId, usize>,
}

impl GuardMerge {
    pub fn new() -> Self {
        Self {
            last: FxHashMap::default(),
        }
    }

    fn previous(&self, state: &OptState, value: IrValue) -> Option<(usize, Opcode)> {
        let IrValue::Box(b) = value else {
            return None;
        };
        let index = *self.last.get(&b.id())?;
        let op = state.output().get(index)?;
        (op.args.first() == Some(&value)).then_some((index, op.opcode))
    }

    fn emit_tracked(
        &mut self,
        op: Operation,
        state: &mut OptState,
        next: &mut Chain<'_>,
    ) -> Result<(), InvalidLoop> {
        let subject = state.get_replacement(op.arg(0));
        let opcode = op.opcode;
        let index = state.output().len();
        next.emit(op, state)?;
        if let IrValue::Box(b) = subject {
            if state.output().get(index).map(|o| o.opcode) == Some(opcode) {
                self.last.insert(b.id(), index);
            }
        }
        Ok(())
    }

    /// Turn the emitted guard at `index` into `opcode(subject, operand)`
    fn strengthen(state: &mut OptState, index: usize, opcode: Opcode, subject: IrValue, operand: IrValue) {
        let operand = state.get_replacement(operand);
        let Some(earlier) = state.output_mut().get_mut(index) else {
            return;
        };
        trace!("guard_merge: {} becomes {}", earlier, opcode);
        earlier.opcode = opcode;
        earlier.args = smallvec![subject, operand];
        // the recorded continuation only covers the weaker failure
        earlier.branch = None;
        if let Some(resolved) = earlier.fail_descr().cloned() {
            let descr = resume_data::retarget(earlier, &resolved);
            earlier.descr = Some(Descr::Fail(descr));
        }
    }
}

impl OptimizationPass for GuardMerge {
    fn name(&self) -> &'static str {
        "guard_merge"
    }

    fn propagate_forward(
        &mut self,
        op: Operation,
        state: &mut OptState,
        next: &mut Chain<'_>,
    ) -> Result<(), InvalidLoop> {
        match op.opcode {
            Opcode::GuardNonnull => self.emit_tracked(op, state, next),
            Opcode::GuardClass | Opcode::GuardNonnullClass => {
                let subject = state.get_replacement(op.arg(0));
                if let Some((index, Opcode::GuardNonnull)) = self.previous(state, subject) {
                    Self::strengthen(state, index, Opcode::GuardNonnullClass, subject, op.arg(1));
                    state.stats.removed("guard_merge.class");
                    return Ok(());
                }
                self.emit_tracked(op, state, next)
            }
            Opcode::GuardValue if op.arg(0).kind() == IrKind::Ref => {
                let subject = state.get_replacement(op.arg(0));
                let operand = state.get_replacement(op.arg(1));
                if let Some((index, Opcode::GuardNonnull)) = self.previous(state, subject) {
                    if operand.as_const().map_or(false, |c| !c.is_null()) {
                        Self::strengthen(state, index, Opcode::GuardValue, subject, operand);
                        state.stats.removed("guard_merge.value");
                        return Ok(());
                    }
                }
                self.emit_tracked(op, state, next)
            }
            _ => next.emit(op, state),
        }
    }

    fn flush(&mut self, _state: &mut OptState, _next: &mut Chain<'_>) -> Result<(), InvalidLoop> {
        self.last.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::ir::lowering::lower_text;
    use crate::ir::{IdAllocator, Opcode, Trace};
    use crate::optimizer::{optimize_linear, OptimizerConfig};
    use std::sync::Arc;

    fn optimize(text: &str) -> (Trace, Trace) {
        let ids = Arc::new(IdAllocator::new());
        let lowered = lower_text(text, ids.clone()).unwrap();
        let (optimized, _) = optimize_linear(&lowered.trace, &OptimizerConfig::default(), &ids).unwrap();
        (lowered.trace, optimized)
    }

    #[test]
    fn test_nonnull_and_class_become_one_guard() {
        let (recorded, optimized) = optimize(
            "
            descr Node = struct(vtable=0x1000)
            [p0]
            guard_nonnull(p0) [p0]
            guard_class(p0, @Node) [p0]
            finish(p0)
            ",
        );
        assert_eq!(optimized.len(), 2);
        let guard = &optimized.ops[0];
        assert_eq!(guard.opcode, Opcode::GuardNonnullClass);
        assert_eq!(guard.arg(1).as_int(), Some(0x1000));

        let descr = guard.fail_descr().unwrap();
        assert_eq!(descr.guard(), Opcode::GuardNonnullClass);
        assert_eq!(Some(descr.id()), recorded.guards().next().map(|g| g.id()));
    }

    #[test]
    fn test_value_absorbs_nonnull() {
        let (_, optimized) = optimize(
            "
            [p0]
            guard_nonnull(p0) [p0]
            guard_value(p0, ConstPtr(0x20)) [p0]
            finish(p0)
            ",
        );
        assert_eq!(optimized.len(), 2);
        let guard = &optimized.ops[0];
        assert_eq!(guard.opcode, Opcode::GuardValue);

        let descr = guard.fail_descr().unwrap();
        assert_eq!(descr.guard(), Opcode::GuardValue);
        let slot = descr.value_index().expect("checked value has a fail-arg slot");
        assert_eq!(guard.arg(0).as_box(), Some(descr.fail_args()[slot]));
    }

    #[test]
    fn test_value_keeps_class_guard() {
        let (_, optimized) = optimize(
            "
            descr Node = struct(vtable=0x1000)
            [p0]
            guard_class(p0, @Node) [p0]
            guard_value(p0, ConstPtr(0x20)) [p0]
            finish(p0)
            ",
        );
        assert_eq!(optimized.count(Opcode::GuardClass), 1);
        assert_eq!(optimized.count(Opcode::GuardValue), 1);
        assert_eq!(optimized.ops[0].opcode, Opcode::GuardClass);
    }
}

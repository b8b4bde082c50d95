//! Common subexpression elimination for pure operations

use super::{Chain, InvalidLoop, OptState, OptimizationPass};
use crate::ir::{ArgList, Descr, DescrKey, IrValue, Opcode, Operation};
use indexmap::IndexMap;
use tracing::trace;

/// Identity of a pure computation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PureKey {
    pub opcode: Opcode,
    pub args: ArgList,
    pub descr: Option<DescrKey>,
}

impl PureKey {
    pub fn new(opcode: Opcode, args: impl IntoIterator<Item = IrValue>, descr: Option<&Descr>) -> Self {
        Self {
            opcode,
            args: args.into_iter().collect(),
            descr: descr.map(|d| d.key()),
        }
    }

    pub fn of(op: &Operation) -> Self {
        Self::new(op.opcode, op.args.iter().copied(), op.descr.as_ref())
    }
}

#[derive(Debug, Clone)]
struct PureEntry {
    value: IrValue,
    descr: Option<Descr>,
}

/// Results of pure operations emitted so far, in emission order
#[derive(Debug, Clone, Default)]
pub struct PureCache {
    entries: IndexMap<PureKey, PureEntry>,
}

impl PureCache {
    pub fn lookup(&self, key: &PureKey) -> Option<IrValue> {
        self.entries.get(key).map(|e| e.value)
    }

    /// Look up `op`, also trying swapped arguments of commutative operations
    pub fn lookup_op(&self, op: &Operation) -> Option<IrValue> {
        let key = PureKey::of(op);
        if let Some(value) = self.lookup(&key) {
            return Some(value);
        }
        if op.opcode.is_commutative() && op.num_args() == 2 {
            let swapped = PureKey::new(op.opcode, [op.arg(1), op.arg(0)], op.descr.as_ref());
            return self.lookup(&swapped);
        }
        None
    }

    pub fn insert(&mut self, key: PureKey, value: IrValue, descr: Option<Descr>) {
        self.entries.insert(key, PureEntry { value, descr });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PureKey, Option<&Descr>, IrValue)> {
        self.entries
            .iter()
            .map(|(key, entry)| (key, entry.descr.as_ref(), entry.value))
    }
}

/// Removes pure operations whose result is already known.
///
/// An overflow-checked operation is held back until its overflow guard
/// arrives, because the pair can only be removed together.
pub struct Pure {
    postponed: Option<Operation>,
}

impl Pure {
    pub fn new() -> Self {
        Self { postponed: None }
    }

    fn emit_pure(
        &mut self,
        op: Operation,
        state: &mut OptState,
        next: &mut Chain<'_>,
    ) -> Result<(), InvalidLoop> {
        let key = PureKey::of(&op);
        let descr = op.descr.clone();
        let result = op.result;
        next.emit(op, state)?;
        if let Some(result) = result {
            let value = state.get_replacement(result.into());
            state.pure.insert(key, value, descr);
        }
        Ok(())
    }
}

impl OptimizationPass for Pure {
    fn name(&self) -> &'static str {
        "pure"
    }

    fn propagate_forward(
        &mut self,
        op: Operation,
        state: &mut OptState,
        next: &mut Chain<'_>,
    ) -> Result<(), InvalidLoop> {
        if op.opcode.is_overflow_guard() {
            let Some(ovf) = self.postponed.take() else {
                return next.emit(op, state);
            };
            if op.opcode == Opcode::GuardNoOverflow {
                if let (Some(previous), Some(result)) = (state.pure.lookup_op(&ovf), ovf.result) {
                    trace!("pure: {} and its overflow guard are redundant", ovf);
                    state.make_equal_to(result, previous)?;
                    state.stats.removed("pure.ovf");
                    state.stats.removed("pure.ovf");
                    return Ok(());
                }
                self.emit_pure(ovf, state, next)?;
            } else {
                next.emit(ovf, state)?;
            }
            return next.emit(op, state);
        }

        self.flush(state, next)?;

        if op.opcode.is_ovf() {
            self.postponed = Some(op);
            return Ok(());
        }

        if op.opcode.is_always_pure() {
            if let (Some(previous), Some(result)) = (state.pure.lookup_op(&op), op.result) {
                trace!("pure: {} already computed as {}", op, previous);
                state.make_equal_to(result, previous)?;
                state.stats.removed("pure.cse");
                return Ok(());
            }
            return self.emit_pure(op, state, next);
        }

        next.emit(op, state)
    }

    fn flush(&mut self, state: &mut OptState, next: &mut Chain<'_>) -> Result<(), InvalidLoop> {
        match self.postponed.take() {
            Some(op) => next.emit(op, state),
            None => Ok(()),
        }
    }
}

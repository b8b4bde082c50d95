//! Field and array-item caching

use super::{Chain, InvalidLoop, OptState, OptimizationPass};
use crate::ir::{
    ArrayDescr, CallDescr, DescrId, EffectInfo, FieldDescr, IrValue, Opcode, Operation,
};
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::trace;

type FieldEntries = IndexMap<IrValue, IrValue>;
type ItemEntries = IndexMap<(IrValue, i64), IrValue>;

/// Known contents of heap locations, keyed by descriptor then object
#[derive(Debug, Clone, Default)]
pub struct HeapCache {
    fields: IndexMap<DescrId, (Arc<FieldDescr>, FieldEntries)>,
    items: IndexMap<DescrId, (Arc<ArrayDescr>, ItemEntries)>,
}

impl HeapCache {
    pub fn field(&self, object: IrValue, descr: &FieldDescr) -> Option<IrValue> {
        self.fields
            .get(&descr.id)
            .and_then(|(_, entries)| entries.get(&object))
            .copied()
    }

    /// Remember a value read from or written to `object`
    pub fn set_field(&mut self, object: IrValue, descr: &Arc<FieldDescr>, value: IrValue) {
        self.fields
            .entry(descr.id)
            .or_insert_with(|| (descr.clone(), IndexMap::new()))
            .1
            .insert(object, value);
    }

    /// A store to `object`; any other object may alias it
    pub fn write_field(&mut self, object: IrValue, descr: &Arc<FieldDescr>, value: IrValue) {
        if let Some((_, entries)) = self.fields.get_mut(&descr.id) {
            entries.clear();
        }
        self.set_field(object, descr, value);
    }

    pub fn array_item(&self, array: IrValue, descr: &ArrayDescr, index: i64) -> Option<IrValue> {
        self.items
            .get(&descr.id)
            .and_then(|(_, entries)| entries.get(&(array, index)))
            .copied()
    }

    pub fn set_array_item(
        &mut self,
        array: IrValue,
        descr: &Arc<ArrayDescr>,
        index: i64,
        value: IrValue,
    ) {
        self.items
            .entry(descr.id)
            .or_insert_with(|| (descr.clone(), IndexMap::new()))
            .1
            .insert((array, index), value);
    }

    /// A store at `index`; without a constant index every item of the descriptor is dropped
    pub fn write_array_item(
        &mut self,
        array: IrValue,
        descr: &Arc<ArrayDescr>,
        index: Option<i64>,
        value: IrValue,
    ) {
        let Some((_, entries)) = self.items.get_mut(&descr.id) else {
            if let Some(index) = index {
                self.set_array_item(array, descr, index, value);
            }
            return;
        };
        match index {
            Some(index) => {
                // another array with the same descriptor may be the same object
                entries.retain(|(a, i), _| *a == array || *i != index);
                entries.insert((array, index), value);
            }
            None => entries.clear(),
        }
    }

    /// Forget everything a call with `effect` may overwrite
    pub fn invalidate(&mut self, effect: &EffectInfo) {
        for (descr, entries) in self.fields.values_mut() {
            if !descr.immutable && effect.may_write(descr.effect_class) {
                entries.clear();
            }
        }
        for (descr, entries) in self.items.values_mut() {
            if effect.may_write(descr.effect_class) {
                entries.clear();
            }
        }
    }

    pub fn clear(&mut self) {
        self.fields.clear();
        self.items.clear();
    }

    pub fn fields(&self) -> impl Iterator<Item = (&Arc<FieldDescr>, IrValue, IrValue)> {
        self.fields.values().flat_map(|(descr, entries)| {
            entries
                .iter()
                .map(move |(object, value)| (descr, *object, *value))
        })
    }

    pub fn array_items(&self) -> impl Iterator<Item = (&Arc<ArrayDescr>, IrValue, i64, IrValue)> {
        self.items.values().flat_map(|(descr, entries)| {
            entries
                .iter()
                .map(move |((array, index), value)| (descr, *array, *index, *value))
        })
    }
}

/// Removes redundant loads and stores
pub struct Heap;

impl Heap {
    pub fn new() -> Self {
        Self
    }
}

fn field_descr(op: &Operation) -> Result<Arc<FieldDescr>, InvalidLoop> {
    op.descr
        .as_ref()
        .and_then(|d| d.as_field())
        .cloned()
        .ok_or_else(|| InvalidLoop::new(format!("{} without field descriptor", op.opcode)))
}

fn array_descr(op: &Operation) -> Result<Arc<ArrayDescr>, InvalidLoop> {
    op.descr
        .as_ref()
        .and_then(|d| d.as_array())
        .cloned()
        .ok_or_else(|| InvalidLoop::new(format!("{} without array descriptor", op.opcode)))
}

impl OptimizationPass for Heap {
    fn name(&self) -> &'static str {
        "heap"
    }

    fn propagate_forward(
        &mut self,
        op: Operation,
        state: &mut OptState,
        next: &mut Chain<'_>,
    ) -> Result<(), InvalidLoop> {
        use Opcode::*;

        match op.opcode {
            GetfieldGcI | GetfieldGcR | GetfieldGcF => {
                let descr = field_descr(&op)?;
                let object = op.arg(0);
                if let (Some(known), Some(result)) = (state.heap.field(object, &descr), op.result) {
                    trace!("heap: {} is {}", op, known);
                    state.make_equal_to(result, known)?;
                    state.stats.removed("heap.load");
                    return Ok(());
                }
                let result = op.result;
                next.emit(op, state)?;
                if let Some(result) = result {
                    let value = state.get_replacement(result.into());
                    state.heap.set_field(object, &descr, value);
                }
                Ok(())
            }
            SetfieldGc => {
                let descr = field_descr(&op)?;
                let (object, value) = (op.arg(0), op.arg(1));
                if state.heap.field(object, &descr) == Some(value) {
                    trace!("heap: {} stores the known value", op);
                    state.stats.removed("heap.store");
                    return Ok(());
                }
                next.emit(op, state)?;
                state.heap.write_field(object, &descr, value);
                Ok(())
            }
            GetarrayitemGcI | GetarrayitemGcR | GetarrayitemGcF => {
                let descr = array_descr(&op)?;
                let (array, index) = (op.arg(0), op.arg(1).as_int());
                if let (Some(index), Some(result)) = (index, op.result) {
                    if let Some(known) = state.heap.array_item(array, &descr, index) {
                        state.make_equal_to(result, known)?;
                        state.stats.removed("heap.load");
                        return Ok(());
                    }
                }
                let result = op.result;
                next.emit(op, state)?;
                if let (Some(index), Some(result)) = (index, result) {
                    let value = state.get_replacement(result.into());
                    state.heap.set_array_item(array, &descr, index, value);
                }
                Ok(())
            }
            SetarrayitemGc => {
                let descr = array_descr(&op)?;
                let (array, index, value) = (op.arg(0), op.arg(1).as_int(), op.arg(2));
                if let Some(index) = index {
                    if state.heap.array_item(array, &descr, index) == Some(value) {
                        state.stats.removed("heap.store");
                        return Ok(());
                    }
                }
                next.emit(op, state)?;
                state.heap.write_array_item(array, &descr, index, value);
                Ok(())
            }
            CallPureI | CallPureR | CallPureF => next.emit(op, state),
            opcode if opcode.is_call() => {
                let effect = op
                    .descr
                    .as_ref()
                    .and_then(|d| d.as_call())
                    .map(|c: &Arc<CallDescr>| c.effect.clone())
                    .unwrap_or_else(EffectInfo::unknown);
                next.emit(op, state)?;
                state.heap.invalidate(&effect);
                Ok(())
            }
            _ => next.emit(op, state),
        }
    }
}

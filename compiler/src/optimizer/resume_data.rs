//! Guard resume data finalization
//!
//! A recorded guard carries the raw snapshot taken by the recorder. When the
//! guard is emitted, every snapshot value is resolved through the current
//! replacements; values that are still virtual become virtual descriptions
//! so the allocation can be redone if the guard fails.

use super::{OptState, VirtualObject};
use crate::ir::{IrBox, IrId, IrValue, Opcode, Operation};
use crate::resume::{FailDescr, Snapshot, SnapshotValue, VirtualDescription};
use fxhash::FxHashMap;
use std::sync::Arc;

struct ResumeBuilder<'s> {
    state: &'s mut OptState,
    virtuals: Vec<Option<VirtualDescription>>,
    seen: FxHashMap<IrId, usize>,
}

impl ResumeBuilder<'_> {
    fn frame(&mut self, raw: &Arc<Snapshot>) -> Arc<Snapshot> {
        let prev = raw.prev.as_ref().map(|p| self.frame(p));
        let mut values = Vec::with_capacity(raw.values.len());
        for value in &raw.values {
            let resolved = match *value {
                SnapshotValue::Value(v) => self.resolve(v),
                other => other,
            };
            values.push(resolved);
        }

        let key = Arc::as_ptr(raw) as usize;
        if let Some((_, cached)) = self.state.resume_cache.get(&key) {
            let same_prev = match (&prev, &cached.prev) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            };
            if same_prev && cached.values == values {
                return cached.clone();
            }
        }

        let has_virtuals = values
            .iter()
            .any(|v| matches!(v, SnapshotValue::Virtual(_)));
        let frame = Snapshot::new(raw.position, values, prev);
        if !has_virtuals {
            self.state
                .resume_cache
                .insert(key, (raw.clone(), frame.clone()));
        }
        frame
    }

    fn resolve(&mut self, value: IrValue) -> SnapshotValue {
        let value = self.state.get_replacement(value);
        let IrValue::Box(b) = value else {
            return SnapshotValue::Value(value);
        };
        if let Some(&index) = self.seen.get(&b.id()) {
            return SnapshotValue::Virtual(index);
        }
        let Some(object) = self.state.virtual_object(value).cloned() else {
            return SnapshotValue::Value(value);
        };

        // registered before the fields so cycles point back at it
        let index = self.virtuals.len();
        self.seen.insert(b.id(), index);
        self.virtuals.push(None);

        let description = match object {
            VirtualObject::Struct { descr, fields } => {
                let mut resolved = Vec::with_capacity(fields.len());
                for (_, (field, v)) in fields {
                    let slot = self.resolve(v);
                    resolved.push((field, slot));
                }
                VirtualDescription::Struct {
                    descr,
                    fields: resolved,
                }
            }
            VirtualObject::Array { descr, items } => {
                let mut resolved = Vec::with_capacity(items.len());
                for item in items {
                    resolved.push(self.resolve(item));
                }
                VirtualDescription::Array {
                    descr,
                    items: resolved,
                }
            }
        };
        self.virtuals[index] = Some(description);
        SnapshotValue::Virtual(index)
    }
}

fn collect_boxes(values: &[SnapshotValue], seen: &mut FxHashMap<IrId, ()>, out: &mut Vec<IrBox>) {
    for value in values {
        if let SnapshotValue::Value(IrValue::Box(b)) = value {
            if seen.insert(b.id(), ()).is_none() {
                out.push(*b);
            }
        }
    }
}

/// Resolve the recorded resume data of `guard` against the current state
pub(super) fn finalize(state: &mut OptState, guard: &Operation, raw: &Arc<FailDescr>) -> Arc<FailDescr> {
    let mut builder = ResumeBuilder {
        state,
        virtuals: Vec::new(),
        seen: FxHashMap::default(),
    };
    let snapshot = builder.frame(raw.snapshot());
    let virtuals: Vec<VirtualDescription> = builder.virtuals.into_iter().flatten().collect();

    let mut seen = FxHashMap::default();
    let mut fail_args = Vec::new();
    for frame in snapshot.frames() {
        collect_boxes(&frame.values, &mut seen, &mut fail_args);
    }
    for description in &virtuals {
        match description {
            VirtualDescription::Struct { fields, .. } => {
                let values: Vec<SnapshotValue> = fields.iter().map(|(_, v)| *v).collect();
                collect_boxes(&values, &mut seen, &mut fail_args);
            }
            VirtualDescription::Array { items, .. } => {
                collect_boxes(items, &mut seen, &mut fail_args);
            }
        }
    }

    let value_index = checked_slot(guard, &mut fail_args);
    FailDescr::resolved(
        raw.id(),
        guard.opcode,
        fail_args,
        snapshot,
        virtuals,
        value_index,
    )
}

/// Fail-arg slot of the box a `guard_value` checks, appending it when missing
fn checked_slot(guard: &Operation, fail_args: &mut Vec<IrBox>) -> Option<usize> {
    match (guard.opcode, guard.args.first()) {
        (Opcode::GuardValue, Some(IrValue::Box(checked))) => {
            match fail_args.iter().position(|b| b.id() == checked.id()) {
                Some(index) => Some(index),
                None => {
                    fail_args.push(*checked);
                    Some(fail_args.len() - 1)
                }
            }
        }
        _ => None,
    }
}

/// Resume data of an emitted guard whose opcode or arguments were rewritten
/// in place. Keeps the descriptor id, snapshot and virtual descriptions.
pub(super) fn retarget(guard: &Operation, resolved: &Arc<FailDescr>) -> Arc<FailDescr> {
    let mut fail_args = resolved.fail_args().to_vec();
    let value_index = checked_slot(guard, &mut fail_args);
    FailDescr::resolved(
        resolved.id(),
        guard.opcode,
        fail_args,
        resolved.snapshot().clone(),
        resolved.virtuals().to_vec(),
        value_index,
    )
}
